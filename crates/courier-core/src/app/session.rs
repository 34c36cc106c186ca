//! Session export: what one worker run did, written on every stop.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::StopReason;
use crate::domain::{WorkId, WorkerError, WorkerId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub completed: u32,
    pub failed: u32,
    pub claims_won: u32,
    pub claims_lost: u32,
    pub idle_polls: u32,
    pub consecutive_no_work: u32,
    pub infra_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Completed,
    Failed,
    ClaimLost,
    /// The claim was revoked while processing; the result was dropped.
    ClaimRevoked,
    InfrastructureError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    pub outcome: HistoryOutcome,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub worker_id: WorkerId,
    pub environment: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub counters: SessionCounters,
    pub work_history: Vec<HistoryEntry>,
}

impl SessionExport {
    pub fn new(worker_id: WorkerId, environment: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            environment: environment.into(),
            start_time,
            end_time: None,
            stop_reason: None,
            counters: SessionCounters::default(),
            work_history: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        work_id: Option<&WorkId>,
        outcome: HistoryOutcome,
        at: DateTime<Utc>,
        detail: Option<String>,
    ) {
        self.work_history.push(HistoryEntry {
            work_id: work_id.cloned(),
            outcome,
            at,
            detail,
        });
    }

    /// Ids this worker completed, in order.
    pub fn completed_ids(&self) -> Vec<&WorkId> {
        self.ids_with(HistoryOutcome::Completed)
    }

    pub fn ids_with(&self, outcome: HistoryOutcome) -> Vec<&WorkId> {
        self.work_history
            .iter()
            .filter(|e| e.outcome == outcome)
            .filter_map(|e| e.work_id.as_ref())
            .collect()
    }

    pub fn finish(&mut self, reason: StopReason, at: DateTime<Utc>) {
        self.stop_reason = Some(reason);
        self.end_time = Some(at);
    }

    pub fn file_name(&self) -> String {
        format!("session_{}.json", self.worker_id)
    }

    /// Write `<dir>/session_<worker_id>.json`; returns the path.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, WorkerError> {
        let path = dir.join(self.file_name());
        let export_err = |source| WorkerError::Export {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(dir).await.map_err(export_err)?;
        let json = serde_json::to_vec_pretty(self).map_err(|e| export_err(std::io::Error::other(e)))?;
        tokio::fs::write(&path, json).await.map_err(export_err)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::at;

    #[tokio::test]
    async fn export_lands_under_worker_specific_name() {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerId::parse("host_1_0000beef").unwrap();
        let mut session = SessionExport::new(worker, "testing", at(0));
        let w1 = WorkId::parse("W1").unwrap();
        session.record(Some(&w1), HistoryOutcome::Completed, at(5), None);
        session.record(None, HistoryOutcome::InfrastructureError, at(6), Some("offline".into()));
        session.counters.completed = 1;
        session.finish(StopReason::TargetReached, at(10));

        let path = session.write_to(&dir.path().join("nested")).await.unwrap();
        assert!(path.ends_with("session_host_1_0000beef.json"));

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["stop_reason"], "target_reached");
        assert_eq!(written["counters"]["completed"], 1);
        assert_eq!(written["work_history"][0]["work_id"], "W1");
        assert!(written["work_history"][1].get("work_id").is_none());

        let back: SessionExport = serde_json::from_value(written).unwrap();
        assert_eq!(back.completed_ids(), vec![&w1]);
    }
}
