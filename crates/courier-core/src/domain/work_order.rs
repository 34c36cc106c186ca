//! Work order record: the serialized unit stored in each bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{InvariantViolation, TransitionError};
use super::ids::{WorkId, WorkerId};
use super::state::{Bucket, WorkStatus};

/// Who holds a work order and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

/// Failure history carried across retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkError {
    pub message: String,
    /// Only ever increases.
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// Input for a brand new work order, as produced by a work source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSeed {
    pub target_identifier: String,
    pub target_endpoint: String,
    #[serde(default)]
    pub processed_subunits: Vec<String>,
}

/// One unit of scraping work.
///
/// Design:
/// - This is the single source of truth for an order's state; the bucket it
///   sits in must always equal `status.bucket()`.
/// - State transitions happen only through the methods below, which refuse to
///   run from the wrong status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub work_id: WorkId,
    pub target_identifier: String,
    pub target_endpoint: String,

    /// Sub-tasks already done by earlier attempts, used to resume.
    #[serde(default)]
    pub processed_subunits: Vec<String>,

    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkOrder {
    pub fn new(work_id: WorkId, seed: WorkSeed, now: DateTime<Utc>) -> Self {
        Self {
            work_id,
            target_identifier: seed.target_identifier,
            target_endpoint: seed.target_endpoint,
            processed_subunits: seed.processed_subunits,
            status: WorkStatus::Available,
            created_at: now,
            updated_at: now,
            claim: None,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    /// Number of failed attempts so far.
    pub fn attempt_count(&self) -> u32 {
        self.error.as_ref().map_or(0, |e| e.attempt_count)
    }

    /// Worker currently holding the claim, if any.
    pub fn claimed_by(&self) -> Option<&WorkerId> {
        self.claim.as_ref().map(|c| &c.worker_id)
    }

    pub fn bucket(&self) -> Bucket {
        self.status.bucket()
    }

    fn ensure(&self, allowed: &[WorkStatus], action: &'static str) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                work_id: self.work_id.clone(),
                status: self.status,
                action,
            })
        }
    }

    /// Available -> Claimed, embedding the winner's claim.
    pub fn claim(&mut self, worker_id: WorkerId, claimed_at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Available], "claim")?;
        self.status = WorkStatus::Claimed;
        self.claim = Some(Claim {
            worker_id,
            claimed_at,
        });
        self.updated_at = claimed_at;
        Ok(())
    }

    /// Claimed -> Active, right before the executor runs.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Claimed], "activate")?;
        self.status = WorkStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    /// Claimed/Active -> Completed. The claim is dropped with the status.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Claimed, WorkStatus::Active], "complete")?;
        self.status = WorkStatus::Completed;
        self.claim = None;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Claimed/Active -> Failed, bumping the attempt count.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Claimed, WorkStatus::Active], "fail")?;
        self.status = WorkStatus::Failed;
        self.claim = None;
        self.record_attempt(message.into(), now);
        Ok(())
    }

    /// Claimed/Active -> Available after the claim went stale.
    ///
    /// Nothing failed, so `attempt_count` and `error` are left as they were.
    pub fn release_claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Claimed, WorkStatus::Active], "release")?;
        self.status = WorkStatus::Available;
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }

    /// Failed -> Available (retry promotion).
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Failed], "requeue")?;
        self.status = WorkStatus::Available;
        self.updated_at = now;
        Ok(())
    }

    /// Failed/Available -> PermanentlyFailed once the ceiling is reached.
    pub fn mark_permanently_failed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Failed, WorkStatus::Available], "mark permanently failed")?;
        self.status = WorkStatus::PermanentlyFailed;
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }

    /// Completed -> Archived.
    pub fn archive(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure(&[WorkStatus::Completed], "archive")?;
        self.status = WorkStatus::Archived;
        self.updated_at = now;
        Ok(())
    }

    fn record_attempt(&mut self, message: String, now: DateTime<Utc>) {
        let attempt_count = self.attempt_count() + 1;
        self.error = Some(WorkError {
            message,
            attempt_count,
            last_attempt_at: now,
        });
        self.updated_at = now;
    }

    /// Check that the fields agree with the status.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let violation = |reason: &str| InvariantViolation {
            work_id: self.work_id.clone(),
            reason: reason.to_string(),
        };
        if self.status.holds_claim() != self.claim.is_some() {
            return Err(violation("claim must be present exactly while claimed or active"));
        }
        if self.result.is_some()
            && !matches!(self.status, WorkStatus::Completed | WorkStatus::Archived)
        {
            return Err(violation("result present on an unfinished order"));
        }
        if matches!(self.status, WorkStatus::Failed | WorkStatus::PermanentlyFailed)
            && self.error.is_none()
        {
            return Err(violation("failed order without error details"));
        }
        Ok(())
    }

    /// Validate and check that the record belongs in `bucket`.
    pub fn validate_in(&self, bucket: Bucket) -> Result<(), InvariantViolation> {
        self.validate()?;
        if self.bucket() != bucket {
            return Err(InvariantViolation {
                work_id: self.work_id.clone(),
                reason: format!("status {} stored in bucket {}", self.status, bucket),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn order(id: &str) -> WorkOrder {
        WorkOrder::new(
            WorkId::parse(id).unwrap(),
            WorkSeed {
                target_identifier: format!("target-{id}"),
                target_endpoint: format!("https://example.test/{id}"),
                processed_subunits: vec![],
            },
            at(0),
        )
    }

    /// Says `claimed` but carries no claim; fails validation wherever it is stored.
    pub(crate) fn damaged(id: &str) -> WorkOrder {
        let mut o = order(id);
        o.status = WorkStatus::Claimed;
        o
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::parse(name).unwrap()
    }

    #[test]
    fn new_order_is_available_and_valid() {
        let o = order("W1");
        assert_eq!(o.status, WorkStatus::Available);
        assert_eq!(o.attempt_count(), 0);
        o.validate_in(Bucket::Available).unwrap();
    }

    #[test]
    fn happy_path_claim_activate_complete() {
        let mut o = order("W1");
        o.claim(worker("a"), at(10)).unwrap();
        assert_eq!(o.claimed_by(), Some(&worker("a")));
        o.validate_in(Bucket::Active).unwrap();

        o.activate(at(11)).unwrap();
        o.complete(serde_json::json!({"rows": 3}), at(20)).unwrap();

        assert_eq!(o.status, WorkStatus::Completed);
        assert!(o.claim.is_none());
        assert_eq!(o.completed_at, Some(at(20)));
        o.validate_in(Bucket::Completed).unwrap();
    }

    #[test]
    fn failures_accumulate_attempts() {
        let mut o = order("W3");
        for n in 1..=3 {
            o.claim(worker("a"), at(n)).unwrap();
            o.activate(at(n)).unwrap();
            o.fail(format!("boom {n}"), at(n)).unwrap();
            assert_eq!(o.attempt_count(), n as u32);
            o.validate_in(Bucket::Retry).unwrap();
            if n < 3 {
                o.requeue(at(n)).unwrap();
            }
        }
        o.mark_permanently_failed(at(5)).unwrap();
        assert_eq!(o.error.as_ref().unwrap().message, "boom 3");
        o.validate_in(Bucket::Failed).unwrap();
    }

    #[test]
    fn release_claim_clears_claim_without_charging_an_attempt() {
        let mut o = order("W1");
        o.claim(worker("a"), at(1)).unwrap();
        o.fail("timeout", at(2)).unwrap();
        o.requeue(at(3)).unwrap();
        o.claim(worker("b"), at(4)).unwrap();
        o.activate(at(5)).unwrap();
        o.release_claim(at(100)).unwrap();
        assert_eq!(o.status, WorkStatus::Available);
        assert!(o.claim.is_none());
        assert_eq!(o.attempt_count(), 1);
        assert_eq!(o.error.as_ref().unwrap().message, "timeout");
        assert_eq!(o.updated_at, at(100));
        o.validate_in(Bucket::Available).unwrap();
    }

    #[rstest]
    #[case::claim_twice(WorkStatus::Claimed)]
    #[case::claim_completed(WorkStatus::Completed)]
    #[case::claim_dead(WorkStatus::PermanentlyFailed)]
    fn claim_is_refused_outside_available(#[case] status: WorkStatus) {
        let mut o = order("W1");
        o.status = status;
        let err = o.claim(worker("b"), at(1)).unwrap_err();
        assert_eq!(err.action, "claim");
        assert_eq!(err.status, status);
    }

    #[test]
    fn validate_catches_claim_without_status() {
        let mut o = order("W1");
        o.claim = Some(Claim {
            worker_id: worker("a"),
            claimed_at: at(1),
        });
        assert!(o.validate().is_err());
    }

    #[test]
    fn validate_catches_wrong_bucket() {
        let o = order("W1");
        assert!(o.validate_in(Bucket::Active).is_err());
    }

    #[test]
    fn serialized_shape_omits_empty_optionals() {
        let o = order("W1");
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["status"], "available");
        assert!(json.get("claim").is_none());
        assert!(json.get("error").is_none());
    }
}
