//! Orchestrator - stale claim の回収、retry の昇格、archive、補充
//!
//! 1 cycle = sync → stale-claim sweep → stale-intent sweep → retry promotion
//! → archive → replenishment。
//!
//! 各 order の移動は 1 つずつ publish する。conflict なら sync して record を
//! 読み直し、判定からやり直す（別の orchestrator が先に動かしていれば何もしない）。
//! `active` の claim を取り消せるのはこの stale sweep だけ。stale claim は
//! 失敗ではないので attempt_count は増やさない。
//!
//! 読めない record（decode できない・invariant 違反）は warn を出してその order
//! だけ飛ばす。cycle 全体は止めない。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};

use super::retry::{RetryPolicy, with_store_retry};
use crate::config::{CourierConfig, OrchestratorSettings};
use crate::domain::{Bucket, ClaimIntent, OrchestratorError, StoreError, WorkId, WorkOrder};
use crate::ports::{Changeset, Clock, WorkSource, WorkStore};

/// Per-step counts of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Stale active claims returned to `available`.
    pub reclaimed: usize,
    pub intents_swept: usize,
    pub promoted: usize,
    pub permanently_failed: usize,
    pub archived: usize,
    pub replenished: usize,
    pub duplicates_skipped: usize,
}

impl CycleReport {
    pub fn absorb(&mut self, other: &CycleReport) {
        self.reclaimed += other.reclaimed;
        self.intents_swept += other.intents_swept;
        self.promoted += other.promoted;
        self.permanently_failed += other.permanently_failed;
        self.archived += other.archived;
        self.replenished += other.replenished;
        self.duplicates_skipped += other.duplicates_skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cycles_run: u64,
    pub failed_cycles: u64,
    pub totals: CycleReport,
}

pub struct Orchestrator {
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn WorkSource>>,
    settings: OrchestratorSettings,
    intent_ttl: Duration,
    retry: RetryPolicy,
    /// `target_identifier` of every archived order seen so far. Archived
    /// records never change, so each is read once.
    archived_targets: Mutex<HashMap<WorkId, String>>,
}

impl Orchestrator {
    pub fn new(config: &CourierConfig, store: Arc<dyn WorkStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            source: None,
            settings: config.orchestrator.clone(),
            intent_ttl: config.claim.intent_ttl,
            retry: config.store.retry_policy(),
            archived_targets: Mutex::new(HashMap::new()),
        }
    }

    /// Replenish `available` from `source`; without one the step is skipped.
    pub fn with_source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.source = Some(source);
        self
    }

    fn age_exceeds(&self, since: DateTime<Utc>, limit: Duration) -> bool {
        (self.clock.now() - since)
            .to_std()
            .is_ok_and(|age| age >= limit)
    }

    /// Run cycles until `max_cycles` (if any) or shutdown.
    ///
    /// A failed cycle is logged and skipped; the next one starts from a fresh
    /// sync.
    pub async fn run(
        &self,
        max_cycles: Option<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            if *shutdown.borrow() {
                tracing::info!("orchestrator cancelled");
                break;
            }
            match self.run_cycle().await {
                Ok(report) => {
                    tracing::info!(cycle = summary.cycles_run + 1, report = ?report, "cycle finished");
                    summary.totals.absorb(&report);
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    tracing::warn!(cycle = summary.cycles_run + 1, error = %e, "cycle failed");
                }
            }
            summary.cycles_run += 1;
            if max_cycles.is_some_and(|max| summary.cycles_run >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.cycle_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(self.settings.cycle_interval).await;
                    }
                }
            }
        }
        summary
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, OrchestratorError> {
        let store = self.store.as_ref();
        with_store_retry(&self.retry, store, "sync", || store.sync()).await?;

        let mut report = CycleReport::default();
        self.sweep_stale_claims(&mut report).await?;
        self.sweep_stale_intents(&mut report).await?;
        self.promote_retries(&mut report).await?;
        self.archive_completed(&mut report).await?;
        self.replenish(&mut report).await?;
        Ok(report)
    }

    /// Move each listed order with `decide`, retrying on conflict.
    ///
    /// `decide` gets the freshly read record and returns it transformed, or
    /// `None` to leave it alone.
    async fn relocate_each<F>(
        &self,
        from: Bucket,
        operation: &'static str,
        decide: F,
    ) -> Result<Vec<Bucket>, StoreError>
    where
        F: Fn(WorkOrder, DateTime<Utc>) -> Option<WorkOrder> + Sync,
    {
        let store = self.store.as_ref();
        let clock = self.clock.as_ref();
        let decide = &decide;
        let mut moved = Vec::new();

        let listing = store.list(from).await?;
        for work_id in listing.iter() {
            let result = with_store_retry(&self.retry, store, operation, || async move {
                let Some(current) = store.read(from, work_id).await? else {
                    return Ok(None);
                };
                let Some(next) = decide(current, clock.now()) else {
                    return Ok(None);
                };
                let to = next.bucket();
                store
                    .publish(
                        Changeset::new(format!("{operation} {work_id}")).relocate(from, to, next),
                    )
                    .await?;
                Ok(Some(to))
            })
            .await;

            let destination = match result {
                Ok(destination) => destination,
                Err(e) if e.is_bad_record() => {
                    tracing::warn!(work_id = %work_id, bucket = %from, operation, error = %e, "skipping unreadable work order");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(to) = destination {
                tracing::info!(work_id = %work_id, from = %from, to = %to, operation, "work order moved");
                moved.push(to);
            }
        }
        Ok(moved)
    }

    async fn sweep_stale_claims(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        let threshold = self.settings.staleness_threshold;
        let moved = self
            .relocate_each(Bucket::Active, "reclaim", |mut order, now| {
                let claimed_at = order.claim.as_ref()?.claimed_at;
                if !self.age_exceeds(claimed_at, threshold) {
                    return None;
                }
                order.release_claim(now).ok()?;
                Some(order)
            })
            .await?;
        report.reclaimed += moved.len();
        Ok(())
    }

    async fn sweep_stale_intents(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        let ttl = self.intent_ttl;
        let swept = with_store_retry(&self.retry, store, "sweep intents", || async move {
            let expired: Vec<ClaimIntent> = store
                .list_intents(None)
                .await?
                .into_iter()
                .filter(|intent| self.age_exceeds(intent.claimed_at, ttl))
                .collect();
            if expired.is_empty() {
                return Ok(0);
            }
            let changeset = expired.iter().fold(
                Changeset::new(format!("sweep {} stale claim intents", expired.len())),
                |cs, intent| cs.delete_intent(intent.work_id.clone(), intent.worker_id.clone()),
            );
            store.publish(changeset).await?;
            Ok(expired.len())
        })
        .await?;
        if swept > 0 {
            tracing::info!(swept, "stale claim intents removed");
        }
        report.intents_swept += swept;
        Ok(())
    }

    async fn promote_retries(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        let max_attempts = self.settings.max_attempts;
        let moved = self
            .relocate_each(Bucket::Retry, "promote", |mut order, now| {
                if order.attempt_count() < max_attempts {
                    order.requeue(now).ok()?;
                } else {
                    give_up(&mut order, now).ok()?;
                }
                Some(order)
            })
            .await?;
        for to in moved {
            match to {
                Bucket::Available => report.promoted += 1,
                _ => report.permanently_failed += 1,
            }
        }
        Ok(())
    }

    async fn archive_completed(&self, report: &mut CycleReport) -> Result<(), StoreError> {
        let retention = self.settings.retention;
        let moved = self
            .relocate_each(Bucket::Completed, "archive", |mut order, now| {
                let finished = order.completed_at.unwrap_or(order.updated_at);
                if !self.age_exceeds(finished, retention) {
                    return None;
                }
                order.archive(now).ok()?;
                Some(order)
            })
            .await?;
        report.archived += moved.len();
        Ok(())
    }

    async fn replenish(&self, report: &mut CycleReport) -> Result<(), OrchestratorError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let store = self.store.as_ref();
        let available = store.list(Bucket::Available).await?.len();
        if available >= self.settings.available_floor {
            return Ok(());
        }

        let seeds = source.fetch_seeds().await?;
        let batch = self.settings.replenish_batch;
        let clock = self.clock.as_ref();
        let seeds = &seeds;

        let (added, skipped) = with_store_retry(&self.retry, store, "replenish", || async move {
            let mut known = self.known_targets().await?;
            let mut changeset = Changeset::new("replenish available");
            let mut added = 0;
            let mut skipped = 0;
            for seed in seeds {
                if added >= batch {
                    break;
                }
                if !known.insert(seed.target_identifier.clone()) {
                    skipped += 1;
                    continue;
                }
                changeset = changeset.put(
                    Bucket::Available,
                    WorkOrder::new(WorkId::generate(), seed.clone(), clock.now()),
                );
                added += 1;
            }
            if !changeset.is_empty() {
                store.publish(changeset).await?;
            }
            Ok((added, skipped))
        })
        .await?;

        tracing::info!(available, added, skipped, "replenished available");
        report.replenished += added;
        report.duplicates_skipped += skipped;
        Ok(())
    }

    /// Every `target_identifier` present in any bucket.
    ///
    /// Live buckets are read in full; `archive/` only for ids not cached yet.
    async fn known_targets(&self) -> Result<HashSet<String>, StoreError> {
        let store = self.store.as_ref();
        let mut targets = HashSet::new();
        for bucket in Bucket::ALL.into_iter().filter(|b| *b != Bucket::Archive) {
            for work_id in store.list(bucket).await?.iter() {
                if let Some(target) = read_target(store, bucket, work_id).await? {
                    targets.insert(target);
                }
            }
        }

        let listing = store.list(Bucket::Archive).await?;
        let present: HashSet<&WorkId> = listing.iter().collect();
        let mut archived = self.archived_targets.lock().await;
        archived.retain(|work_id, _| present.contains(work_id));
        for work_id in listing.iter() {
            if archived.contains_key(work_id) {
                continue;
            }
            if let Some(target) = read_target(store, Bucket::Archive, work_id).await? {
                archived.insert(work_id.clone(), target);
            }
        }
        targets.extend(archived.values().cloned());
        Ok(targets)
    }
}

/// Ceiling reached: permanently failed, excluded from claiming.
fn give_up(order: &mut WorkOrder, now: DateTime<Utc>) -> Result<(), crate::domain::TransitionError> {
    order.mark_permanently_failed(now)?;
    if let Some(error) = order.error.as_mut() {
        error.message = format!(
            "gave up after {} attempts: {}",
            error.attempt_count, error.message
        );
    }
    Ok(())
}

/// `target_identifier` of `work_id`, or `None` when the record is gone or
/// unreadable.
async fn read_target(
    store: &dyn WorkStore,
    bucket: Bucket,
    work_id: &WorkId,
) -> Result<Option<String>, StoreError> {
    match store.read(bucket, work_id).await {
        Ok(order) => Ok(order.map(|o| o.target_identifier)),
        Err(e) if e.is_bad_record() => {
            tracing::warn!(work_id = %work_id, bucket = %bucket, error = %e, "ignoring unreadable work order for dedup");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
