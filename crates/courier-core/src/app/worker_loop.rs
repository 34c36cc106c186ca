//! WorkerLoop - 1 プロセス 1 worker の実行ループ
//!
//! # フロー
//! 1. Stop policy を評価（target reached > no work > idle timeout）
//! 2. sync して `available` を列挙、候補をシャッフルして ClaimResolver に渡す
//! 3. 勝ったら `active` 上で Claimed -> Active に切り替えてから executor を実行
//! 4. 結果を publish する直前に sync し、`active` の record がまだ自分の claim か確認
//!    - 成功: `active -> completed`
//!    - 失敗: `active -> retry`（attempt_count +1）
//!    - claim が revoke されていたら結果は捨てる（ClaimRevoked）
//! 5. 何も取れなければ `consecutive_no_work` を増やし、stop policy を見てから
//!    jitter 付きで poll_interval 待つ
//!
//! 壊れた record（decode できない・invariant 違反）はその order だけの問題として
//! 扱い、infrastructure failure には数えない。
//!
//! shutdown は claim の前・idle sleep 中・claim の backoff 中にだけ見る。
//! 実行中の executor は止めない（止めると `active` に孤児が残る）。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::watch;

use super::claim::{ClaimOutcome, ClaimResolver};
use super::policy::{StopPolicy, StopReason};
use super::retry::{RetryPolicy, jittered, with_store_retry};
use super::session::{HistoryOutcome, SessionExport};
use crate::config::{CourierConfig, LoserPolicy, WorkerSettings};
use crate::domain::{
    Bucket, ClaimError, StoreError, TransitionError, WorkId, WorkOrder, WorkStatus, WorkerError,
    WorkerId,
};
use crate::ports::{Changeset, Clock, TaskExecutor, WorkStore};

/// Where the loop currently is; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Processing,
    Completing,
    Retrying,
    Stopping,
}

/// Returned by a run that stopped gracefully.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub stop_reason: StopReason,
    pub export_path: std::path::PathBuf,
    pub session: SessionExport,
}

enum Acquired {
    Order(WorkOrder),
    NoWork,
    Interrupted,
}

/// Result of a guarded publish on an `active` record.
enum Settled {
    Published(WorkOrder),
    Revoked(String),
}

pub struct WorkerLoop {
    worker_id: WorkerId,
    store: Arc<dyn WorkStore>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    resolver: ClaimResolver,
    policy: StopPolicy,
    settings: WorkerSettings,
    retry: RetryPolicy,
    state: WorkerState,
    session: SessionExport,
    idle_since: DateTime<Utc>,
    consecutive_infra_failures: u32,
}

impl WorkerLoop {
    pub fn new(
        config: &CourierConfig,
        worker_id: WorkerId,
        store: Arc<dyn WorkStore>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = config.store.retry_policy();
        let resolver = ClaimResolver::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            worker_id.clone(),
            config.claim.clone(),
            retry.clone(),
        );
        let now = clock.now();
        Self {
            session: SessionExport::new(worker_id.clone(), config.environment.as_str(), now),
            worker_id,
            store,
            executor,
            clock,
            resolver,
            policy: StopPolicy::from_settings(&config.worker),
            settings: config.worker.clone(),
            retry,
            state: WorkerState::Idle,
            idle_since: now,
            consecutive_infra_failures: 0,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::debug!(worker_id = %self.worker_id, from = ?self.state, to = ?next, "worker state");
            self.state = next;
        }
    }

    /// Run until a stop condition, cancellation or persistent infrastructure
    /// failure. The session export is written in every case.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerReport, WorkerError> {
        tracing::info!(
            worker_id = %self.worker_id,
            max_work_orders = self.policy.max_work_orders,
            max_consecutive_failures = self.policy.max_consecutive_failures,
            "worker started"
        );

        let outcome = self.cycle_until_stop(&mut shutdown).await;

        self.set_state(WorkerState::Stopping);
        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(_) => StopReason::InfrastructureFailure,
        };
        self.session.finish(reason, self.clock.now());
        let written = self.session.write_to(&self.settings.export_dir).await;

        tracing::info!(
            worker_id = %self.worker_id,
            reason = %reason,
            completed = self.session.counters.completed,
            failed = self.session.counters.failed,
            "worker stopped"
        );

        match (outcome, written) {
            (Ok(stop_reason), Ok(export_path)) => Ok(WorkerReport {
                stop_reason,
                export_path,
                session: self.session,
            }),
            (Ok(_), Err(export_err)) => Err(export_err),
            (Err(err), written) => {
                if let Err(export_err) = written {
                    tracing::error!(error = %export_err, "session export failed");
                }
                Err(err)
            }
        }
    }

    async fn cycle_until_stop(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StopReason, WorkerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(StopReason::Cancelled);
            }
            if let Some(reason) =
                self.policy
                    .evaluate(&self.session.counters, self.idle_since, self.clock.now())
            {
                return Ok(reason);
            }

            self.set_state(WorkerState::Claiming);
            match self.acquire(shutdown).await {
                Ok(Acquired::Order(order)) => {
                    self.consecutive_infra_failures = 0;
                    self.session.counters.consecutive_no_work = 0;
                    let work_id = order.work_id.clone();
                    if let Err(e) = self.process(order).await {
                        if let Some(fatal) = self.note_infra_failure(Some(&work_id), &e) {
                            return Err(fatal);
                        }
                        self.idle(shutdown).await;
                    }
                }
                Ok(Acquired::NoWork) => {
                    self.consecutive_infra_failures = 0;
                    self.session.counters.consecutive_no_work += 1;
                    self.session.counters.idle_polls += 1;
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        consecutive_no_work = self.session.counters.consecutive_no_work,
                        "no work claimed"
                    );
                    if let Some(reason) =
                        self.policy
                            .evaluate(&self.session.counters, self.idle_since, self.clock.now())
                    {
                        return Ok(reason);
                    }
                    self.idle(shutdown).await;
                }
                Ok(Acquired::Interrupted) => {}
                Err(e) => {
                    if let Some(fatal) = self.note_infra_failure(None, &e) {
                        return Err(fatal);
                    }
                    self.idle(shutdown).await;
                }
            }
        }
    }

    /// Try candidates from `available` until one is won.
    async fn acquire(&mut self, shutdown: &watch::Receiver<bool>) -> Result<Acquired, ClaimError> {
        let store = self.store.as_ref();
        with_store_retry(&self.retry, store, "sync", || store.sync())
            .await
            .map_err(ClaimError::Listing)?;
        let mut candidates = store
            .list(Bucket::Available)
            .await
            .map_err(ClaimError::Listing)?
            .into_vec();
        if candidates.is_empty() {
            return Ok(Acquired::NoWork);
        }

        let claim = self.resolver.settings().clone();
        if claim.shuffle_candidates {
            candidates.shuffle(&mut rand::thread_rng());
        }

        let mut last_error = None;
        let mut resolved_any = false;
        for work_id in candidates.iter().take(claim.max_candidates_per_cycle) {
            let mut attempt = 0;
            loop {
                if *shutdown.borrow() {
                    return Ok(Acquired::Interrupted);
                }
                match self.resolver.claim(work_id, shutdown).await {
                    Ok(ClaimOutcome::Won(order)) => {
                        self.session.counters.claims_won += 1;
                        return Ok(Acquired::Order(order));
                    }
                    Ok(ClaimOutcome::Lost { winner }) => {
                        resolved_any = true;
                        self.session.counters.claims_lost += 1;
                        self.session.record(
                            Some(work_id),
                            HistoryOutcome::ClaimLost,
                            self.clock.now(),
                            winner.as_ref().map(|w| format!("won by {w}")),
                        );
                        attempt += 1;
                        let retry_same = claim.loser_policy == LoserPolicy::RetrySame
                            && winner.is_some()
                            && attempt < claim.max_claim_attempts;
                        if !retry_same {
                            break;
                        }
                        tokio::time::sleep(self.retry.next_delay(attempt)).await;
                    }
                    Ok(ClaimOutcome::Retry) | Ok(ClaimOutcome::Unreadable { .. }) => {
                        resolved_any = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %self.worker_id, work_id = %work_id, error = %e, "claim failed");
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) if !resolved_any => Err(e),
            _ => Ok(Acquired::NoWork),
        }
    }

    /// Activate, execute, then publish the result if the claim still holds.
    async fn process(&mut self, order: WorkOrder) -> Result<(), StoreError> {
        let work_id = order.work_id.clone();
        self.set_state(WorkerState::Processing);

        let active = match self
            .publish_owned(&work_id, "activate", |o, now| o.activate(now))
            .await?
        {
            Settled::Published(active) => active,
            Settled::Revoked(reason) => {
                self.note_revoked(&work_id, reason);
                return Ok(());
            }
        };

        tracing::info!(worker_id = %self.worker_id, work_id = %work_id, "processing");
        let result = self.executor.execute(&active).await;

        let settled = match result {
            Ok(value) => {
                self.set_state(WorkerState::Completing);
                self.publish_owned(&work_id, "complete", move |o, now| o.complete(value.clone(), now))
                    .await?
            }
            Err(err) => {
                self.set_state(WorkerState::Retrying);
                tracing::warn!(worker_id = %self.worker_id, work_id = %work_id, error = %err, "executor failed");
                let message = err.message;
                self.publish_owned(&work_id, "fail", move |o, now| o.fail(message.clone(), now))
                    .await?
            }
        };

        let now = self.clock.now();
        match settled {
            Settled::Published(done) if done.status == WorkStatus::Completed => {
                self.session.counters.completed += 1;
                self.idle_since = now;
                self.session.record(Some(&work_id), HistoryOutcome::Completed, now, None);
                tracing::info!(
                    worker_id = %self.worker_id,
                    work_id = %work_id,
                    completed = self.session.counters.completed,
                    "work order completed"
                );
            }
            Settled::Published(failed) => {
                self.session.counters.failed += 1;
                let detail = failed
                    .error
                    .as_ref()
                    .map(|e| format!("attempt {}: {}", e.attempt_count, e.message));
                self.session.record(Some(&work_id), HistoryOutcome::Failed, now, detail);
            }
            Settled::Revoked(reason) => self.note_revoked(&work_id, reason),
        }
        self.set_state(WorkerState::Idle);
        Ok(())
    }

    /// Sync, re-read `active/<work_id>`, and publish `transform`ed if this
    /// worker still holds the claim.
    async fn publish_owned<F>(
        &self,
        work_id: &WorkId,
        operation: &'static str,
        transform: F,
    ) -> Result<Settled, StoreError>
    where
        F: Fn(&mut WorkOrder, DateTime<Utc>) -> Result<(), TransitionError> + Sync,
    {
        let store = self.store.as_ref();
        let clock = self.clock.as_ref();
        let me = &self.worker_id;
        let transform = &transform;

        with_store_retry(&self.retry, store, "sync", || store.sync()).await?;
        with_store_retry(&self.retry, store, operation, || async move {
            let mut current = match store.read(Bucket::Active, work_id).await {
                Ok(Some(current)) => current,
                Ok(None) => return Ok(Settled::Revoked("record no longer in active".to_string())),
                Err(e) if e.is_bad_record() => {
                    return Ok(Settled::Revoked(format!("active record unreadable: {e}")));
                }
                Err(e) => return Err(e),
            };
            match current.claimed_by() {
                Some(holder) if holder == me => {}
                Some(holder) => return Ok(Settled::Revoked(format!("claim now held by {holder}"))),
                None => return Ok(Settled::Revoked("claim cleared".to_string())),
            }
            if let Err(e) = transform(&mut current, clock.now()) {
                return Ok(Settled::Revoked(e.to_string()));
            }
            let to = current.bucket();
            store
                .publish(
                    Changeset::new(format!("{operation} {work_id} by {me}"))
                        .relocate(Bucket::Active, to, current.clone()),
                )
                .await?;
            Ok(Settled::Published(current))
        })
        .await
    }

    fn note_revoked(&mut self, work_id: &WorkId, reason: String) {
        tracing::warn!(
            worker_id = %self.worker_id,
            work_id = %work_id,
            reason = %reason,
            "claim revoked while processing, dropping result"
        );
        self.session.record(
            Some(work_id),
            HistoryOutcome::ClaimRevoked,
            self.clock.now(),
            Some(reason),
        );
        self.set_state(WorkerState::Idle);
    }

    /// Count a skipped cycle; `Some` once the limit is reached.
    fn note_infra_failure(
        &mut self,
        work_id: Option<&WorkId>,
        error: &dyn std::error::Error,
    ) -> Option<WorkerError> {
        self.consecutive_infra_failures += 1;
        self.session.counters.infra_failures += 1;
        let message = error.to_string();
        tracing::warn!(
            worker_id = %self.worker_id,
            failures = self.consecutive_infra_failures,
            error = %message,
            "store unavailable, skipping cycle"
        );
        self.session.record(
            work_id,
            HistoryOutcome::InfrastructureError,
            self.clock.now(),
            Some(message.clone()),
        );
        self.set_state(WorkerState::Idle);

        (self.consecutive_infra_failures >= self.settings.max_infrastructure_failures).then(|| {
            WorkerError::Infrastructure {
                failures: self.consecutive_infra_failures,
                last: message,
            }
        })
    }

    /// Jittered poll sleep; returns early on shutdown.
    async fn idle(&mut self, shutdown: &mut watch::Receiver<bool>) {
        self.set_state(WorkerState::Idle);
        let secs = jittered(self.settings.poll_interval.as_secs_f64(), self.settings.poll_jitter);
        let delay = Duration::from_secs_f64(secs);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                // sender gone: nobody can cancel any more, just sleep
                if changed.is_err() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
