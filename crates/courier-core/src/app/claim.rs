//! Claim resolver - lock のない共有リポジトリ上での claim プロトコル
//!
//! 1. 候補がまだ `available` にあることを確認し、claim intent を publish
//! 2. contention window だけ待ってから sync し、同じ work_id の intent を集める
//! 3. tie-break（最も早い `claimed_at`、同時刻なら worker_id の辞書順）で勝者を決める
//! 4. 勝者だけが `available -> active` の move を publish する（自分の intent も同時に削除）
//! 5. 敗者は自分の intent を取り下げて `Lost` を返す
//!
//! move が conflict で弾かれたら sync してから 3. からやり直す（回数制限あり）。
//! 同じ手続きの中では intent（と `claimed_at`）は 1 つだけ使い回すので、
//! tie-break 上の順位はやり直しても変わらない。

use std::sync::Arc;

use tokio::sync::watch;

use super::retry::{RetryPolicy, with_store_retry};
use crate::config::ClaimSettings;
use crate::domain::{
    Bucket, ClaimError, ClaimIntent, StoreError, WorkId, WorkOrder, WorkerId, resolve_winner,
};
use crate::ports::{Changeset, Clock, WorkStore};

/// Result of one claim procedure. Losing is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker owns the order; it is now `Claimed` in `active/`.
    Won(WorkOrder),

    /// Another worker won, or the order left `available` first.
    Lost { winner: Option<WorkerId> },

    /// Contention did not settle within the attempt budget (or shutdown was
    /// requested); the order may still be available.
    Retry,

    /// The `available` record cannot be decoded or fails validation. Nothing
    /// was claimed; other candidates are unaffected.
    Unreadable { reason: String },
}

/// What `publish_intent` found in `available`.
enum Candidate {
    Present,
    Gone,
    Unreadable(StoreError),
}

pub struct ClaimResolver {
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    settings: ClaimSettings,
    retry: RetryPolicy,
}

impl ClaimResolver {
    pub fn new(
        store: Arc<dyn WorkStore>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        settings: ClaimSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            settings,
            retry,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn settings(&self) -> &ClaimSettings {
        &self.settings
    }

    fn infra(&self, work_id: &WorkId, step: &'static str) -> impl FnOnce(StoreError) -> ClaimError {
        let work_id = work_id.clone();
        move |source| ClaimError::Infrastructure {
            work_id,
            step,
            source,
        }
    }

    /// Run the claim procedure for one candidate.
    pub async fn claim(
        &self,
        work_id: &WorkId,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ClaimOutcome, ClaimError> {
        let intent = ClaimIntent::new(work_id.clone(), self.worker_id.clone(), self.clock.now());

        match self.publish_intent(&intent).await? {
            Candidate::Present => {}
            Candidate::Gone => {
                tracing::debug!(work_id = %work_id, "candidate left available before intent");
                return Ok(ClaimOutcome::Lost { winner: None });
            }
            Candidate::Unreadable(e) => {
                tracing::warn!(work_id = %work_id, error = %e, "skipping unreadable candidate");
                return Ok(ClaimOutcome::Unreadable {
                    reason: e.to_string(),
                });
            }
        }
        tracing::debug!(work_id = %work_id, claimed_at = %intent.claimed_at, "claim intent published");

        tokio::time::sleep(self.settings.contention_window).await;

        for attempt in 1..=self.settings.max_claim_attempts {
            with_store_retry(&self.retry, self.store.as_ref(), "sync", || self.store.sync())
                .await
                .map_err(self.infra(work_id, "sync"))?;

            let intents = self
                .store
                .list_intents(Some(work_id))
                .await
                .map_err(self.infra(work_id, "list intents"))?;
            let now = self.clock.now();
            let ttl = chrono::Duration::from_std(self.settings.intent_ttl)
                .unwrap_or_else(|_| chrono::Duration::MAX);
            let live: Vec<ClaimIntent> = intents
                .into_iter()
                .filter(|i| i.worker_id == self.worker_id || !i.is_expired(now, ttl))
                .collect();

            let winner = resolve_winner(&live).map(|i| i.worker_id.clone());
            if winner.as_ref() != Some(&self.worker_id) {
                tracing::info!(work_id = %work_id, winner = ?winner, "lost claim race");
                self.retract(&intent).await;
                return Ok(ClaimOutcome::Lost { winner });
            }

            let mut claimed = match self.store.read(Bucket::Available, work_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    tracing::info!(work_id = %work_id, "won tie-break but order already moved");
                    self.retract(&intent).await;
                    return Ok(ClaimOutcome::Lost { winner: None });
                }
                Err(e) if e.is_bad_record() => {
                    tracing::warn!(work_id = %work_id, error = %e, "skipping unreadable candidate");
                    self.retract(&intent).await;
                    return Ok(ClaimOutcome::Unreadable {
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(self.infra(work_id, "read")(e)),
            };

            if let Err(e) = claimed.claim(self.worker_id.clone(), self.clock.now()) {
                tracing::warn!(work_id = %work_id, error = %e, "available record is not claimable");
                self.retract(&intent).await;
                return Ok(ClaimOutcome::Lost { winner: None });
            }

            let changeset = Changeset::new(format!("claim {} by {}", work_id, self.worker_id))
                .relocate(Bucket::Available, Bucket::Active, claimed.clone())
                .delete_intent(work_id.clone(), self.worker_id.clone());

            match self.store.publish(changeset).await {
                Ok(()) => {
                    tracing::info!(work_id = %work_id, worker_id = %self.worker_id, "claim won");
                    return Ok(ClaimOutcome::Won(claimed));
                }
                Err(StoreError::NotFound { .. }) => {
                    self.retract(&intent).await;
                    return Ok(ClaimOutcome::Lost { winner: None });
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(work_id = %work_id, attempt, error = %e, "claim move rejected");
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::time::sleep(self.retry.next_delay(attempt)).await;
                }
                Err(e) => return Err(self.infra(work_id, "move")(e)),
            }
        }

        tracing::warn!(work_id = %work_id, "claim attempts exhausted");
        self.retract(&intent).await;
        Ok(ClaimOutcome::Retry)
    }

    /// Publish the intent if the order is still available and readable.
    async fn publish_intent(&self, intent: &ClaimIntent) -> Result<Candidate, ClaimError> {
        let store = self.store.as_ref();
        with_store_retry(&self.retry, store, "publish intent", || async move {
            match store.read(Bucket::Available, &intent.work_id).await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(Candidate::Gone),
                Err(e) if e.is_bad_record() => return Ok(Candidate::Unreadable(e)),
                Err(e) => return Err(e),
            }
            let changeset = Changeset::new(format!(
                "intent {} by {}",
                intent.work_id, intent.worker_id
            ))
            .put_intent(intent.clone());
            store.publish(changeset).await.map(|()| Candidate::Present)
        })
        .await
        .map_err(self.infra(&intent.work_id, "publish intent"))
    }

    /// Best effort: a leftover intent only delays others until it expires.
    async fn retract(&self, intent: &ClaimIntent) {
        let store = self.store.as_ref();
        let result = with_store_retry(&self.retry, store, "retract intent", || async move {
            let changeset = Changeset::new(format!(
                "retract intent {} by {}",
                intent.work_id, intent.worker_id
            ))
            .delete_intent(intent.work_id.clone(), intent.worker_id.clone());
            store.publish(changeset).await
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(work_id = %intent.work_id, error = %e, "could not retract claim intent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkStatus;
    use crate::domain::work_order::tests::{damaged, order};
    use crate::impls::InMemoryRemote;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use futures::future::join_all;
    use std::time::Duration;

    fn clock_at(millis: i64) -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(Utc.timestamp_millis_opt(millis).unwrap()))
    }

    fn settings(window_ms: u64) -> ClaimSettings {
        ClaimSettings {
            contention_window: Duration::from_millis(window_ms),
            ..ClaimSettings::default()
        }
    }

    async fn resolver(
        remote: &InMemoryRemote,
        worker: &str,
        clock: Arc<dyn Clock>,
        window_ms: u64,
    ) -> (ClaimResolver, Arc<dyn WorkStore>) {
        let store: Arc<dyn WorkStore> = Arc::new(remote.connect().await);
        let resolver = ClaimResolver::new(
            Arc::clone(&store),
            clock,
            WorkerId::parse(worker).unwrap(),
            settings(window_ms),
            RetryPolicy::immediate(10),
        );
        (resolver, store)
    }

    async fn seed(remote: &InMemoryRemote, ids: &[&str]) {
        let store = remote.connect().await;
        for id in ids {
            store.write(Bucket::Available, order(id)).await.unwrap();
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn earlier_intent_wins_and_loser_claims_another_order() {
        let remote = InMemoryRemote::new();
        seed(&remote, &["W1", "W2"]).await;

        // A @ 10.000, B @ 10.050; B resolves first and must defer to A
        let (a, _) = resolver(&remote, "worker-a", clock_at(10_000), 80).await;
        let (b, b_store) = resolver(&remote, "worker-b", clock_at(10_050), 20).await;
        let w1 = WorkId::parse("W1").unwrap();
        let shutdown = no_shutdown();

        let (ra, rb) = tokio::join!(a.claim(&w1, &shutdown), b.claim(&w1, &shutdown));

        match ra.unwrap() {
            ClaimOutcome::Won(o) => {
                assert_eq!(o.status, WorkStatus::Claimed);
                assert_eq!(o.claimed_by(), Some(a.worker_id()));
            }
            other => panic!("A should win, got {other:?}"),
        }
        assert_eq!(
            rb.unwrap(),
            ClaimOutcome::Lost {
                winner: Some(a.worker_id().clone())
            }
        );

        // B's intent is gone and W1 untouched by B
        b_store.sync().await.unwrap();
        assert!(b_store.list_intents(None).await.unwrap().is_empty());
        let active = b_store.read(Bucket::Active, &w1).await.unwrap().unwrap();
        assert_eq!(active.claimed_by(), Some(a.worker_id()));

        // B moves on to W2
        let w2 = WorkId::parse("W2").unwrap();
        assert!(matches!(
            b.claim(&w2, &shutdown).await.unwrap(),
            ClaimOutcome::Won(_)
        ));
    }

    #[tokio::test]
    async fn exactly_one_of_many_concurrent_claimants_wins() {
        let remote = InMemoryRemote::new();
        seed(&remote, &["W1"]).await;
        let w1 = WorkId::parse("W1").unwrap();
        let shutdown = no_shutdown();

        let mut resolvers = Vec::new();
        for name in ["w3", "w1", "w4", "w0", "w2"] {
            // identical timestamps: worker id decides
            let (r, _) = resolver(&remote, name, clock_at(10_000), 30).await;
            resolvers.push(r);
        }
        let outcomes =
            join_all(resolvers.iter().map(|r| r.claim(&w1, &shutdown))).await;

        let winners: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                Ok(ClaimOutcome::Won(order)) => order.claimed_by().cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "{outcomes:?}");
        assert_eq!(winners[0].as_str(), "w0");

        let dump = remote.dump().await;
        assert!(dump.get(&Bucket::Available).is_none_or(|v| v.is_empty()));
        assert_eq!(dump[&Bucket::Active].len(), 1);
        let store = remote.connect().await;
        assert!(store.list_intents(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_candidate_is_lost_without_publishing() {
        let remote = InMemoryRemote::new();
        let (r, _) = resolver(&remote, "a", clock_at(0), 0).await;
        let outcome = r
            .claim(&WorkId::parse("ghost").unwrap(), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Lost { winner: None });
        assert_eq!(remote.revision().await, 0);
    }

    #[tokio::test]
    async fn stale_intent_of_a_dead_worker_is_ignored() {
        let remote = InMemoryRemote::new();
        seed(&remote, &["W1"]).await;
        let w1 = WorkId::parse("W1").unwrap();

        // a crashed worker left an intent an hour ago
        let store = remote.connect().await;
        store
            .publish(Changeset::new("old").put_intent(ClaimIntent::new(
                w1.clone(),
                WorkerId::parse("dead").unwrap(),
                Utc.timestamp_millis_opt(0).unwrap(),
            )))
            .await
            .unwrap();

        let (r, _) = resolver(&remote, "alive", clock_at(3_600_000), 0).await;
        assert!(matches!(
            r.claim(&w1, &no_shutdown()).await.unwrap(),
            ClaimOutcome::Won(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_store_is_an_infrastructure_error() {
        let remote = InMemoryRemote::new();
        seed(&remote, &["W1"]).await;
        let store: Arc<dyn WorkStore> = Arc::new(remote.connect().await);
        let r = ClaimResolver::new(
            store,
            clock_at(0),
            WorkerId::parse("a").unwrap(),
            settings(0),
            RetryPolicy::immediate(1),
        );
        remote.set_offline(true).await;
        let err = r
            .claim(&WorkId::parse("W1").unwrap(), &no_shutdown())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::Infrastructure {
                step: "publish intent",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreadable_candidate_is_skipped_without_an_intent() {
        let remote = InMemoryRemote::new();
        remote.put_unchecked(Bucket::Available, damaged("W1")).await;
        let revision = remote.revision().await;
        let (r, _) = resolver(&remote, "a", clock_at(0), 0).await;

        let outcome = r
            .claim(&WorkId::parse("W1").unwrap(), &no_shutdown())
            .await
            .unwrap();

        assert!(
            matches!(&outcome, ClaimOutcome::Unreadable { reason } if reason.contains("claim must be present")),
            "{outcome:?}"
        );
        assert_eq!(remote.revision().await, revision);
        assert!(remote.dump().await.get(&Bucket::Active).is_none());
    }
}
