//! Retry policy: decides backoff delays for store operations.
//!
//! Conflicts and transient failures on the shared store are retried with
//! exponential backoff (plus jitter so racing workers spread out). A conflict
//! additionally re-syncs before the next attempt, since the operation has to be
//! redone against the latest remote state.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::domain::StoreError;
use crate::ports::WorkStore;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            jitter: 0.1,
        }
    }

    /// No waiting at all; for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_retries,
            jitter: 0.0,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-indexed).
    ///
    /// base_delay * multiplier^(retry - 1), capped at `max_delay`, then
    /// jittered.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64()
            * self.multiplier.powi(retry.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered(capped, self.jitter))
    }
}

/// `value` moved by up to ±`factor` of itself, never negative.
pub(crate) fn jittered(value: f64, factor: f64) -> f64 {
    if factor <= 0.0 || value <= 0.0 || !value.is_finite() {
        return value.max(0.0);
    }
    let range = value * factor;
    if range <= 0.0 {
        return value;
    }
    let offset = rand::thread_rng().gen_range(-range..range);
    (value + offset).max(0.0)
}

/// Run `op` until it succeeds, fails permanently, or the retries run out.
///
/// On a conflict the store is synced before the next attempt; `op` must
/// re-read whatever it depends on.
pub async fn with_store_retry<T, F, Fut>(
    policy: &RetryPolicy,
    store: &dyn WorkStore,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.next_delay(retry);
                tracing::warn!(
                    operation,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                if err.is_conflict() {
                    if let Err(sync_err) = store.sync().await {
                        tracing::warn!(operation, error = %sync_err, "sync after conflict failed");
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Bucket;
    use crate::domain::work_order::tests::order;
    use crate::impls::InMemoryRemote;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_increases_and_caps() {
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_secs(10))
            .with_jitter(0.5);
        for _ in 0..50 {
            let d = policy.next_delay(1).as_secs_f64();
            assert!((5.0..=15.0).contains(&d), "{d}");
        }
    }

    #[tokio::test]
    async fn conflict_is_synced_and_retried() {
        let remote = InMemoryRemote::new();
        let a = remote.connect().await;
        let b = remote.connect().await;
        a.write(Bucket::Available, order("W1")).await.unwrap();

        let calls = AtomicU32::new(0);
        with_store_retry(&RetryPolicy::immediate(3), &b, "write W2", || {
            calls.fetch_add(1, Ordering::SeqCst);
            b.write(Bucket::Available, order("W2"))
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.list(Bucket::Available).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let remote = InMemoryRemote::new();
        let store = remote.connect().await;
        remote.set_offline(true).await;

        let calls = AtomicU32::new(0);
        let err = with_store_retry(&RetryPolicy::immediate(2), &store, "sync", || {
            calls.fetch_add(1, Ordering::SeqCst);
            store.sync()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Unreachable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = InMemoryRemote::new().connect().await;
        let calls = AtomicU32::new(0);
        let mut o = order("W1");
        o.claim(crate::domain::WorkerId::parse("a").unwrap(), o.created_at).unwrap();
        let err = with_store_retry(&RetryPolicy::immediate(5), &store, "move", || {
            calls.fetch_add(1, Ordering::SeqCst);
            store.move_order(Bucket::Available, Bucket::Active, o.clone())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
