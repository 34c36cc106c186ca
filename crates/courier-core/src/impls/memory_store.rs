//! In-memory WorkStore（開発・テスト用）
//!
//! 共有リポジトリを「revision 付きの remote」と「参加者ごとのローカル snapshot」
//! でモデル化する。git と同じく、最後の sync 以降に remote が進んでいれば
//! publish は `StoreError::Conflict` になる。複数 worker の競合を 1 プロセス内で
//! 再現するために使う。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Bucket, ClaimIntent, StoreError, WorkId, WorkOrder, WorkerId};
use crate::ports::{BucketListing, Change, Changeset, WorkStore};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    revision: u64,
    buckets: BTreeMap<Bucket, BTreeMap<WorkId, WorkOrder>>,
    intents: BTreeMap<WorkId, BTreeMap<WorkerId, ClaimIntent>>,
}

impl Snapshot {
    fn apply(&mut self, change: Change) -> Result<(), StoreError> {
        match change {
            Change::Put { bucket, order } => {
                self.buckets
                    .entry(bucket)
                    .or_default()
                    .insert(order.work_id.clone(), order);
            }
            Change::Delete { bucket, work_id } => {
                let removed = self
                    .buckets
                    .get_mut(&bucket)
                    .and_then(|orders| orders.remove(&work_id));
                if removed.is_none() {
                    return Err(StoreError::NotFound { bucket, work_id });
                }
            }
            Change::PutIntent(intent) => {
                self.intents
                    .entry(intent.work_id.clone())
                    .or_default()
                    .insert(intent.worker_id.clone(), intent);
            }
            Change::DeleteIntent { work_id, worker_id } => {
                if let Some(staged) = self.intents.get_mut(&work_id) {
                    staged.remove(&worker_id);
                    if staged.is_empty() {
                        self.intents.remove(&work_id);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    snapshot: Snapshot,
    offline: bool,
}

/// The shared "remote repository" every in-memory participant talks to.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new participant, already synced to the current remote state.
    pub async fn connect(&self) -> InMemoryWorkStore {
        let snapshot = self.state.lock().await.snapshot.clone();
        InMemoryWorkStore {
            remote: self.clone(),
            local: Mutex::new(snapshot),
        }
    }

    /// Simulate an unreachable remote: sync and publish fail until restored.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn revision(&self) -> u64 {
        self.state.lock().await.snapshot.revision
    }

    /// Store `order` under `bucket` without validation, as a damaged or
    /// hand-edited repository would.
    #[cfg(test)]
    pub(crate) async fn put_unchecked(&self, bucket: Bucket, order: WorkOrder) {
        let mut state = self.state.lock().await;
        let snapshot = &mut state.snapshot;
        snapshot
            .buckets
            .entry(bucket)
            .or_default()
            .insert(order.work_id.clone(), order);
        snapshot.revision += 1;
    }

    /// Every record on the remote, by bucket. Test helper.
    pub async fn dump(&self) -> BTreeMap<Bucket, Vec<WorkOrder>> {
        let state = self.state.lock().await;
        state
            .snapshot
            .buckets
            .iter()
            .map(|(bucket, orders)| (*bucket, orders.values().cloned().collect()))
            .collect()
    }
}

/// One participant's view of an [`InMemoryRemote`].
#[derive(Debug)]
pub struct InMemoryWorkStore {
    remote: InMemoryRemote,
    local: Mutex<Snapshot>,
}

impl InMemoryWorkStore {
    /// Standalone store with its own private remote.
    pub async fn standalone() -> Self {
        InMemoryRemote::new().connect().await
    }

    pub fn remote(&self) -> &InMemoryRemote {
        &self.remote
    }
}

fn unreachable_error() -> StoreError {
    StoreError::Unreachable {
        detail: "in-memory remote is offline".to_string(),
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn sync(&self) -> Result<(), StoreError> {
        let remote = self.remote.state.lock().await;
        if remote.offline {
            return Err(unreachable_error());
        }
        *self.local.lock().await = remote.snapshot.clone();
        Ok(())
    }

    async fn list(&self, bucket: Bucket) -> Result<BucketListing, StoreError> {
        let local = self.local.lock().await;
        let ids = local
            .buckets
            .get(&bucket)
            .map(|orders| orders.keys().cloned().collect())
            .unwrap_or_default();
        Ok(BucketListing::new(bucket, ids))
    }

    async fn read(&self, bucket: Bucket, work_id: &WorkId) -> Result<Option<WorkOrder>, StoreError> {
        let local = self.local.lock().await;
        let Some(order) = local.buckets.get(&bucket).and_then(|o| o.get(work_id)) else {
            return Ok(None);
        };
        order.validate_in(bucket)?;
        Ok(Some(order.clone()))
    }

    async fn list_intents(&self, work_id: Option<&WorkId>) -> Result<Vec<ClaimIntent>, StoreError> {
        let local = self.local.lock().await;
        let intents = match work_id {
            Some(id) => local
                .intents
                .get(id)
                .map(|staged| staged.values().cloned().collect())
                .unwrap_or_default(),
            None => local
                .intents
                .values()
                .flat_map(|staged| staged.values().cloned())
                .collect(),
        };
        Ok(intents)
    }

    async fn publish(&self, changeset: Changeset) -> Result<(), StoreError> {
        changeset.validate()?;

        // lock order: remote -> local (sync と同じ)
        let mut remote = self.remote.state.lock().await;
        if remote.offline {
            return Err(unreachable_error());
        }
        let mut local = self.local.lock().await;
        if remote.snapshot.revision != local.revision {
            return Err(StoreError::Conflict {
                detail: format!(
                    "remote at revision {}, local at {}",
                    remote.snapshot.revision, local.revision
                ),
            });
        }

        let mut next = local.clone();
        for change in changeset.changes {
            next.apply(change)?;
        }
        next.revision += 1;

        tracing::trace!(revision = next.revision, commit = %changeset.message, "published");
        remote.snapshot = next.clone();
        *local = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::{at, damaged, order};
    use crate::domain::WorkStatus;

    #[tokio::test]
    async fn write_then_list_and_read() {
        let store = InMemoryWorkStore::standalone().await;
        store.write(Bucket::Available, order("W1")).await.unwrap();

        let listing = store.list(Bucket::Available).await.unwrap();
        assert_eq!(listing.len(), 1);
        let read = store
            .read(Bucket::Available, &WorkId::parse("W1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, WorkStatus::Available);
        assert!(store.list(Bucket::Active).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_participant_gets_conflict_until_sync() {
        let remote = InMemoryRemote::new();
        let a = remote.connect().await;
        let b = remote.connect().await;

        a.write(Bucket::Available, order("W1")).await.unwrap();
        let err = b.write(Bucket::Available, order("W2")).await.unwrap_err();
        assert!(err.is_conflict());

        b.sync().await.unwrap();
        b.write(Bucket::Available, order("W2")).await.unwrap();
        assert_eq!(remote.revision().await, 2);
    }

    #[tokio::test]
    async fn move_is_all_or_nothing() {
        let store = InMemoryWorkStore::standalone().await;
        let mut o = order("W1");
        o.claim(WorkerId::parse("a").unwrap(), at(1)).unwrap();

        // source missing: nothing may be written
        let err = store
            .move_order(Bucket::Available, Bucket::Active, o.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.list(Bucket::Active).await.unwrap().is_empty());

        store.write(Bucket::Available, order("W1")).await.unwrap();
        store
            .move_order(Bucket::Available, Bucket::Active, o)
            .await
            .unwrap();
        assert!(store.list(Bucket::Available).await.unwrap().is_empty());
        assert_eq!(store.list(Bucket::Active).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn intents_are_grouped_by_work_id() {
        let store = InMemoryWorkStore::standalone().await;
        let w1 = WorkId::parse("W1").unwrap();
        let w2 = WorkId::parse("W2").unwrap();
        let a = WorkerId::parse("a").unwrap();
        let cs = Changeset::new("intents")
            .put_intent(ClaimIntent::new(w1.clone(), a.clone(), at(1)))
            .put_intent(ClaimIntent::new(w2.clone(), a.clone(), at(2)));
        store.publish(cs).await.unwrap();

        assert_eq!(store.list_intents(Some(&w1)).await.unwrap().len(), 1);
        assert_eq!(store.list_intents(None).await.unwrap().len(), 2);

        store
            .publish(Changeset::new("retract").delete_intent(w1.clone(), a))
            .await
            .unwrap();
        assert!(store.list_intents(Some(&w1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_remote_is_unreachable() {
        let remote = InMemoryRemote::new();
        let store = remote.connect().await;
        remote.set_offline(true).await;
        let err = store.sync().await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable { .. }));
        remote.set_offline(false).await;
        store.sync().await.unwrap();
    }

    #[tokio::test]
    async fn damaged_record_reads_as_an_invariant_violation() {
        let remote = InMemoryRemote::new();
        remote.put_unchecked(Bucket::Retry, damaged("W1")).await;
        let store = remote.connect().await;

        let err = store
            .read(Bucket::Retry, &WorkId::parse("W1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_bad_record(), "{err}");
        assert_eq!(store.list(Bucket::Retry).await.unwrap().len(), 1);
    }
}
