//! WorkStore port - 共有リポジトリ（bucket ごとのディレクトリ）が正本
//!
//! # 設計原則
//! - すべての変更は `publish(Changeset)` 1 回 = 1 commit で反映する
//! - publish の前に必ず `sync()`、remote が先に進んでいたら `StoreError::Conflict`
//! - Conflict を受けた呼び出し側は sync してから操作全体をやり直す（部分適用しない）
//! - 読み取り（list / read / list_intents）は最後に sync したローカル状態を見る

use async_trait::async_trait;

use crate::domain::{Bucket, ClaimIntent, StoreError, WorkId, WorkOrder, WorkerId};

/// One mutation inside a changeset.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create or overwrite `<bucket>/<work_id>`.
    Put { bucket: Bucket, order: WorkOrder },

    /// Remove `<bucket>/<work_id>`; the record must exist.
    Delete { bucket: Bucket, work_id: WorkId },

    /// Stage a claim intent under `claims/<work_id>/<worker_id>`.
    PutIntent(ClaimIntent),

    /// Remove a claim intent; missing intents are ignored.
    DeleteIntent { work_id: WorkId, worker_id: WorkerId },
}

/// An ordered batch of changes published as one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub message: String,
    pub changes: Vec<Change>,
}

impl Changeset {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            changes: Vec::new(),
        }
    }

    pub fn put(mut self, bucket: Bucket, order: WorkOrder) -> Self {
        self.changes.push(Change::Put { bucket, order });
        self
    }

    pub fn delete(mut self, bucket: Bucket, work_id: WorkId) -> Self {
        self.changes.push(Change::Delete { bucket, work_id });
        self
    }

    /// `put` into `to` plus `delete` from `from`.
    pub fn relocate(self, from: Bucket, to: Bucket, order: WorkOrder) -> Self {
        let work_id = order.work_id.clone();
        let this = self.put(to, order);
        if from == to { this } else { this.delete(from, work_id) }
    }

    pub fn put_intent(mut self, intent: ClaimIntent) -> Self {
        self.changes.push(Change::PutIntent(intent));
        self
    }

    pub fn delete_intent(mut self, work_id: WorkId, worker_id: WorkerId) -> Self {
        self.changes.push(Change::DeleteIntent { work_id, worker_id });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Reject a changeset that would store a record in the wrong bucket.
    pub fn validate(&self) -> Result<(), StoreError> {
        for change in &self.changes {
            if let Change::Put { bucket, order } = change {
                order.validate_in(*bucket)?;
            }
        }
        Ok(())
    }
}

/// Snapshot of the work ids in one bucket.
///
/// Iterating does not consume it, so a caller can walk the listing again
/// (for example after a lost claim) without another round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketListing {
    bucket: Option<Bucket>,
    ids: Vec<WorkId>,
}

impl BucketListing {
    pub fn new(bucket: Bucket, mut ids: Vec<WorkId>) -> Self {
        ids.sort();
        ids.dedup();
        Self {
            bucket: Some(bucket),
            ids,
        }
    }

    pub fn bucket(&self) -> Option<Bucket> {
        self.bucket
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WorkId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, work_id: &WorkId) -> bool {
        self.ids.binary_search(work_id).is_ok()
    }

    pub fn into_vec(self) -> Vec<WorkId> {
        self.ids
    }
}

impl<'a> IntoIterator for &'a BucketListing {
    type Item = &'a WorkId;
    type IntoIter = std::slice::Iter<'a, WorkId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// WorkStore は bucket・claim intent の正本
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Pull the remote state; the remote always wins over local leftovers.
    async fn sync(&self) -> Result<(), StoreError>;

    /// Work ids currently in `bucket` (as of the last sync).
    async fn list(&self, bucket: Bucket) -> Result<BucketListing, StoreError>;

    /// Read one record; `Ok(None)` when it is not in that bucket.
    async fn read(&self, bucket: Bucket, work_id: &WorkId) -> Result<Option<WorkOrder>, StoreError>;

    /// Intents staged for `work_id`, or for every work order when `None`.
    async fn list_intents(&self, work_id: Option<&WorkId>) -> Result<Vec<ClaimIntent>, StoreError>;

    /// Apply the whole changeset as one commit, or nothing.
    async fn publish(&self, changeset: Changeset) -> Result<(), StoreError>;

    /// Create or overwrite a single record.
    async fn write(&self, bucket: Bucket, order: WorkOrder) -> Result<(), StoreError> {
        let message = format!("write {} to {}", order.work_id, bucket);
        self.publish(Changeset::new(message).put(bucket, order)).await
    }

    /// Move a record between buckets in one publish.
    ///
    /// `order` is the record as it should look in `to` (status already
    /// transitioned).
    async fn move_order(&self, from: Bucket, to: Bucket, order: WorkOrder) -> Result<(), StoreError> {
        let message = format!("move {} {} -> {}", order.work_id, from, to);
        self.publish(Changeset::new(message).relocate(from, to, order))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::order;

    #[test]
    fn relocate_puts_then_deletes() {
        let o = order("W1");
        let cs = Changeset::new("m").relocate(Bucket::Retry, Bucket::Available, o.clone());
        assert_eq!(
            cs.changes,
            vec![
                Change::Put {
                    bucket: Bucket::Available,
                    order: o.clone()
                },
                Change::Delete {
                    bucket: Bucket::Retry,
                    work_id: o.work_id.clone()
                },
            ]
        );
    }

    #[test]
    fn validate_rejects_record_in_wrong_bucket() {
        let cs = Changeset::new("m").put(Bucket::Completed, order("W1"));
        assert!(matches!(cs.validate(), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn listing_is_sorted_and_restartable() {
        let ids = ["b", "a", "c", "a"]
            .into_iter()
            .map(|s| WorkId::parse(s).unwrap())
            .collect();
        let listing = BucketListing::new(Bucket::Available, ids);
        let first: Vec<_> = listing.iter().map(|id| id.as_str()).collect();
        let second: Vec<_> = (&listing).into_iter().map(|id| id.as_str()).collect();
        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(first, second);
        assert!(listing.contains(&WorkId::parse("b").unwrap()));
    }
}
