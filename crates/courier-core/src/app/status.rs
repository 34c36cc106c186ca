//! Status - bucket ごとの件数

use serde::{Deserialize, Serialize};

use crate::domain::{Bucket, StoreError};
use crate::ports::WorkStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub available: usize,
    pub active: usize,
    pub completed: usize,
    pub retry: usize,
    pub failed: usize,
    pub archive: usize,
    /// Claim intents not yet retracted or swept.
    pub pending_intents: usize,
}

impl BucketCounts {
    /// Counts on the store's current local view; call `sync` first for a
    /// fresh picture.
    pub async fn collect(store: &dyn WorkStore) -> Result<Self, StoreError> {
        let mut counts = Self::default();
        for bucket in Bucket::ALL {
            let n = store.list(bucket).await?.len();
            *counts.slot(bucket) = n;
        }
        counts.pending_intents = store.list_intents(None).await?.len();
        Ok(counts)
    }

    fn slot(&mut self, bucket: Bucket) -> &mut usize {
        match bucket {
            Bucket::Available => &mut self.available,
            Bucket::Active => &mut self.active,
            Bucket::Completed => &mut self.completed,
            Bucket::Retry => &mut self.retry,
            Bucket::Failed => &mut self.failed,
            Bucket::Archive => &mut self.archive,
        }
    }

    pub fn total(&self) -> usize {
        self.available + self.active + self.completed + self.retry + self.failed + self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::{at, order};
    use crate::domain::{ClaimIntent, WorkerId};
    use crate::impls::InMemoryWorkStore;
    use crate::ports::Changeset;

    #[tokio::test]
    async fn counts_every_bucket_and_pending_intents() {
        let store = InMemoryWorkStore::standalone().await;
        store.write(Bucket::Available, order("W1")).await.unwrap();
        store.write(Bucket::Available, order("W2")).await.unwrap();
        let mut done = order("W3");
        done.claim(WorkerId::parse("w").unwrap(), at(0)).unwrap();
        done.complete(serde_json::Value::Null, at(1)).unwrap();
        store.write(Bucket::Completed, done).await.unwrap();
        store
            .publish(Changeset::new("intent").put_intent(ClaimIntent::new(
                order("W1").work_id,
                WorkerId::parse("w").unwrap(),
                at(2),
            )))
            .await
            .unwrap();

        let counts = BucketCounts::collect(&store).await.unwrap();
        assert_eq!(counts.available, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.pending_intents, 1);
        assert_eq!(counts.total(), 3);
    }
}
