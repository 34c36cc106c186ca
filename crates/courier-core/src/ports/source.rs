//! WorkSource port - replenishment の source of truth

use async_trait::async_trait;

use crate::domain::{SourceError, WorkSeed};

/// Supplies candidate seeds for new work orders.
///
/// The orchestrator de-duplicates against what is already in the store, so a
/// source may hand back the same seeds on every call.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn fetch_seeds(&self) -> Result<Vec<WorkSeed>, SourceError>;
}
