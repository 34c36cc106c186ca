//! TaskExecutor port - 実際の処理（scrape 等）は外部の責務
//!
//! Worker Loop は executor の中身を知らない。WorkOrder を渡し、結果 payload
//! かエラーメッセージを受け取るだけ。

use async_trait::async_trait;

use crate::domain::{ProcessingError, WorkOrder};

/// Executes one claimed work order.
///
/// Called only after the claim has been published, and never cancelled by the
/// worker once started.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, order: &WorkOrder) -> Result<serde_json::Value, ProcessingError>;
}
