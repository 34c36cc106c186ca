//! App - アプリケーション層
//!
//! ports を組み合わせて worker と orchestrator の振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **ClaimResolver**: intent → contention window → tie-break → move
//! - **WorkerLoop**: stop policy 評価 → claim → executor → completed / retry
//! - **StopPolicy**: target reached > no work > idle timeout
//! - **Orchestrator**: stale claim 回収、retry 昇格、archive、補充
//! - **RetryPolicy**: store 操作の exponential backoff
//! - **SessionExport / BucketCounts**: 監査用の出力と件数

pub mod claim;
pub mod orchestrator;
pub mod policy;
pub mod retry;
pub mod session;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::claim::{ClaimOutcome, ClaimResolver};
pub use self::orchestrator::{CycleReport, Orchestrator, RunSummary};
pub use self::policy::{StopPolicy, StopReason};
pub use self::retry::{RetryPolicy, with_store_retry};
pub use self::session::{HistoryEntry, HistoryOutcome, SessionCounters, SessionExport};
pub use self::status::BucketCounts;
pub use self::worker_loop::{WorkerLoop, WorkerReport, WorkerState};
