//! Domain model - ドメインモデル
//!
//! - ids: WorkId / WorkerId
//! - state: WorkStatus と Bucket の対応
//! - work_order: 永続化されるレコードと状態遷移
//! - intent: claim intent と tie-break
//! - errors: エラー型と分類

pub mod errors;
pub mod ids;
pub mod intent;
pub mod state;
pub mod work_order;

pub use errors::{
    ClaimError, ConfigError, ErrorKind, IdError, InvariantViolation, OrchestratorError,
    ProcessingError, SourceError, StoreError, TransitionError, WorkerError,
};
pub use ids::{WorkId, WorkerId};
pub use intent::{ClaimIntent, resolve_winner};
pub use state::{Bucket, WorkStatus};
pub use work_order::{Claim, WorkError, WorkOrder, WorkSeed};
