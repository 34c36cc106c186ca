//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 共有リポジトリ、時刻、実処理、work の供給元はすべて trait 越しに扱い、
//! 実装（git / in-memory / command など）は `impls` に置きます。

pub mod clock;
pub mod executor;
pub mod source;
pub mod work_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::TaskExecutor;
pub use self::source::WorkSource;
pub use self::work_store::{BucketListing, Change, Changeset, WorkStore};
