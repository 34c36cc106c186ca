//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **GitWorkStore**: 共有 git リポジトリ（本番用）
//! - **InMemoryWorkStore**: revision 付き remote を模した開発・テスト用 store
//! - **CommandExecutor**: 外部コマンドで work order を処理
//! - **SeedFileSource / VecSource**: replenishment の供給元

pub mod codec;
pub mod command_executor;
pub mod git_store;
pub mod memory_store;
pub mod seed_source;

// 主要な型を再エクスポート
pub use self::command_executor::CommandExecutor;
pub use self::git_store::GitWorkStore;
pub use self::memory_store::{InMemoryRemote, InMemoryWorkStore};
pub use self::seed_source::{SeedFileSource, VecSource};
