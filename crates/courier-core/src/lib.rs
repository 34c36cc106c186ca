//! courier-core
//!
//! Core building blocks for courier: many independent worker processes
//! sharing one git repository of work orders, with no central lock.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, work_order, intent, errors）
//! - **ports**: 抽象化レイヤー（WorkStore, Clock, TaskExecutor, WorkSource）
//! - **impls**: 実装（GitWorkStore, InMemoryWorkStore, CommandExecutor, seed sources）
//! - **app**: アプリケーションロジック（claim, worker_loop, policy, orchestrator, ...）
//! - **config**: environment preset + TOML + CLI override で組み立てる設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
