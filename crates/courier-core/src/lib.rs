//! courier-core
//!
//! Core building blocks for the Courier background job runtime.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, OutboundChannel, Clock, IdGenerator）
//! - **queue**: Broker（lease 付き poll, store retry budget）と RetryPolicy
//! - **governor**: token bucket による送信レート制御
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **app**: アプリケーションロジック（builder, producer, worker_loop, orchestrator など）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, LogChannel）
//! - **config**: 設定の読み込み（file + env）

pub mod app;
pub mod config;
pub mod domain;
pub mod governor;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{App, AppBuilder, BuildError};
pub use config::CourierConfig;
pub use domain::{CourierError, StoreError};
