//! App - アプリケーション層
//!
//! ports と queue を組み合わせて、投入・実行・点検の流れを作ります。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: ワイヤリングと起動時検証
//! - **Producer**: タスク投入（検証 + idempotency）
//! - **Admin**: 点検・replay・discard
//! - **DispatchGateway**: rate-governed な外部送信
//! - **WorkerPool**: poll → handle → ack/nack/deadletter
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **Orchestrator**: 起動と graceful shutdown

pub mod admin;
pub mod builder;
pub mod gateway;
pub mod orchestrator;
pub mod producer;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::admin::Admin;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::gateway::{
    DISPATCH_KIND, DispatchError, DispatchGateway, DispatchHandler, SendOutcome,
};
pub use self::orchestrator::Orchestrator;
pub use self::producer::Producer;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::Status;
pub use self::worker_loop::{InFlight, ShutdownReport, WorkerContext, WorkerPool, WorkerSettings};
