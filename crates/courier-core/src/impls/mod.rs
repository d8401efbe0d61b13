//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: 開発・テスト用
//! - **SqliteTaskStore**: SQLite ファイル（複数プロセスで共有可）
//! - **LogChannel** / **RecordingChannel**: OutboundChannel

pub mod inmem_store;
pub mod log_channel;
pub mod sqlite_store;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::log_channel::{LogChannel, RecordingChannel};
pub use self::sqlite_store::SqliteTaskStore;

use std::path::Path;
use std::sync::Arc;

use crate::domain::StoreError;
use crate::ports::{SystemClock, TaskStore};

/// SQLite store when a path is configured, in-memory otherwise.
pub async fn open_store(path: Option<&Path>) -> Result<Arc<dyn TaskStore>, StoreError> {
    match path {
        Some(path) => Ok(Arc::new(
            SqliteTaskStore::open(path, Arc::new(SystemClock)).await?,
        )),
        None => Ok(Arc::new(InMemoryTaskStore::default())),
    }
}
