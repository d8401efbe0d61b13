//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! - Builder パターン
//! - 起動時検証（Fail-fast 設計）: 足りない handler は build() で落とす

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::app::admin::Admin;
use crate::app::gateway::{DispatchGateway, DispatchHandler};
use crate::app::orchestrator::Orchestrator;
use crate::app::producer::Producer;
use crate::app::reaper_loop::ReaperLoop;
use crate::app::worker_loop::{WorkerContext, WorkerPool, WorkerSettings};
use crate::config::CourierConfig;
use crate::domain::{CourierError, Decider, DefaultDecider, OutboundMessage};
use crate::governor::RateGovernor;
use crate::impls::{InMemoryTaskStore, LogChannel};
use crate::ports::{OutboundChannel, TaskStore};
use crate::queue::Broker;
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// ```ignore
/// let app = AppBuilder::new(config)
///     .with_store(store)
///     .register::<Notify, _>(NotifyHandler)?
///     .expect_kinds(&["notify"])
///     .build()?;
/// let orchestrator = app.start();
/// ```
///
/// # Fail-fast 設計
/// - expect_kinds() で期待される kind を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct AppBuilder {
    config: CourierConfig,
    store: Option<Arc<dyn TaskStore>>,
    channel: Option<Arc<dyn OutboundChannel>>,
    decider: Option<Arc<dyn Decider>>,
    registry: TypedRegistry,
    expected_kinds: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers for kinds {0:?}; these kinds were expected but not registered")]
    MissingKinds(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] CourierError),
}

impl AppBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            store: None,
            channel: None,
            decider: None,
            registry: TypedRegistry::new(),
            expected_kinds: None,
        }
    }

    /// Defaults to an `InMemoryTaskStore`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to `LogChannel`.
    pub fn with_channel(mut self, channel: Arc<dyn OutboundChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Defaults to `DefaultDecider` over the configured retry policy.
    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    /// Wire everything up. Must run inside a tokio runtime (the rate
    /// governor actor is spawned here).
    pub fn build(self) -> Result<App, BuildError> {
        let Self {
            config,
            store,
            channel,
            decider,
            mut registry,
            expected_kinds,
        } = self;

        config.validate()?;

        if let Some(expected) = &expected_kinds {
            let registered = registry.kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !registered.iter().any(|r| r.as_str() == k.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }

        let store = store.unwrap_or_else(|| Arc::new(InMemoryTaskStore::default()));
        let channel = channel.unwrap_or_else(|| Arc::new(LogChannel));
        let decider =
            decider.unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())));

        let broker = Arc::new(Broker::new(store, config.broker_settings()));
        let governor = RateGovernor::spawn_with(config.rate_limit(), config.target_rate_limit());
        let producer = Producer::new(Arc::clone(&broker), config.max_payload_bytes);
        let gateway = Arc::new(DispatchGateway::new(
            governor,
            channel,
            producer.clone(),
            config.dispatch_wait,
            config.send_timeout,
        ));
        registry.register::<OutboundMessage, _>(DispatchHandler::new(Arc::clone(&gateway)))?;

        let producer = producer.with_known_kinds(registry.kinds());
        tracing::debug!(kinds = ?registry.kinds(), "app built");

        Ok(App {
            config,
            broker,
            registry: Arc::new(registry),
            decider,
            gateway,
            producer,
        })
    }
}

/// A wired application: submit through `producer()`, inspect through
/// `admin()`, process with `start()`.
pub struct App {
    config: CourierConfig,
    broker: Arc<Broker>,
    registry: Arc<TypedRegistry>,
    decider: Arc<dyn Decider>,
    gateway: Arc<DispatchGateway>,
    producer: Producer,
}

impl App {
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn admin(&self) -> Admin {
        Admin::new(Arc::clone(&self.broker))
    }

    pub fn gateway(&self) -> Arc<DispatchGateway> {
        Arc::clone(&self.gateway)
    }

    /// Start the worker pool and the reaper.
    pub fn start(&self) -> Orchestrator {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(WorkerContext {
            broker: Arc::clone(&self.broker),
            registry: Arc::clone(&self.registry),
            decider: Arc::clone(&self.decider),
            gateway: Arc::clone(&self.gateway),
            settings: WorkerSettings {
                handler_timeout: self.config.handler_timeout,
                poll_wait: self.config.poll_wait,
                max_attempts: self.config.max_attempts,
            },
            fatal_tx: fatal_tx.clone(),
        });

        let pool = WorkerPool::spawn(self.config.worker_concurrency, ctx);
        let reaper = ReaperLoop::spawn(
            Arc::clone(&self.broker),
            self.config.reap_interval,
            fatal_tx,
        );
        Orchestrator::new(pool, reaper, fatal_rx, self.config.drain_timeout)
    }
}
