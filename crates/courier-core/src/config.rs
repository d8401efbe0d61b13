//! Runtime configuration.
//!
//! Loaded in layers with the `config` crate:
//! 1. built-in defaults
//! 2. `courier.toml` in the working directory, or an explicit file
//! 3. environment variables with the `COURIER__` prefix
//!    (e.g. `COURIER__MAX_ATTEMPTS=3`)
//!
//! Durations are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::CourierError;
use crate::governor::BucketLimit;
use crate::queue::{BrokerSettings, RetryPolicy};

const DEFAULT_FILE: &str = "courier";
const ENV_PREFIX: &str = "COURIER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// How long a lease stays valid without an ack/nack.
    #[serde(with = "duration_ms")]
    pub lease_duration: Duration,
    /// Deliveries before a failing task is dead-lettered.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Token bucket size for outbound sends.
    pub rate_capacity: u32,
    pub rate_refill_per_sec: f64,
    /// Bucket per message target, on top of the global one. 0 disables it.
    pub target_rate_capacity: u32,
    pub target_rate_refill_per_sec: f64,

    pub worker_concurrency: usize,
    /// How long shutdown waits for in-flight handlers before releasing their
    /// leases.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,

    /// Hard limit on one handler call.
    #[serde(with = "duration_ms")]
    pub handler_timeout: Duration,
    /// Upper bound of one broker poll.
    #[serde(with = "duration_ms")]
    pub poll_wait: Duration,
    /// Re-check interval inside a poll.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long a worker waits for a send token before deferring the send.
    #[serde(with = "duration_ms")]
    pub dispatch_wait: Duration,
    /// Hard limit on one channel send; a send that overruns it is retried.
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,

    pub broker_pool_size: usize,
    pub store_retry_budget: u32,
    #[serde(with = "duration_ms")]
    pub store_retry_delay: Duration,

    pub max_payload_bytes: usize,
    /// SQLite database file, shareable between processes. In-memory only
    /// when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            rate_capacity: 10,
            rate_refill_per_sec: 1.0,
            target_rate_capacity: 5,
            target_rate_refill_per_sec: 0.5,
            worker_concurrency: 4,
            drain_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(20),
            poll_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            dispatch_wait: Duration::from_millis(500),
            send_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(5),
            broker_pool_size: 8,
            store_retry_budget: 3,
            store_retry_delay: Duration::from_millis(200),
            max_payload_bytes: 256 * 1024,
            store_path: None,
        }
    }
}

impl CourierConfig {
    /// Load from `path` (or `./courier.toml` if present) plus the
    /// environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, CourierError> {
        Self::load_from(path, None)
    }

    /// `env` replaces the process environment; for tests.
    fn load_from(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, CourierError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        let fail = |msg: String| Err(CourierError::Config(msg));

        if self.worker_concurrency == 0 {
            return fail("worker_concurrency must be at least 1".into());
        }
        if self.rate_capacity == 0 {
            return fail("rate_capacity must be at least 1".into());
        }
        for (name, rate) in [
            ("rate_refill_per_sec", self.rate_refill_per_sec),
            ("target_rate_refill_per_sec", self.target_rate_refill_per_sec),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return fail(format!("{name} must be a non-negative number, got {rate}"));
            }
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1".into());
        }
        if self.base_delay > self.max_delay {
            return fail(format!(
                "base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            ));
        }
        if self.lease_duration.is_zero() {
            return fail("lease_duration must be positive".into());
        }
        if self.send_timeout.is_zero() {
            return fail("send_timeout must be positive".into());
        }
        // handler, then a token wait and a send, all inside one lease
        let worst_case = self.handler_timeout + self.dispatch_wait + self.send_timeout;
        if worst_case > self.lease_duration {
            return fail(format!(
                "handler_timeout + dispatch_wait + send_timeout ({:?}) exceeds \
                 lease_duration ({:?})",
                worst_case, self.lease_duration
            ));
        }
        if self.broker_pool_size == 0 {
            return fail("broker_pool_size must be at least 1".into());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay, self.max_delay, self.max_attempts)
    }

    pub fn rate_limit(&self) -> BucketLimit {
        BucketLimit::new(self.rate_capacity, self.rate_refill_per_sec)
    }

    pub fn target_rate_limit(&self) -> Option<BucketLimit> {
        (self.target_rate_capacity > 0).then(|| {
            BucketLimit::new(self.target_rate_capacity, self.target_rate_refill_per_sec)
        })
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            lease_duration: self.lease_duration,
            poll_interval: self.poll_interval,
            pool_size: self.broker_pool_size,
            store_retry_budget: self.store_retry_budget,
            store_retry_delay: self.store_retry_delay,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
