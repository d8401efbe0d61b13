//! Queue module: the broker in front of the task store, and retry timing.

mod broker;
mod retry;

pub use broker::{Broker, BrokerSettings};
pub use retry::RetryPolicy;
