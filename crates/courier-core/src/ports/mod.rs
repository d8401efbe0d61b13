//! Ports - 抽象化レイヤー
//!
//! Each trait is the seam to something outside the core: the persistent task
//! store, the outbound channel, time, and id generation.

pub mod channel;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::channel::{ChannelError, OutboundChannel};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{KindFilter, ListFilter, TaskStore};
