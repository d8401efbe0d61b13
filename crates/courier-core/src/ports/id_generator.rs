//! IdGenerator port - ID 生成の抽象化
//!
//! Ids are ULIDs stamped with the store's clock, so ids minted under a
//! `ManualClock` sort by simulated time.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{LeaseToken, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn lease_token(&self) -> LeaseToken;
}

/// ULID generator driven by a `Clock`.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn lease_token(&self) -> LeaseToken {
        LeaseToken::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        assert_ne!(id1, id2);
        assert!(id_gen.lease_token().to_string().starts_with("lease-"));
    }

    #[test]
    fn timestamp_part_follows_the_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(ManualClock::new(fixed_time)));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();

        // random part differs, timestamp part doesn't
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            u64::try_from(fixed_time.timestamp_millis()).unwrap()
        );
    }
}
