//! Status - キューの状態サマリ
//!
//! Counts per state plus the facts an operator asks first when something
//! is stuck: how old the oldest waiting task is, and which kinds are
//! piling up in the dead-letter bucket.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{QueueCounts, TaskKind, TaskRecord, TaskState};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Status {
    pub counts: QueueCounts,
    pub oldest_pending_since: Option<DateTime<Utc>>,
    pub dead_lettered_by_kind: BTreeMap<TaskKind, usize>,
}

impl Status {
    pub fn from_records(rows: &[TaskRecord]) -> Self {
        let mut status = Self::default();
        for row in rows {
            status.counts.record(row.state);
            match row.state {
                TaskState::Pending => {
                    status.oldest_pending_since = Some(match status.oldest_pending_since {
                        Some(t) => t.min(row.created_at),
                        None => row.created_at,
                    });
                }
                TaskState::DeadLettered => {
                    *status
                        .dead_lettered_by_kind
                        .entry(row.kind.clone())
                        .or_default() += 1;
                }
                _ => {}
            }
        }
        status
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(f, "pending        {}", c.pending)?;
        writeln!(f, "in_flight      {}", c.in_flight)?;
        writeln!(f, "succeeded      {}", c.succeeded)?;
        writeln!(f, "failed         {}", c.failed)?;
        write!(f, "dead_lettered  {}", c.dead_lettered)?;
        if let Some(since) = self.oldest_pending_since {
            write!(f, "\noldest pending since {}", since.to_rfc3339())?;
        }
        for (kind, n) in &self.dead_lettered_by_kind {
            write!(f, "\n  dead {kind}: {n}")?;
        }
        Ok(())
    }
}
