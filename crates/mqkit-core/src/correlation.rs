//! Correlation id generation for request/reply calls.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces correlation ids for outbound calls.
///
/// Ids must be unique among calls outstanding on the same reply address.
pub trait CorrelationIdGenerator: Send + Sync {
    /// Next id.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCorrelationIds;

impl CorrelationIdGenerator for UuidCorrelationIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix-N` ids.
#[derive(Debug)]
pub struct SequentialCorrelationIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialCorrelationIds {
    /// Start counting at 1.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl CorrelationIdGenerator for SequentialCorrelationIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uuid_ids_are_distinct() {
        let ids = UuidCorrelationIds;
        let seen: HashSet<String> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialCorrelationIds::new("call");
        assert_eq!(ids.next_id(), "call-1");
        assert_eq!(ids.next_id(), "call-2");
    }
}
