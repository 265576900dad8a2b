use std::sync::atomic::{AtomicU64, Ordering};

use crate::direction::Direction;

/// Per-channel transfer counters.
///
/// Updated by the owning channel; safe to read from another thread through a shared
/// reference (e.g. a telemetry task holding the channel behind a lock).
#[derive(Debug, Default)]
pub struct TransferStats {
    fetch_copies: AtomicU64,
    fetch_bytes: AtomicU64,
    assign_copies: AtomicU64,
    assign_bytes: AtomicU64,
    waits: AtomicU64,
    protocol_violations: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_copy(&self, direction: Direction, bytes: usize) {
        let (copies, total) = match direction {
            Direction::Fetch => (&self.fetch_copies, &self.fetch_bytes),
            Direction::Assign => (&self.assign_copies, &self.assign_bytes),
        };
        copies.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            fetch_copies: self.fetch_copies.load(Ordering::Relaxed),
            fetch_bytes: self.fetch_bytes.load(Ordering::Relaxed),
            assign_copies: self.assign_copies.load(Ordering::Relaxed),
            assign_bytes: self.assign_bytes.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub fetch_copies: u64,
    pub fetch_bytes: u64,
    pub assign_copies: u64,
    pub assign_bytes: u64,
    pub waits: u64,
    pub protocol_violations: u64,
}

impl TransferStatsSnapshot {
    pub fn bytes_total(&self) -> u64 {
        self.fetch_bytes + self.assign_bytes
    }

    pub fn to_json(self) -> String {
        format!(
            "{{\"fetch_copies\":{},\"fetch_bytes\":{},\"assign_copies\":{},\"assign_bytes\":{},\"waits\":{},\"protocol_violations\":{}}}",
            self.fetch_copies,
            self.fetch_bytes,
            self.assign_copies,
            self.assign_bytes,
            self.waits,
            self.protocol_violations,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_direction() {
        let stats = TransferStats::new();
        stats.record_copy(Direction::Fetch, 16);
        stats.record_copy(Direction::Fetch, 4);
        stats.record_copy(Direction::Assign, 8);
        stats.inc_waits();
        stats.inc_protocol_violations();

        let snap = stats.snapshot();
        assert_eq!(snap.fetch_copies, 2);
        assert_eq!(snap.fetch_bytes, 20);
        assert_eq!(snap.assign_copies, 1);
        assert_eq!(snap.assign_bytes, 8);
        assert_eq!(snap.bytes_total(), 28);

        let json = snap.to_json();
        assert!(json.contains("\"fetch_bytes\":20"));
        assert!(json.contains("\"waits\":1"));
        assert!(json.contains("\"protocol_violations\":1"));
    }
}
