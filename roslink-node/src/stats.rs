//! Per-connection traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between a connection's tasks and its observers.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    drops: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for an outbound connection (drops are not tracked there).
    pub fn snapshot_outbound(&self) -> StatsSnapshot {
        StatsSnapshot {
            drop_estimate: -1,
            ..self.snapshot_raw()
        }
    }

    /// Snapshot for an inbound connection (drops counted on queue overflow).
    pub fn snapshot_inbound(&self) -> StatsSnapshot {
        self.snapshot_raw()
    }

    fn snapshot_raw(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            drop_estimate: self.drops.load(Ordering::Relaxed) as i64,
        }
    }
}

/// Point-in-time view of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Estimated dropped messages; `-1` when not tracked.
    pub drop_estimate: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnectionStats::new();
        stats.add_bytes_sent(10);
        stats.add_bytes_received(20);
        stats.add_message_sent();
        stats.add_message_received();
        stats.add_message_received();

        let snap = stats.snapshot_inbound();
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.bytes_received, 20);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.drop_estimate, 0);
    }

    #[test]
    fn test_outbound_drops_untracked() {
        let stats = ConnectionStats::new();
        stats.add_drop();
        assert_eq!(stats.snapshot_outbound().drop_estimate, -1);
        assert_eq!(stats.snapshot_inbound().drop_estimate, 1);
    }
}
