//! Bridge statistics: relaxed atomic counters shared by every task, plus a
//! serializable point-in-time snapshot for the debug HTTP surface.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use intellichem_proto::LinkCounters;
use serde::Serialize;

// ── Broker connection state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    NetConnecting,
    NetConnected,
    BrokerConnecting,
    BrokerConnected,
    Error,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NetConnecting,
            2 => Self::NetConnected,
            3 => Self::BrokerConnecting,
            4 => Self::BrokerConnected,
            5 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// One instance per process, shared by handle. All counters are monotonic;
/// the link-layer set mirrors the resynchronizer's counters after each
/// receive drain.
#[derive(Default)]
pub struct BridgeStats {
    pub polls: AtomicU64,
    pub responses: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_in: AtomicU64,
    pub frames_ok: AtomicU64,
    pub bad_checksum: AtomicU64,
    pub overflow: AtomicU64,
    pub resync: AtomicU64,
    pub published: AtomicU64,
    pub reconnections: AtomicU64,
    pub dropped_snapshots: AtomicU64,
    pub dropped_commands: AtomicU64,
    pub command_parse_errors: AtomicU64,
    connection_state: AtomicU8,
    stale: AtomicBool,
}

impl BridgeStats {
    /// Mirror the resynchronizer's counters. Called only by the poller, so
    /// plain stores are enough.
    pub fn sync_link(&self, c: &LinkCounters) {
        self.bytes_in.store(c.bytes_in, Ordering::Relaxed);
        self.frames_ok.store(c.frames_ok, Ordering::Relaxed);
        self.bad_checksum.store(c.bad_checksum, Ordering::Relaxed);
        self.overflow.store(c.overflow, Ordering::Relaxed);
        self.resync.store(c.resync, Ordering::Relaxed);
    }

    pub fn set_connection_state(&self, s: ConnectionState) {
        self.connection_state.store(s as u8, Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection_state.load(Ordering::Relaxed))
    }

    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            bad_checksum: self.bad_checksum.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            resync: self.resync.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            dropped_snapshots: self.dropped_snapshots.load(Ordering::Relaxed),
            dropped_commands: self.dropped_commands.load(Ordering::Relaxed),
            command_parse_errors: self.command_parse_errors.load(Ordering::Relaxed),
            stale: self.is_stale(),
            connection_state: self.connection_state(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub polls: u64,
    pub responses: u64,
    pub errors: u64,
    pub bytes_in: u64,
    pub frames_ok: u64,
    pub bad_checksum: u64,
    pub overflow: u64,
    pub resync: u64,
    pub published: u64,
    pub reconnections: u64,
    pub dropped_snapshots: u64,
    pub dropped_commands: u64,
    pub command_parse_errors: u64,
    pub stale: bool,
    pub connection_state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = BridgeStats::default();
        stats.polls.fetch_add(1, Ordering::Relaxed);
        stats.polls.fetch_add(1, Ordering::Relaxed);
        stats.command_parse_errors.fetch_add(1, Ordering::Relaxed);
        stats.set_connection_state(ConnectionState::BrokerConnected);
        stats.set_stale(true);

        let snap = stats.snapshot();
        assert_eq!(snap.polls, 2);
        assert_eq!(snap.command_parse_errors, 1);
        assert_eq!(snap.connection_state, ConnectionState::BrokerConnected);
        assert!(snap.stale);
        assert_eq!(snap.responses, 0);
    }

    #[test]
    fn link_counters_mirror() {
        let stats = BridgeStats::default();
        stats.sync_link(&LinkCounters {
            bytes_in: 100,
            frames_ok: 3,
            bad_checksum: 1,
            overflow: 0,
            resync: 2,
        });
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.frames_ok, 3);
        assert_eq!(snap.resync, 2);
    }
}
