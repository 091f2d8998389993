//! Monitoring sink for the replication core.
//!
//! The core never owns a metrics registry: every state transition reports
//! to an injected [`ReplicationMonitor`], and the embedding decides where
//! the numbers go. [`CounterMonitor`] is the default in-memory sink, also
//! used by the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use dirsync_proto::msg::AssuredMode;

/// Counters the core increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Counter {
    AssuredSrSentUpdates,
    AssuredSrAcknowledgedUpdates,
    AssuredSrNotAcknowledgedUpdates,
    AssuredSrTimeoutUpdates,
    AssuredSrWrongStatusUpdates,
    AssuredSrReplayErrorUpdates,
    AssuredSrReceivedUpdates,
    AssuredSrReceivedUpdatesAcked,
    AssuredSrReceivedUpdatesNotAcked,
    AssuredSdSentUpdates,
    AssuredSdAcknowledgedUpdates,
    AssuredSdTimeoutUpdates,
    SentUpdates,
    ReceivedUpdates,
    ReplayedUpdates,
    ModifyConflicts,
    NamingConflictsResolved,
    NamingConflictsUnresolved,
}

impl Counter {
    /// The exported counter name.
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::AssuredSrSentUpdates => "assured-sr-sent-updates",
            Counter::AssuredSrAcknowledgedUpdates => "assured-sr-acknowledged-updates",
            Counter::AssuredSrNotAcknowledgedUpdates => "assured-sr-not-acknowledged-updates",
            Counter::AssuredSrTimeoutUpdates => "assured-sr-timeout-updates",
            Counter::AssuredSrWrongStatusUpdates => "assured-sr-wrong-status-updates",
            Counter::AssuredSrReplayErrorUpdates => "assured-sr-replay-error-updates",
            Counter::AssuredSrReceivedUpdates => "assured-sr-received-updates",
            Counter::AssuredSrReceivedUpdatesAcked => "assured-sr-received-updates-acked",
            Counter::AssuredSrReceivedUpdatesNotAcked => "assured-sr-received-updates-not-acked",
            Counter::AssuredSdSentUpdates => "assured-sd-sent-updates",
            Counter::AssuredSdAcknowledgedUpdates => "assured-sd-acknowledged-updates",
            Counter::AssuredSdTimeoutUpdates => "assured-sd-timeout-updates",
            Counter::SentUpdates => "sent-updates",
            Counter::ReceivedUpdates => "received-updates",
            Counter::ReplayedUpdates => "replayed-updates",
            Counter::ModifyConflicts => "modify-conflicts",
            Counter::NamingConflictsResolved => "naming-conflicts-resolved",
            Counter::NamingConflictsUnresolved => "naming-conflicts-unresolved",
        }
    }
}

/// Sink for counter increments and per-remote-server error accounting.
pub trait ReplicationMonitor: Send + Sync {
    /// Increment a counter by one.
    fn incr(&self, counter: Counter);

    /// Record an assured error attributed to a specific remote server.
    fn server_error(&self, mode: AssuredMode, server_id: u16);
}

/// A monitor that drops everything.
#[derive(Debug, Default)]
pub struct NoopMonitor;

impl ReplicationMonitor for NoopMonitor {
    fn incr(&self, _counter: Counter) {}
    fn server_error(&self, _mode: AssuredMode, _server_id: u16) {}
}

/// In-memory counting monitor.
#[derive(Debug, Default)]
pub struct CounterMonitor {
    inner: Mutex<CounterState>,
}

#[derive(Debug, Default, Clone)]
struct CounterState {
    counters: BTreeMap<&'static str, u64>,
    sr_server_errors: BTreeMap<u16, u64>,
    sd_server_errors: BTreeMap<u16, u64>,
}

/// Point-in-time copy of all counters, serializable for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Counter values by exported name.
    pub counters: BTreeMap<&'static str, u64>,
    /// Safe-read errors per remote server id.
    pub sr_server_errors: BTreeMap<u16, u64>,
    /// Safe-data errors per remote server id.
    pub sd_server_errors: BTreeMap<u16, u64>,
}

impl MonitorSnapshot {
    /// Render the snapshot as JSON for operator tooling.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl CounterMonitor {
    /// Create a monitor with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        *self.inner.lock().unwrap().counters.get(counter.as_str()).unwrap_or(&0)
    }

    /// Errors recorded against a server in the given mode.
    pub fn server_errors(&self, mode: AssuredMode, server_id: u16) -> u64 {
        let inner = self.inner.lock().unwrap();
        let map = match mode {
            AssuredMode::SafeRead => &inner.sr_server_errors,
            AssuredMode::SafeData => &inner.sd_server_errors,
        };
        *map.get(&server_id).unwrap_or(&0)
    }

    /// Snapshot every counter.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.inner.lock().unwrap();
        MonitorSnapshot {
            counters: inner.counters.clone(),
            sr_server_errors: inner.sr_server_errors.clone(),
            sd_server_errors: inner.sd_server_errors.clone(),
        }
    }
}

impl ReplicationMonitor for CounterMonitor {
    fn incr(&self, counter: Counter) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(counter.as_str()).or_insert(0) += 1;
    }

    fn server_error(&self, mode: AssuredMode, server_id: u16) {
        let mut inner = self.inner.lock().unwrap();
        let map = match mode {
            AssuredMode::SafeRead => &mut inner.sr_server_errors,
            AssuredMode::SafeData => &mut inner.sd_server_errors,
        };
        *map.entry(server_id).or_insert(0) += 1;
    }
}
