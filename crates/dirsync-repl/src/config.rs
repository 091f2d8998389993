//! Per-domain replication configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dirsync_proto::msg::AssuredMode;

use crate::error::ReplError;

/// Configuration of one replicated suffix.
///
/// The assured settings, heartbeat interval, weight and purge delay are
/// hot-reloadable; changing the server list, the identity fields or the
/// window requires the domain to reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Replica id of this directory server, unique across the topology.
    pub replica_id: u16,
    /// The replicated base DN.
    pub base_dn: String,
    /// Topology group of this replica.
    pub group_id: u8,
    /// Data generation held locally, -1 when uninitialized.
    pub generation_id: i64,
    /// Whether local updates request acknowledgements by default.
    pub assured: bool,
    /// Default acknowledgement criterion.
    pub assured_mode: AssuredMode,
    /// Servers that must store a change in safe-data mode, including self.
    pub safe_data_level: u8,
    /// Acknowledgement deadline in milliseconds.
    pub assured_timeout_ms: u64,
    /// Heartbeat emission interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Flow-control window granted to the peer.
    pub window_size: u32,
    /// Load-balancing weight advertised for this replica.
    pub weight: u8,
    /// How long historical conflict metadata is retained, in milliseconds.
    pub purge_delay_ms: u64,
    /// Candidate replication server URLs.
    pub replication_servers: Vec<String>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            base_dn: String::new(),
            group_id: 1,
            generation_id: -1,
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
            assured_timeout_ms: 2_000,
            heartbeat_interval_ms: 10_000,
            window_size: 100,
            weight: 1,
            purge_delay_ms: 24 * 60 * 60 * 1000,
            replication_servers: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Reject configurations the domain cannot run with.
    pub fn validate(&self) -> Result<(), ReplError> {
        if self.base_dn.is_empty() {
            return Err(invalid("base_dn must not be empty"));
        }
        if self.safe_data_level == 0 {
            return Err(invalid("safe_data_level must be at least 1"));
        }
        if self.window_size == 0 {
            return Err(invalid("window_size must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms must be positive"));
        }
        Ok(())
    }

    /// The acknowledgement deadline.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout_ms)
    }

    /// The heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The history purge horizon.
    pub fn purge_delay(&self) -> Duration {
        Duration::from_millis(self.purge_delay_ms)
    }

    /// True when switching to `new` requires dropping the current session.
    pub fn reconnect_required(&self, new: &DomainConfig) -> bool {
        self.replica_id != new.replica_id
            || self.base_dn != new.base_dn
            || self.group_id != new.group_id
            || self.generation_id != new.generation_id
            || self.window_size != new.window_size
            || self.replication_servers != new.replication_servers
    }
}

fn invalid(reason: &str) -> ReplError {
    ReplError::InvalidConfiguration { reason: reason.to_string() }
}
