//! The closed set of replication protocol messages.
//!
//! Every PDU exchanged between a directory server and a replication server
//! is one variant of [`ReplicationMsg`]. Update messages share the common
//! [`UpdateHeader`]; everything else carries its own fields. The byte-level
//! layout lives in [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use crate::server_state::ServerState;

/// Acknowledgement mode requested for an assured update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuredMode {
    /// Acknowledged once enough servers have durably stored the change.
    SafeData,
    /// Acknowledged once the change has been replayed on a remote replica.
    SafeRead,
}

impl AssuredMode {
    /// Wire byte for this mode.
    pub fn as_u8(self) -> u8 {
        match self {
            AssuredMode::SafeData => 1,
            AssuredMode::SafeRead => 2,
        }
    }

    /// Parse the wire byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(AssuredMode::SafeData),
            2 => Some(AssuredMode::SafeRead),
            _ => None,
        }
    }
}

/// Header fields common to every update message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeader {
    /// Logical clock value of the change.
    pub csn: Csn,
    /// Replica-independent identity of the target entry, stable across renames.
    pub entry_uuid: String,
    /// DN of the target entry at the originating replica.
    pub dn: String,
    /// True when the originator requests an acknowledgement.
    pub assured: bool,
    /// Acknowledgement criterion.
    pub assured_mode: AssuredMode,
    /// For safe-data mode, how many servers must store the change.
    pub safe_data_level: u8,
}

impl UpdateHeader {
    /// A non-assured header for the given change.
    pub fn plain(csn: Csn, entry_uuid: impl Into<String>, dn: impl Into<String>) -> Self {
        Self {
            csn,
            entry_uuid: entry_uuid.into(),
            dn: dn.into(),
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
        }
    }
}

/// One attribute with its values, as carried in an Add payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireAttribute {
    /// Attribute description (name, lowercase on the wire).
    pub name: String,
    /// Attribute values as opaque byte strings.
    pub values: Vec<Vec<u8>>,
}

/// Modification operator carried in a Modify payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    /// Add values to an attribute.
    Add,
    /// Delete values (or the whole attribute when no values given).
    Delete,
    /// Replace the whole attribute value set.
    Replace,
    /// Increment an integer attribute.
    Increment,
}

impl ModOp {
    /// Wire byte for this operator.
    pub fn as_u8(self) -> u8 {
        match self {
            ModOp::Add => 0,
            ModOp::Delete => 1,
            ModOp::Replace => 2,
            ModOp::Increment => 3,
        }
    }

    /// Parse the wire byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ModOp::Add),
            1 => Some(ModOp::Delete),
            2 => Some(ModOp::Replace),
            3 => Some(ModOp::Increment),
            _ => None,
        }
    }
}

/// One modification of a Modify update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireModification {
    /// The operator.
    pub op: ModOp,
    /// Target attribute.
    pub attr: String,
    /// Values, possibly empty (whole-attribute delete, replace-with-nothing).
    pub values: Vec<Vec<u8>>,
}

/// Replicated entry addition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMsg {
    /// Common update header.
    pub header: UpdateHeader,
    /// The new entry's attributes.
    pub attributes: Vec<WireAttribute>,
}

/// Replicated entry deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteMsg {
    /// Common update header.
    pub header: UpdateHeader,
    /// True when the whole subtree under the DN is deleted.
    pub subtree: bool,
}

/// Replicated modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyMsg {
    /// Common update header.
    pub header: UpdateHeader,
    /// The modifications, in request order.
    pub mods: Vec<WireModification>,
}

/// Replicated rename/move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnMsg {
    /// Common update header.
    pub header: UpdateHeader,
    /// New RDN of the entry.
    pub new_rdn: String,
    /// Whether the old RDN attribute value is removed.
    pub delete_old_rdn: bool,
    /// New parent DN, when the entry moves.
    pub new_superior: Option<String>,
}

/// Acknowledgement of an assured update.
///
/// Error flags are informational: the update was received, but something
/// went wrong downstream (a timeout waiting for another server, a replay
/// failure, or a server in a degraded status).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckMsg {
    /// CSN of the update being acknowledged.
    pub csn: Csn,
    /// A downstream server timed out.
    pub has_timeout: bool,
    /// A downstream server was in a status that excludes it from assured.
    pub has_wrong_status: bool,
    /// A downstream replica failed to replay the change.
    pub has_replay_error: bool,
    /// Ids of the servers that caused the flags above.
    pub failed_servers: Vec<u16>,
}

impl AckMsg {
    /// A clean acknowledgement for `csn`.
    pub fn clean(csn: Csn) -> Self {
        AckMsg { csn, ..Default::default() }
    }

    /// True if any error flag is set.
    pub fn has_errors(&self) -> bool {
        self.has_timeout || self.has_wrong_status || self.has_replay_error
    }
}

/// First message of the handshake, sent by the directory server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStartMsg {
    /// Replica id of the sending directory server.
    pub replica_id: u16,
    /// Replicated base DN.
    pub base_dn: String,
    /// Data generation the sender holds, -1 when uninitialized.
    pub generation_id: i64,
    /// Topology group of the sender.
    pub group_id: u8,
    /// Interval at which the sender expects heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Receive window the sender grants.
    pub window_size: u32,
    /// Progress vector of the sender.
    pub state: ServerState,
}

/// Handshake response from the replication server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplServerStartMsg {
    /// Server id of the replication server.
    pub server_id: u16,
    /// Advertised URL of the replication server.
    pub server_url: String,
    /// Data generation the replication server holds for the base DN.
    pub generation_id: i64,
    /// Topology group of the replication server.
    pub group_id: u8,
    /// Receive window the replication server grants.
    pub window_size: u32,
    /// Progress vector of the replication server.
    pub state: ServerState,
}

/// Session options sent by the directory server after the start exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionMsg {
    /// Default assured flag for updates on this session.
    pub assured: bool,
    /// Default assured mode.
    pub assured_mode: AssuredMode,
    /// Default safe-data level.
    pub safe_data_level: u8,
}

/// A replication server known to the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsInfo {
    /// Server id.
    pub server_id: u16,
    /// Connection URL.
    pub server_url: String,
    /// Topology group.
    pub group_id: u8,
    /// Data generation held for the base DN.
    pub generation_id: i64,
    /// Configured load-balancing weight.
    pub weight: u8,
    /// Directory servers currently connected to it.
    pub connected_ds_count: u32,
}

/// A directory server known to the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsInfo {
    /// Replica id.
    pub replica_id: u16,
    /// Topology group.
    pub group_id: u8,
    /// Replication server this directory server is connected to.
    pub rs_id: u16,
}

/// Topology snapshot pushed by the replication server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyMsg {
    /// All replication servers of the topology.
    pub rs_infos: Vec<RsInfo>,
    /// All directory servers connected to the topology.
    pub ds_infos: Vec<DsInfo>,
}

/// Publishes the newest CSN generated locally, so idle replicas keep their
/// clocks adjusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTimeHeartbeatMsg {
    /// Newest CSN generated by the sender.
    pub csn: Csn,
}

/// Flow-control credit: the sender may transmit `num_ack` more updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCreditMsg {
    /// Number of updates being credited.
    pub num_ack: u32,
}

/// Request for a monitor snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequestMsg {
    /// Requesting server id.
    pub sender_id: u16,
    /// Target server id.
    pub dest_id: u16,
}

/// Monitor snapshot answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorMsg {
    /// Answering server id.
    pub sender_id: u16,
    /// Requesting server id.
    pub dest_id: u16,
    /// Progress vector of the answering server.
    pub state: ServerState,
}

/// Ask a peer to send a full initialization of the base DN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRequestMsg {
    /// Requesting server id.
    pub sender_id: u16,
    /// Server asked to provide the data.
    pub dest_id: u16,
}

/// Announces a full initialization transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeTargetMsg {
    /// Sending server id.
    pub sender_id: u16,
    /// Receiving server id.
    pub dest_id: u16,
    /// Number of entries that will follow.
    pub entry_count: u64,
}

/// One chunk of serialized entries during full initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChunkMsg {
    /// Sending server id.
    pub sender_id: u16,
    /// Receiving server id.
    pub dest_id: u16,
    /// Opaque serialized entry data.
    pub chunk: Vec<u8>,
}

/// Acknowledges the end of a full initialization transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRcvAckMsg {
    /// Sending server id.
    pub sender_id: u16,
    /// Receiving server id.
    pub dest_id: u16,
}

/// Protocol-level error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    /// Reporting server id.
    pub sender_id: u16,
    /// Target server id.
    pub dest_id: u16,
    /// Numeric error code.
    pub code: u16,
    /// Human-readable detail.
    pub detail: String,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMsg {
    /// Handshake opener from a directory server.
    ServerStart(ServerStartMsg),
    /// Handshake response from a replication server.
    ReplServerStart(ReplServerStartMsg),
    /// Session options.
    StartSession(StartSessionMsg),
    /// Topology snapshot.
    Topology(TopologyMsg),
    /// Entry addition.
    Add(AddMsg),
    /// Entry deletion.
    Delete(DeleteMsg),
    /// Entry modification.
    Modify(ModifyMsg),
    /// Entry rename/move.
    ModifyDn(ModifyDnMsg),
    /// Assured-update acknowledgement.
    Ack(AckMsg),
    /// Liveness heartbeat.
    Heartbeat,
    /// Clock-adjustment heartbeat.
    ChangeTimeHeartbeat(ChangeTimeHeartbeatMsg),
    /// Flow-control credit.
    WindowCredit(WindowCreditMsg),
    /// Flow-control probe.
    WindowProbe,
    /// Orderly session shutdown.
    Stop,
    /// Monitor snapshot request.
    MonitorRequest(MonitorRequestMsg),
    /// Monitor snapshot answer.
    Monitor(MonitorMsg),
    /// Full-initialization request.
    InitializeRequest(InitializeRequestMsg),
    /// Full-initialization announcement.
    InitializeTarget(InitializeTargetMsg),
    /// Full-initialization data chunk.
    EntryChunk(EntryChunkMsg),
    /// Full-initialization completion acknowledgement.
    InitializeRcvAck(InitializeRcvAckMsg),
    /// Protocol error report.
    Error(ErrorMsg),
}

impl ReplicationMsg {
    /// The update header, when this is an update message.
    pub fn update_header(&self) -> Option<&UpdateHeader> {
        match self {
            ReplicationMsg::Add(m) => Some(&m.header),
            ReplicationMsg::Delete(m) => Some(&m.header),
            ReplicationMsg::Modify(m) => Some(&m.header),
            ReplicationMsg::ModifyDn(m) => Some(&m.header),
            _ => None,
        }
    }

    /// The CSN carried by this message, when there is one.
    pub fn csn(&self) -> Option<Csn> {
        match self {
            ReplicationMsg::Ack(m) => Some(m.csn),
            ReplicationMsg::ChangeTimeHeartbeat(m) => Some(m.csn),
            other => other.update_header().map(|h| h.csn),
        }
    }

    /// True for Add/Delete/Modify/ModifyDn.
    pub fn is_update(&self) -> bool {
        self.update_header().is_some()
    }
}
