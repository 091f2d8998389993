//! Byte-level encoding and decoding of [`ReplicationMsg`].
//!
//! Two protocol versions are live at the same time. V2 is the current
//! encoding: update headers carry the assured fields and the CSN travels in
//! its compact 12-byte binary form. V1 is the legacy encoding still spoken
//! by old peers: the CSN is a 24-character hex string, the entry UUID
//! precedes the DN, and there are no assured fields (legacy
//! acknowledgements carry no error flags either). A handful of retired type bytes from the
//! generation before V1 are recognized only to be rejected explicitly.
//!
//! Layout rules: integers are big-endian; text fields are terminated by a
//! NUL byte and found by scanning for it; binary blobs are
//! length-prefixed. Decoding arbitrary input must never panic: every read
//! is bounds-checked and a missing terminator or truncated field is a
//! [`ProtoError::MalformedMessage`].

use crate::csn::{Csn, CSN_TEXT_LEN};
use crate::error::ProtoError;
use crate::msg::*;
use crate::server_state::ServerState;

/// A live protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Legacy fixed-field encoding.
    V1,
    /// Current encoding with assured fields.
    V2,
}

/// The newest version this build speaks.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::V2;

/// Version bytes this build decodes.
pub const SUPPORTED_VERSIONS: &[u8] = &[1, 2];

impl ProtocolVersion {
    /// Wire byte for this version.
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    /// Parse a version byte.
    pub fn from_u8(b: u8) -> Result<Self, ProtoError> {
        match b {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            got => Err(ProtoError::VersionMismatch { got, supported: SUPPORTED_VERSIONS }),
        }
    }

    /// Negotiate the session version from the peer's advertised one.
    pub fn min_with(self, other: ProtocolVersion) -> ProtocolVersion {
        if other < self {
            other
        } else {
            self
        }
    }
}

const MSG_SERVER_START: u8 = 1;
const MSG_REPL_SERVER_START: u8 = 2;
const MSG_START_SESSION: u8 = 3;
const MSG_TOPOLOGY: u8 = 4;
const MSG_ADD: u8 = 5;
const MSG_DELETE: u8 = 6;
const MSG_MODIFY: u8 = 7;
const MSG_MODIFY_DN: u8 = 8;
const MSG_ACK: u8 = 9;
const MSG_HEARTBEAT: u8 = 10;
const MSG_CHANGE_TIME_HEARTBEAT: u8 = 11;
const MSG_WINDOW_CREDIT: u8 = 12;
const MSG_WINDOW_PROBE: u8 = 13;
const MSG_STOP: u8 = 14;
const MSG_MONITOR_REQUEST: u8 = 15;
const MSG_MONITOR: u8 = 16;
const MSG_INITIALIZE_REQUEST: u8 = 17;
const MSG_INITIALIZE_TARGET: u8 = 18;
const MSG_ENTRY_CHUNK: u8 = 19;
const MSG_INITIALIZE_RCV_ACK: u8 = 20;
const MSG_ERROR: u8 = 21;

// Type bytes of the retired pre-V1 encodings. Recognized so that a peer
// speaking that generation gets an explicit rejection instead of a decode
// attempt that would misread its fixed-offset fields.
const LEGACY_V0_SERVER_START: u8 = 101;
const LEGACY_V0_REPL_SERVER_START: u8 = 102;
const LEGACY_V0_UPDATE: u8 = 103;

/// Encode a message for the given protocol version.
pub fn encode(msg: &ReplicationMsg, version: ProtocolVersion) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match msg {
        ReplicationMsg::ServerStart(m) => {
            put_prefix(&mut buf, MSG_SERVER_START, version);
            put_u16(&mut buf, m.replica_id);
            put_str_z(&mut buf, &m.base_dn);
            put_i64(&mut buf, m.generation_id);
            buf.push(m.group_id);
            put_u64(&mut buf, m.heartbeat_interval_ms);
            put_u32(&mut buf, m.window_size);
            put_state(&mut buf, &m.state);
        }
        ReplicationMsg::ReplServerStart(m) => {
            put_prefix(&mut buf, MSG_REPL_SERVER_START, version);
            put_u16(&mut buf, m.server_id);
            put_str_z(&mut buf, &m.server_url);
            put_i64(&mut buf, m.generation_id);
            buf.push(m.group_id);
            put_u32(&mut buf, m.window_size);
            put_state(&mut buf, &m.state);
        }
        ReplicationMsg::StartSession(m) => {
            put_prefix(&mut buf, MSG_START_SESSION, version);
            buf.push(m.assured as u8);
            buf.push(m.assured_mode.as_u8());
            buf.push(m.safe_data_level);
        }
        ReplicationMsg::Topology(m) => {
            put_prefix(&mut buf, MSG_TOPOLOGY, version);
            put_u16(&mut buf, m.rs_infos.len() as u16);
            for rs in &m.rs_infos {
                put_u16(&mut buf, rs.server_id);
                put_str_z(&mut buf, &rs.server_url);
                buf.push(rs.group_id);
                put_i64(&mut buf, rs.generation_id);
                buf.push(rs.weight);
                put_u32(&mut buf, rs.connected_ds_count);
            }
            put_u16(&mut buf, m.ds_infos.len() as u16);
            for ds in &m.ds_infos {
                put_u16(&mut buf, ds.replica_id);
                buf.push(ds.group_id);
                put_u16(&mut buf, ds.rs_id);
            }
        }
        ReplicationMsg::Add(m) => {
            put_update_header(&mut buf, MSG_ADD, version, &m.header);
            put_u16(&mut buf, m.attributes.len() as u16);
            for attr in &m.attributes {
                put_str_z(&mut buf, &attr.name);
                put_values(&mut buf, &attr.values);
            }
        }
        ReplicationMsg::Delete(m) => {
            put_update_header(&mut buf, MSG_DELETE, version, &m.header);
            buf.push(m.subtree as u8);
        }
        ReplicationMsg::Modify(m) => {
            put_update_header(&mut buf, MSG_MODIFY, version, &m.header);
            put_u16(&mut buf, m.mods.len() as u16);
            for modif in &m.mods {
                buf.push(modif.op.as_u8());
                put_str_z(&mut buf, &modif.attr);
                put_values(&mut buf, &modif.values);
            }
        }
        ReplicationMsg::ModifyDn(m) => {
            put_update_header(&mut buf, MSG_MODIFY_DN, version, &m.header);
            put_str_z(&mut buf, &m.new_rdn);
            buf.push(m.delete_old_rdn as u8);
            put_str_z(&mut buf, m.new_superior.as_deref().unwrap_or(""));
        }
        ReplicationMsg::Ack(m) => {
            put_prefix(&mut buf, MSG_ACK, version);
            match version {
                ProtocolVersion::V1 => {
                    // Legacy acknowledgements carry only the CSN.
                    put_csn_text(&mut buf, m.csn);
                }
                ProtocolVersion::V2 => {
                    buf.extend_from_slice(&m.csn.to_bytes());
                    let mut flags = 0u8;
                    if m.has_timeout {
                        flags |= 0x01;
                    }
                    if m.has_wrong_status {
                        flags |= 0x02;
                    }
                    if m.has_replay_error {
                        flags |= 0x04;
                    }
                    buf.push(flags);
                    put_u16(&mut buf, m.failed_servers.len() as u16);
                    for id in &m.failed_servers {
                        put_u16(&mut buf, *id);
                    }
                }
            }
        }
        ReplicationMsg::Heartbeat => put_prefix(&mut buf, MSG_HEARTBEAT, version),
        ReplicationMsg::ChangeTimeHeartbeat(m) => {
            put_prefix(&mut buf, MSG_CHANGE_TIME_HEARTBEAT, version);
            buf.extend_from_slice(&m.csn.to_bytes());
        }
        ReplicationMsg::WindowCredit(m) => {
            put_prefix(&mut buf, MSG_WINDOW_CREDIT, version);
            put_u32(&mut buf, m.num_ack);
        }
        ReplicationMsg::WindowProbe => put_prefix(&mut buf, MSG_WINDOW_PROBE, version),
        ReplicationMsg::Stop => put_prefix(&mut buf, MSG_STOP, version),
        ReplicationMsg::MonitorRequest(m) => {
            put_prefix(&mut buf, MSG_MONITOR_REQUEST, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
        }
        ReplicationMsg::Monitor(m) => {
            put_prefix(&mut buf, MSG_MONITOR, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
            put_state(&mut buf, &m.state);
        }
        ReplicationMsg::InitializeRequest(m) => {
            put_prefix(&mut buf, MSG_INITIALIZE_REQUEST, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
        }
        ReplicationMsg::InitializeTarget(m) => {
            put_prefix(&mut buf, MSG_INITIALIZE_TARGET, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
            put_u64(&mut buf, m.entry_count);
        }
        ReplicationMsg::EntryChunk(m) => {
            put_prefix(&mut buf, MSG_ENTRY_CHUNK, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
            put_blob(&mut buf, &m.chunk);
        }
        ReplicationMsg::InitializeRcvAck(m) => {
            put_prefix(&mut buf, MSG_INITIALIZE_RCV_ACK, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
        }
        ReplicationMsg::Error(m) => {
            put_prefix(&mut buf, MSG_ERROR, version);
            put_u16(&mut buf, m.sender_id);
            put_u16(&mut buf, m.dest_id);
            put_u16(&mut buf, m.code);
            put_str_z(&mut buf, &m.detail);
        }
    }
    buf
}

/// Decode a message. Dispatches on the leading type byte; the version byte
/// that follows selects between the live encodings.
pub fn decode(bytes: &[u8]) -> Result<ReplicationMsg, ProtoError> {
    decode_with_version(bytes).map(|(msg, _)| msg)
}

/// Decode a message and report which protocol version it was encoded with,
/// so the session can downgrade to an old peer during the handshake.
pub fn decode_with_version(bytes: &[u8]) -> Result<(ReplicationMsg, ProtocolVersion), ProtoError> {
    let mut r = Reader::new(bytes);
    let type_byte = r.u8()?;
    match type_byte {
        LEGACY_V0_SERVER_START | LEGACY_V0_REPL_SERVER_START | LEGACY_V0_UPDATE => {
            return Err(ProtoError::UnsupportedLegacyVersion { type_byte });
        }
        _ => {}
    }
    let version = ProtocolVersion::from_u8(r.u8()?)?;
    let msg = match type_byte {
        MSG_SERVER_START => {
            let replica_id = r.u16()?;
            let base_dn = r.str_z()?;
            let generation_id = r.i64()?;
            let group_id = r.u8()?;
            let heartbeat_interval_ms = r.u64()?;
            let window_size = r.u32()?;
            let state = read_state(&mut r)?;
            Ok(ReplicationMsg::ServerStart(ServerStartMsg {
                replica_id,
                base_dn,
                generation_id,
                group_id,
                heartbeat_interval_ms,
                window_size,
                state,
            }))
        }
        MSG_REPL_SERVER_START => {
            let server_id = r.u16()?;
            let server_url = r.str_z()?;
            let generation_id = r.i64()?;
            let group_id = r.u8()?;
            let window_size = r.u32()?;
            let state = read_state(&mut r)?;
            Ok(ReplicationMsg::ReplServerStart(ReplServerStartMsg {
                server_id,
                server_url,
                generation_id,
                group_id,
                window_size,
                state,
            }))
        }
        MSG_START_SESSION => {
            let assured = r.u8()? != 0;
            let mode_byte = r.u8()?;
            let assured_mode = AssuredMode::from_u8(mode_byte)
                .ok_or_else(|| ProtoError::malformed(format!("bad assured mode {mode_byte}")))?;
            let safe_data_level = r.u8()?;
            Ok(ReplicationMsg::StartSession(StartSessionMsg {
                assured,
                assured_mode,
                safe_data_level,
            }))
        }
        MSG_TOPOLOGY => {
            let rs_count = r.u16()?;
            let mut rs_infos = Vec::with_capacity(rs_count as usize);
            for _ in 0..rs_count {
                let server_id = r.u16()?;
                let server_url = r.str_z()?;
                let group_id = r.u8()?;
                let generation_id = r.i64()?;
                let weight = r.u8()?;
                let connected_ds_count = r.u32()?;
                rs_infos.push(RsInfo {
                    server_id,
                    server_url,
                    group_id,
                    generation_id,
                    weight,
                    connected_ds_count,
                });
            }
            let ds_count = r.u16()?;
            let mut ds_infos = Vec::with_capacity(ds_count as usize);
            for _ in 0..ds_count {
                let replica_id = r.u16()?;
                let group_id = r.u8()?;
                let rs_id = r.u16()?;
                ds_infos.push(DsInfo { replica_id, group_id, rs_id });
            }
            Ok(ReplicationMsg::Topology(TopologyMsg { rs_infos, ds_infos }))
        }
        MSG_ADD => {
            let header = read_update_header(&mut r, version)?;
            let attr_count = r.u16()?;
            let mut attributes = Vec::with_capacity(attr_count as usize);
            for _ in 0..attr_count {
                let name = r.str_z()?;
                let values = read_values(&mut r)?;
                attributes.push(WireAttribute { name, values });
            }
            Ok(ReplicationMsg::Add(AddMsg { header, attributes }))
        }
        MSG_DELETE => {
            let header = read_update_header(&mut r, version)?;
            let subtree = r.u8()? != 0;
            Ok(ReplicationMsg::Delete(DeleteMsg { header, subtree }))
        }
        MSG_MODIFY => {
            let header = read_update_header(&mut r, version)?;
            let mod_count = r.u16()?;
            let mut mods = Vec::with_capacity(mod_count as usize);
            for _ in 0..mod_count {
                let op_byte = r.u8()?;
                let op = ModOp::from_u8(op_byte)
                    .ok_or_else(|| ProtoError::malformed(format!("bad mod op {op_byte}")))?;
                let attr = r.str_z()?;
                let values = read_values(&mut r)?;
                mods.push(WireModification { op, attr, values });
            }
            Ok(ReplicationMsg::Modify(ModifyMsg { header, mods }))
        }
        MSG_MODIFY_DN => {
            let header = read_update_header(&mut r, version)?;
            let new_rdn = r.str_z()?;
            let delete_old_rdn = r.u8()? != 0;
            let new_superior = match r.str_z()? {
                s if s.is_empty() => None,
                s => Some(s),
            };
            Ok(ReplicationMsg::ModifyDn(ModifyDnMsg {
                header,
                new_rdn,
                delete_old_rdn,
                new_superior,
            }))
        }
        MSG_ACK => match version {
            ProtocolVersion::V1 => {
                let csn = read_csn_text(&mut r)?;
                Ok(ReplicationMsg::Ack(AckMsg::clean(csn)))
            }
            ProtocolVersion::V2 => {
                let csn = read_csn_binary(&mut r)?;
                let flags = r.u8()?;
                let failed_count = r.u16()?;
                let mut failed_servers = Vec::with_capacity(failed_count as usize);
                for _ in 0..failed_count {
                    failed_servers.push(r.u16()?);
                }
                Ok(ReplicationMsg::Ack(AckMsg {
                    csn,
                    has_timeout: flags & 0x01 != 0,
                    has_wrong_status: flags & 0x02 != 0,
                    has_replay_error: flags & 0x04 != 0,
                    failed_servers,
                }))
            }
        },
        MSG_HEARTBEAT => Ok(ReplicationMsg::Heartbeat),
        MSG_CHANGE_TIME_HEARTBEAT => {
            let csn = read_csn_binary(&mut r)?;
            Ok(ReplicationMsg::ChangeTimeHeartbeat(ChangeTimeHeartbeatMsg { csn }))
        }
        MSG_WINDOW_CREDIT => {
            let num_ack = r.u32()?;
            Ok(ReplicationMsg::WindowCredit(WindowCreditMsg { num_ack }))
        }
        MSG_WINDOW_PROBE => Ok(ReplicationMsg::WindowProbe),
        MSG_STOP => Ok(ReplicationMsg::Stop),
        MSG_MONITOR_REQUEST => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            Ok(ReplicationMsg::MonitorRequest(MonitorRequestMsg { sender_id, dest_id }))
        }
        MSG_MONITOR => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            let state = read_state(&mut r)?;
            Ok(ReplicationMsg::Monitor(MonitorMsg { sender_id, dest_id, state }))
        }
        MSG_INITIALIZE_REQUEST => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            Ok(ReplicationMsg::InitializeRequest(InitializeRequestMsg { sender_id, dest_id }))
        }
        MSG_INITIALIZE_TARGET => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            let entry_count = r.u64()?;
            Ok(ReplicationMsg::InitializeTarget(InitializeTargetMsg {
                sender_id,
                dest_id,
                entry_count,
            }))
        }
        MSG_ENTRY_CHUNK => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            let chunk = r.blob()?;
            Ok(ReplicationMsg::EntryChunk(EntryChunkMsg { sender_id, dest_id, chunk }))
        }
        MSG_INITIALIZE_RCV_ACK => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            Ok(ReplicationMsg::InitializeRcvAck(InitializeRcvAckMsg { sender_id, dest_id }))
        }
        MSG_ERROR => {
            let sender_id = r.u16()?;
            let dest_id = r.u16()?;
            let code = r.u16()?;
            let detail = r.str_z()?;
            Ok(ReplicationMsg::Error(ErrorMsg { sender_id, dest_id, code, detail }))
        }
        other => Err(ProtoError::malformed(format!("unknown message type {other:#04x}"))),
    }?;
    Ok((msg, version))
}

fn put_prefix(buf: &mut Vec<u8>, type_byte: u8, version: ProtocolVersion) {
    buf.push(type_byte);
    buf.push(version.as_u8());
}

fn put_update_header(buf: &mut Vec<u8>, type_byte: u8, version: ProtocolVersion, h: &UpdateHeader) {
    put_prefix(buf, type_byte, version);
    match version {
        ProtocolVersion::V1 => {
            // Legacy order: textual CSN, entry UUID, then DN. No assured fields.
            put_csn_text(buf, h.csn);
            put_str_z(buf, &h.entry_uuid);
            put_str_z(buf, &h.dn);
        }
        ProtocolVersion::V2 => {
            buf.extend_from_slice(&h.csn.to_bytes());
            put_str_z(buf, &h.dn);
            put_str_z(buf, &h.entry_uuid);
            buf.push(h.assured as u8);
            buf.push(h.assured_mode.as_u8());
            buf.push(h.safe_data_level);
        }
    }
}

fn read_update_header(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<UpdateHeader, ProtoError> {
    match version {
        ProtocolVersion::V1 => {
            let csn = read_csn_text(r)?;
            let entry_uuid = r.str_z()?;
            let dn = r.str_z()?;
            Ok(UpdateHeader {
                csn,
                entry_uuid,
                dn,
                assured: false,
                assured_mode: AssuredMode::SafeData,
                safe_data_level: 1,
            })
        }
        ProtocolVersion::V2 => {
            let csn = read_csn_binary(r)?;
            let dn = r.str_z()?;
            let entry_uuid = r.str_z()?;
            let assured = r.u8()? != 0;
            let mode_byte = r.u8()?;
            let assured_mode = AssuredMode::from_u8(mode_byte)
                .ok_or_else(|| ProtoError::malformed(format!("bad assured mode {mode_byte}")))?;
            let safe_data_level = r.u8()?;
            Ok(UpdateHeader { csn, entry_uuid, dn, assured, assured_mode, safe_data_level })
        }
    }
}

fn put_csn_text(buf: &mut Vec<u8>, csn: Csn) {
    buf.extend_from_slice(csn.to_string().as_bytes());
    buf.push(0);
}

fn read_csn_text(r: &mut Reader<'_>) -> Result<Csn, ProtoError> {
    let text = r.str_z()?;
    if text.len() != CSN_TEXT_LEN {
        return Err(ProtoError::malformed(format!("bad textual CSN length {}", text.len())));
    }
    text.parse()
}

fn read_csn_binary(r: &mut Reader<'_>) -> Result<Csn, ProtoError> {
    Csn::from_bytes(r.take(crate::csn::CSN_BINARY_LEN)?)
}

fn put_state(buf: &mut Vec<u8>, state: &ServerState) {
    put_u16(buf, state.len() as u16);
    for csn in state.iter() {
        buf.extend_from_slice(&csn.to_bytes());
    }
}

fn read_state(r: &mut Reader<'_>) -> Result<ServerState, ProtoError> {
    let count = r.u16()?;
    let mut state = ServerState::new();
    for _ in 0..count {
        state.update(read_csn_binary(r)?);
    }
    Ok(state)
}

fn put_values(buf: &mut Vec<u8>, values: &[Vec<u8>]) {
    put_u32(buf, values.len() as u32);
    for value in values {
        put_blob(buf, value);
    }
}

fn read_values(r: &mut Reader<'_>) -> Result<Vec<Vec<u8>>, ProtoError> {
    let count = r.u32()?;
    // A count larger than the remaining bytes is lying about the payload.
    if count as usize > r.remaining() {
        return Err(ProtoError::malformed("value count exceeds payload"));
    }
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(r.blob()?);
    }
    Ok(values)
}

fn put_str_z(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn put_blob(buf: &mut Vec<u8>, blob: &[u8]) {
    put_u32(buf, blob.len() as u32);
    buf.extend_from_slice(blob);
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Bounds-checked cursor over a received byte buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.remaining() < n {
            return Err(ProtoError::malformed(format!(
                "truncated message: wanted {n} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn i64(&mut self) -> Result<i64, ProtoError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    /// Scan for the NUL terminator of a text field.
    fn str_z(&mut self) -> Result<String, ProtoError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtoError::malformed("text field missing NUL terminator"))?;
        let bytes = &rest[..nul];
        self.pos += nul + 1;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtoError::malformed("text field is not valid UTF-8"))
    }

    fn blob(&mut self) -> Result<Vec<u8>, ProtoError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
