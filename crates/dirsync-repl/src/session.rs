//! The protocol session: framed message exchange over an opaque byte
//! stream, and the handshake state machine that brings a session up.
//!
//! The transport itself (TCP, TLS, in-process pipe) is outside this core;
//! anything implementing `AsyncRead + AsyncWrite` carries a session.
//! Reads are meant for one receive loop, writes are serialized internally
//! so any number of operation tasks may publish concurrently.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use dirsync_proto::codec::{self, ProtocolVersion, CURRENT_VERSION};
use dirsync_proto::frame;
use dirsync_proto::msg::{
    ReplServerStartMsg, ReplicationMsg, ServerStartMsg, StartSessionMsg, TopologyMsg,
};
use dirsync_proto::ProtoError;

use crate::error::ReplError;

/// A replication session over a framed byte stream.
pub struct FramedSession<T> {
    reader: AsyncMutex<ReadHalf<T>>,
    writer: AsyncMutex<WriteHalf<T>>,
    version: std::sync::Mutex<ProtocolVersion>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FramedSession<T> {
    /// Wrap a connected byte stream. The session starts at the newest
    /// protocol version and downgrades during the handshake if the peer
    /// advertises an older one.
    pub fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            version: std::sync::Mutex::new(CURRENT_VERSION),
        }
    }

    /// The protocol version messages are encoded with.
    pub fn version(&self) -> ProtocolVersion {
        *self.version.lock().unwrap()
    }

    /// Downgrade (or restore) the encoding version.
    pub fn set_version(&self, version: ProtocolVersion) {
        *self.version.lock().unwrap() = version;
    }

    /// Send one message. Safe to call from any number of tasks.
    pub async fn publish(&self, msg: &ReplicationMsg) -> Result<(), ProtoError> {
        let bytes = codec::encode(msg, self.version());
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, &bytes).await
    }

    /// Receive the next message. Meant for a single receive loop.
    pub async fn receive(&self) -> Result<ReplicationMsg, ProtoError> {
        let payload = {
            let mut reader = self.reader.lock().await;
            frame::read_frame(&mut *reader).await?
        };
        let (msg, version) = codec::decode_with_version(&payload)?;
        if version < self.version() {
            debug!(got = version.as_u8(), "peer speaks an older protocol version, downgrading");
            self.set_version(version);
        }
        Ok(msg)
    }

    /// Shut the write side down, signalling end of session to the peer.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// An in-memory session pair for tests and embeddings.
pub fn session_pair() -> (FramedSession<DuplexStream>, FramedSession<DuplexStream>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (FramedSession::new(a), FramedSession::new(b))
}

/// Handshake progress of a directory-server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session established.
    Disconnected,
    /// ServerStart sent, waiting for the peer's ReplServerStart.
    AwaitingReplServerStart,
    /// StartSession sent, waiting for the initial Topology.
    AwaitingTopology,
    /// Session is ready for update traffic.
    Connected,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::AwaitingReplServerStart => "AwaitingReplServerStart",
            SessionState::AwaitingTopology => "AwaitingTopology",
            SessionState::Connected => "Connected",
        }
    }
}

/// Validates the handshake dialog message by message.
#[derive(Debug)]
pub struct HandshakeMachine {
    state: SessionState,
    repl_server_start_seen: bool,
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeMachine {
    /// A machine in the disconnected state.
    pub fn new() -> Self {
        Self { state: SessionState::Disconnected, repl_server_start_seen: false }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Note that ServerStart went out.
    pub fn server_start_sent(&mut self) -> Result<(), ReplError> {
        if self.state != SessionState::Disconnected {
            return Err(self.violation("ServerStart"));
        }
        self.state = SessionState::AwaitingReplServerStart;
        Ok(())
    }

    /// Validate the peer's ReplServerStart, including generation agreement.
    /// An uninitialized side (generation -1) accepts anything.
    pub fn on_repl_server_start(
        &mut self,
        msg: &ReplServerStartMsg,
        local_generation: i64,
    ) -> Result<(), ReplError> {
        if self.state != SessionState::AwaitingReplServerStart || self.repl_server_start_seen {
            return Err(self.violation("ReplServerStart"));
        }
        if local_generation != -1
            && msg.generation_id != -1
            && msg.generation_id != local_generation
        {
            self.reset();
            return Err(ReplError::GenerationIdMismatch {
                local: local_generation,
                remote: msg.generation_id,
            });
        }
        self.repl_server_start_seen = true;
        Ok(())
    }

    /// Note that StartSession went out.
    pub fn start_session_sent(&mut self) -> Result<(), ReplError> {
        if self.state != SessionState::AwaitingReplServerStart || !self.repl_server_start_seen {
            return Err(self.violation("StartSession"));
        }
        self.state = SessionState::AwaitingTopology;
        Ok(())
    }

    /// Validate the initial Topology; the session is ready afterwards.
    pub fn on_topology(&mut self) -> Result<(), ReplError> {
        if self.state != SessionState::AwaitingTopology {
            return Err(self.violation("Topology"));
        }
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Drop back to disconnected (I/O error or Stop).
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.repl_server_start_seen = false;
    }

    fn violation(&mut self, got: &'static str) -> ReplError {
        let state = self.state.name();
        self.reset();
        ReplError::HandshakeViolation { state, got }
    }
}

/// Everything learned from a completed handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// The peer's start message.
    pub rs: ReplServerStartMsg,
    /// The initial topology snapshot.
    pub topology: TopologyMsg,
    /// The negotiated protocol version.
    pub version: ProtocolVersion,
}

/// Drive the directory-server side of the handshake to completion.
pub async fn perform_handshake<T: AsyncRead + AsyncWrite + Unpin + Send>(
    session: &FramedSession<T>,
    server_start: ServerStartMsg,
    start_session: StartSessionMsg,
) -> Result<HandshakeOutcome, ReplError> {
    let local_generation = server_start.generation_id;
    let mut machine = HandshakeMachine::new();

    machine.server_start_sent()?;
    session.publish(&ReplicationMsg::ServerStart(server_start)).await?;

    let rs = match session.receive().await? {
        ReplicationMsg::ReplServerStart(rs) => {
            machine.on_repl_server_start(&rs, local_generation)?;
            rs
        }
        other => return Err(machine.violation(message_name(&other))),
    };

    session.publish(&ReplicationMsg::StartSession(start_session)).await?;
    machine.start_session_sent()?;

    let topology = match session.receive().await? {
        ReplicationMsg::Topology(topology) => {
            machine.on_topology()?;
            topology
        }
        other => return Err(machine.violation(message_name(&other))),
    };

    Ok(HandshakeOutcome { rs, topology, version: session.version() })
}

/// Drive the replication-server side of the handshake; test and simulator
/// helper mirroring [`perform_handshake`].
pub async fn answer_handshake<T: AsyncRead + AsyncWrite + Unpin + Send>(
    session: &FramedSession<T>,
    repl_server_start: ReplServerStartMsg,
    topology: TopologyMsg,
) -> Result<(ServerStartMsg, StartSessionMsg), ReplError> {
    let server_start = match session.receive().await? {
        ReplicationMsg::ServerStart(m) => m,
        other => {
            return Err(ReplError::HandshakeViolation {
                state: "AwaitingServerStart",
                got: message_name(&other),
            })
        }
    };
    session.publish(&ReplicationMsg::ReplServerStart(repl_server_start)).await?;
    let start_session = match session.receive().await? {
        ReplicationMsg::StartSession(m) => m,
        other => {
            return Err(ReplError::HandshakeViolation {
                state: "AwaitingStartSession",
                got: message_name(&other),
            })
        }
    };
    session.publish(&ReplicationMsg::Topology(topology)).await?;
    Ok((server_start, start_session))
}

pub(crate) fn message_name(msg: &ReplicationMsg) -> &'static str {
    match msg {
        ReplicationMsg::ServerStart(_) => "ServerStart",
        ReplicationMsg::ReplServerStart(_) => "ReplServerStart",
        ReplicationMsg::StartSession(_) => "StartSession",
        ReplicationMsg::Topology(_) => "Topology",
        ReplicationMsg::Add(_) => "Add",
        ReplicationMsg::Delete(_) => "Delete",
        ReplicationMsg::Modify(_) => "Modify",
        ReplicationMsg::ModifyDn(_) => "ModifyDn",
        ReplicationMsg::Ack(_) => "Ack",
        ReplicationMsg::Heartbeat => "Heartbeat",
        ReplicationMsg::ChangeTimeHeartbeat(_) => "ChangeTimeHeartbeat",
        ReplicationMsg::WindowCredit(_) => "WindowCredit",
        ReplicationMsg::WindowProbe => "WindowProbe",
        ReplicationMsg::Stop => "Stop",
        ReplicationMsg::MonitorRequest(_) => "MonitorRequest",
        ReplicationMsg::Monitor(_) => "Monitor",
        ReplicationMsg::InitializeRequest(_) => "InitializeRequest",
        ReplicationMsg::InitializeTarget(_) => "InitializeTarget",
        ReplicationMsg::EntryChunk(_) => "EntryChunk",
        ReplicationMsg::InitializeRcvAck(_) => "InitializeRcvAck",
        ReplicationMsg::Error(_) => "Error",
    }
}
