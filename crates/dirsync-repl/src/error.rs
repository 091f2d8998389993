//! Error types for the replication core.

use thiserror::Error;

use dirsync_proto::ProtoError;

/// Errors that can occur in the replication core.
///
/// Conflict outcomes are deliberately NOT errors: a modify or naming
/// conflict is an expected result of multi-master operation, absorbed by
/// the history engine and the naming resolver and visible only through
/// monitoring counters.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Codec or transport failure, fatal to the current session.
    #[error("protocol error")]
    Proto(#[from] ProtoError),

    /// The peer sent a handshake message out of sequence.
    #[error("handshake violation in state {state}: received {got}")]
    HandshakeViolation {
        /// State the handshake machine was in.
        state: &'static str,
        /// Short description of the offending message.
        got: &'static str,
    },

    /// The peer holds data from a different generation; a full
    /// resynchronization is required before replication can resume.
    #[error("generation id mismatch: local {local}, remote {remote}")]
    GenerationIdMismatch {
        /// Generation id of the local domain.
        local: i64,
        /// Generation id advertised by the peer.
        remote: i64,
    },

    /// The session was torn down while an operation was waiting on it.
    #[error("session closed")]
    SessionClosed,

    /// No configured replication server could be reached.
    #[error("no replication server reachable out of {attempted} configured")]
    NoReplicationServer {
        /// How many servers were attempted.
        attempted: usize,
    },

    /// A configuration change was rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The domain is shutting down.
    #[error("replication domain shut down")]
    Shutdown,
}
