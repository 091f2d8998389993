//! Error types for the wire layer.

use thiserror::Error;

/// Errors produced by the codec and the framing layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A message failed to decode. Fatal to the session that received it.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// What the decoder was unable to make sense of.
        reason: String,
    },

    /// The type byte belongs to a protocol generation this server no longer
    /// decodes. The peer must be rejected or asked to renegotiate.
    #[error("unsupported legacy message type {type_byte:#04x}")]
    UnsupportedLegacyVersion {
        /// The retired type byte found at the head of the message.
        type_byte: u8,
    },

    /// The version byte does not match any live protocol version.
    #[error("unsupported protocol version {got}, expected one of {supported:?}")]
    VersionMismatch {
        /// The version byte found in the message header.
        got: u8,
        /// Versions this build can decode.
        supported: &'static [u8],
    },

    /// The transport reached end of stream or failed mid-frame.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Transport-level detail.
        reason: String,
    },
}

impl ProtoError {
    /// Shorthand for a [`ProtoError::MalformedMessage`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtoError::MalformedMessage { reason: reason.into() }
    }

    /// Shorthand for a [`ProtoError::ConnectionLost`].
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        ProtoError::ConnectionLost { reason: reason.into() }
    }
}

impl From<std::io::Error> for ProtoError {
    fn from(err: std::io::Error) -> Self {
        ProtoError::ConnectionLost { reason: err.to_string() }
    }
}
