//! Transport framing: 8 ASCII hex digits of payload length, then the payload.
//!
//! The framing layer sits between the codec and whatever byte stream the
//! deployment provides. End of stream before a full frame has arrived is a
//! [`ProtoError::ConnectionLost`] for the session; it is never retried
//! here, the domain above decides whether to reconnect.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::ProtoError;

/// Length of the hex length prefix.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a declared payload length. A peer declaring more is
/// talking a different protocol (or garbage) and is rejected before any
/// allocation happens.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one framed payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{:08x}", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| ProtoError::connection_lost(format!("reading frame header: {e}")))?;
    let text = std::str::from_utf8(&header)
        .map_err(|_| ProtoError::malformed("frame header is not ASCII"))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| ProtoError::malformed(format!("frame header is not hex: {text:?}")))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::malformed(format!("declared frame length {len} too large")));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProtoError::connection_lost(format!("reading frame payload: {e}")))?;
    trace!(len, "frame received");
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"hello frame");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"one").await.unwrap();
        write_frame(&mut a, b"two").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"one");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_eof_before_header_is_connection_lost() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtoError::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_connection_lost() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Declare 16 bytes but deliver only 4.
        a.write_all(b"00000010abcd").await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtoError::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_hex_header_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"zzzzzzzzpayload").await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtoError::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"ffffffff").await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtoError::MalformedMessage { .. })
        ));
    }
}
