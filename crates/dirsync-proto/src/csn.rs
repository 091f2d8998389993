//! Change sequence numbers: the logical clock stamping every replicated change.
//!
//! A CSN is globally unique across the topology and totally ordered:
//! wall-clock time first, then the per-millisecond sequence number, then the
//! replica id as a deterministic tie-break between replicas sharing a
//! millisecond.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Size of the compact binary CSN form on the wire.
pub const CSN_BINARY_LEN: usize = 12;

/// Length of the fixed-width textual CSN form (16 + 4 + 4 hex digits).
pub const CSN_TEXT_LEN: usize = 24;

/// A change sequence number.
///
/// Ordering compares `time_ms`, then `seq`, then `replica_id`, so two CSNs
/// are equal only when all three components match.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Csn {
    /// Milliseconds since the Unix epoch at the originating replica.
    pub time_ms: u64,
    /// Sequence number distinguishing changes within one millisecond.
    pub seq: u16,
    /// Id of the replica that generated the change.
    pub replica_id: u16,
}

impl Csn {
    /// Create a CSN from its components.
    pub fn new(time_ms: u64, seq: u16, replica_id: u16) -> Self {
        Self { time_ms, seq, replica_id }
    }

    /// Compact binary form: 8 bytes of time, 2 of seq, 2 of replica id,
    /// all big-endian.
    pub fn to_bytes(self) -> [u8; CSN_BINARY_LEN] {
        let mut out = [0u8; CSN_BINARY_LEN];
        out[..8].copy_from_slice(&self.time_ms.to_be_bytes());
        out[8..10].copy_from_slice(&self.seq.to_be_bytes());
        out[10..12].copy_from_slice(&self.replica_id.to_be_bytes());
        out
    }

    /// Parse the compact binary form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < CSN_BINARY_LEN {
            return Err(ProtoError::malformed("truncated binary CSN"));
        }
        let mut time = [0u8; 8];
        time.copy_from_slice(&buf[..8]);
        let mut seq = [0u8; 2];
        seq.copy_from_slice(&buf[8..10]);
        let mut replica = [0u8; 2];
        replica.copy_from_slice(&buf[10..12]);
        Ok(Self {
            time_ms: u64::from_be_bytes(time),
            seq: u16::from_be_bytes(seq),
            replica_id: u16::from_be_bytes(replica),
        })
    }

    /// True if `self` was generated after `other` in the total order.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:04x}{:04x}", self.time_ms, self.seq, self.replica_id)
    }
}

impl FromStr for Csn {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_TEXT_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtoError::malformed(format!("invalid textual CSN: {s:?}")));
        }
        let time_ms = u64::from_str_radix(&s[..16], 16)
            .map_err(|_| ProtoError::malformed("invalid CSN time field"))?;
        let seq = u16::from_str_radix(&s[16..20], 16)
            .map_err(|_| ProtoError::malformed("invalid CSN seq field"))?;
        let replica_id = u16::from_str_radix(&s[20..24], 16)
            .map_err(|_| ProtoError::malformed("invalid CSN replica field"))?;
        Ok(Self { time_ms, seq, replica_id })
    }
}

/// Generates monotonically increasing CSNs for one replica.
///
/// The generator never goes backward, even when the wall clock does: when
/// the clock reads earlier than the last issued time the previous
/// millisecond is reused and the sequence number advances instead.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: u16,
    last: Mutex<(u64, u16)>,
}

impl CsnGenerator {
    /// Create a generator for the given replica id.
    pub fn new(replica_id: u16) -> Self {
        Self { replica_id, last: Mutex::new((0, 0)) }
    }

    /// The replica id stamped on every CSN from this generator.
    pub fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Issue the next CSN.
    pub fn next_csn(&self) -> Csn {
        let now = wall_clock_ms();
        let mut last = self.last.lock().unwrap();
        let (last_time, last_seq) = *last;
        let (time_ms, seq) = if now > last_time {
            (now, 0)
        } else if last_seq < u16::MAX {
            (last_time, last_seq + 1)
        } else {
            // Sequence space for this millisecond is exhausted.
            (last_time + 1, 0)
        };
        *last = (time_ms, seq);
        Csn::new(time_ms, seq, self.replica_id)
    }

    /// Advance the generator past a CSN observed from another replica, so
    /// that changes made locally after applying a remote change always
    /// compare newer than it regardless of clock skew.
    pub fn adjust(&self, seen: &Csn) {
        let mut last = self.last.lock().unwrap();
        let (last_time, last_seq) = *last;
        if seen.time_ms > last_time || (seen.time_ms == last_time && seen.seq >= last_seq) {
            if seen.seq == u16::MAX {
                *last = (seen.time_ms + 1, 0);
            } else {
                *last = (seen.time_ms, seen.seq + 1);
            }
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
