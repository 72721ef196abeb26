//! Binary commit-log frame codec.
//!
//! Frame layout: `[u32 length][u32 crc32][length bytes of JSON payload]`.
//! The length prefix lets the parser always know how many bytes a frame
//! occupies, even when the payload itself turns out to be corrupt or the
//! crc doesn't match -- which is what makes `ParseSkip` possible: a bad
//! frame is skippable exactly because its extent is knowable without
//! successfully decoding it.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::event::{ColumnMap, KeyMap};

const HEADER_LEN: usize = 8;
/// Refuse to trust a length prefix larger than this; such a value can only
/// be corruption, since no single mutation is this large in practice.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMutation {
    pub kind: crate::event::EventKind,
    pub keyspace: String,
    pub table: String,
    pub partition_key: KeyMap,
    pub clustering_key: Option<KeyMap>,
    pub columns: ColumnMap,
    pub source_timestamp_micros: i64,
    pub ttl_seconds: Option<i64>,
}

/// Encodes one mutation as a complete frame, ready to be appended to a
/// commit-log file.
pub fn encode_frame(mutation: &RawMutation) -> Vec<u8> {
    let payload = serde_json::to_vec(mutation).expect("RawMutation always serializes");
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Result of attempting to decode one frame starting at the front of `buf`.
pub enum DecodeOutcome {
    /// A full, valid frame. `consumed` bytes should be dropped from the
    /// front of the cursor.
    Frame { mutation: Box<RawMutation>, consumed: u64 },
    /// The frame is malformed (bad crc, undecodable payload, or a length
    /// prefix that can only be corruption). `consumed` bytes should still
    /// be dropped so the reader makes forward progress.
    Skip { reason: String, consumed: u64 },
    /// Not enough bytes are available yet to know the frame's extent.
    /// The reader should wait for more bytes to be appended.
    Incomplete,
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < HEADER_LEN {
        return DecodeOutcome::Incomplete;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        // The length prefix itself is untrustworthy. We cannot know this
        // frame's true extent, so skip just the header and let the next
        // attempt resynchronize on the following bytes.
        return DecodeOutcome::Skip { reason: format!("frame length {len} exceeds maximum"), consumed: HEADER_LEN as u64 };
    }
    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        return DecodeOutcome::Incomplete;
    }
    let expected_crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[HEADER_LEN..total];

    let mut hasher = Hasher::new();
    hasher.update(payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return DecodeOutcome::Skip { reason: "crc mismatch".to_string(), consumed: total as u64 };
    }

    match serde_json::from_slice::<RawMutation>(payload) {
        Ok(mutation) => DecodeOutcome::Frame { mutation: Box::new(mutation), consumed: total as u64 },
        Err(e) => DecodeOutcome::Skip { reason: format!("undecodable payload: {e}"), consumed: total as u64 },
    }
}
