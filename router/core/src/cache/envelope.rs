//! Cold-tier envelope
//!
//! Wire format for entries written to the persistent store: metadata as JSON
//! followed by the raw (possibly compressed) payload, with a CRC32 over both.
//!
//! ```text
//! +----------------+----------------+----------------+---------------------+
//! | Meta len (4)   | Checksum (4)   | Meta JSON      | Payload (variable)  |
//! | big-endian u32 | CRC32          | ColdMeta       | bytes               |
//! +----------------+----------------+----------------+---------------------+
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Current envelope version
const ENVELOPE_VERSION: u8 = 1;

/// Header size: 4 bytes meta length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

/// Maximum metadata size accepted on decode
const MAX_META_SIZE: usize = 64 * 1024;

/// Metadata persisted alongside a Cold entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColdMeta {
    /// Envelope format version
    pub version: u8,
    /// Creation time, unix milliseconds
    pub created_at_ms: u64,
    /// Expiry time, unix milliseconds
    pub expires_at_ms: u64,
    /// Cost of the call the entry saves
    pub original_cost: f64,
    /// Quality of the producing model
    pub quality: f64,
    /// Hits recorded when written
    pub hit_count: u64,
    /// Whether the payload is gzip-compressed
    pub compressed: bool,
}

impl ColdMeta {
    /// Metadata for an entry written now that lives for `ttl`
    #[must_use]
    pub fn new(original_cost: f64, quality: f64, hit_count: u64, ttl: Duration, compressed: bool) -> Self {
        let now = SystemTime::now();
        Self {
            version: ENVELOPE_VERSION,
            created_at_ms: unix_millis(now),
            expires_at_ms: unix_millis(now + ttl),
            original_cost,
            quality,
            hit_count,
            compressed,
        }
    }

    /// Whether the entry has expired by wall-clock time
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_millis(SystemTime::now()) >= self.expires_at_ms
    }

    /// Wall-clock age
    #[must_use]
    pub fn age(&self) -> Duration {
        Duration::from_millis(unix_millis(SystemTime::now()).saturating_sub(self.created_at_ms))
    }

    /// Wall-clock time left
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(unix_millis(SystemTime::now())))
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Frame `meta` and `payload`
pub fn encode(meta: &ColdMeta, payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(meta).map_err(|e| CacheError::SerializationFailed(e.to_string()))?;
    let meta_len = u32::try_from(json.len())
        .map_err(|_| CacheError::SerializationFailed("metadata too large".to_string()))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&json);
    hasher.update(payload);
    let checksum = hasher.finalize();

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len() + payload.len());
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parse and verify a frame produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<(ColdMeta, Vec<u8>), CacheError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CacheError::Corrupt(format!(
            "envelope of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if meta_len > MAX_META_SIZE || HEADER_SIZE + meta_len > bytes.len() {
        return Err(CacheError::Corrupt(format!(
            "metadata length {meta_len} does not fit envelope"
        )));
    }

    let body = &bytes[HEADER_SIZE..];
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(CacheError::Corrupt(format!(
            "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }

    let (json, payload) = body.split_at(meta_len);
    let meta: ColdMeta =
        serde_json::from_slice(json).map_err(|e| CacheError::SerializationFailed(e.to_string()))?;
    if meta.version != ENVELOPE_VERSION {
        return Err(CacheError::Corrupt(format!(
            "unsupported envelope version {}",
            meta.version
        )));
    }
    Ok((meta, payload.to_vec()))
}
