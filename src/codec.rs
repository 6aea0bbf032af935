//! Cache entry wire format
//!
//! Layout of an encoded entry:
//!
//! ```text
//! +---------+-----------------+-------------------------------+
//! | "STCE"  | version (u16 BE)| JSON body (CacheEnvelope)     |
//! +---------+-----------------+-------------------------------+
//! ```
//!
//! The body is plain JSON so slower levels can be read by non-Rust tooling.
//! Decoders reject unknown versions instead of guessing.

use crate::error::{MemoryError, Result};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"STCE";
const HEADER_LEN: usize = 6;

/// Current envelope schema version
pub const CACHE_SCHEMA_VERSION: u16 = 1;

/// A cached value plus the metadata every level needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub value: serde_json::Value,
    pub created_at_ms: i64,
    /// Absent means no expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

impl CacheEnvelope {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|exp| exp <= now_ms)
    }

    /// Time left before expiry, `None` for entries that never expire
    pub fn remaining_ttl_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at_ms.map(|exp| (exp - now_ms).max(0))
    }
}

pub fn encode(envelope: &CacheEnvelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope).map_err(|e| MemoryError::Codec(e.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CACHE_SCHEMA_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<CacheEnvelope> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(MemoryError::Codec("missing cache envelope header".into()));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != CACHE_SCHEMA_VERSION {
        return Err(MemoryError::Codec(format!(
            "unsupported cache envelope version {version}"
        )));
    }
    serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| MemoryError::Codec(e.to_string()))
}
