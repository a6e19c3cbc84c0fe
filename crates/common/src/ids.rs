//! Typed identifiers shared across dataset/RPC components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable 128-bit dataset handle identifier, split into a high/low pair the
/// way it travels on the wire.
///
/// The high half is a per-process random seed, the low half a monotone
/// counter; ids are never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// High 64 bits (per-process seed).
    pub high: i64,
    /// Low 64 bits (monotone counter).
    pub low: i64,
}

impl ObjectId {
    /// Well-known id of the bootstrap handle every server installs at
    /// startup, so peers can reach a first dataset without discovery.
    pub const INITIAL: ObjectId = ObjectId { high: 0, low: 0 };

    /// Builds an id from its wire halves.
    pub fn new(high: i64, low: i64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.high as u64, self.low as u64)
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('.')
            .ok_or_else(|| format!("object id missing separator: {s}"))?;
        let high = u64::from_str_radix(high, 16)
            .map_err(|e| format!("object id high half: {e}"))? as i64;
        let low = u64::from_str_radix(low, 16)
            .map_err(|e| format!("object id low half: {e}"))? as i64;
        Ok(Self { high, low })
    }
}

/// Stable client session identifier assigned per web connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(
    /// Raw session id value.
    pub String,
);

impl SessionId {
    /// Mints a fresh random session id.
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-operation call identifier used to address in-flight subscriptions
/// from `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(
    /// Raw numeric id value.
    pub i64,
);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0 as u64)
    }
}
