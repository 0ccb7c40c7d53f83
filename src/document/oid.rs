use crate::errors::DbError;
use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 12-byte document identifier, big-endian on the wire:
/// 4-byte Unix seconds, 5-byte per-process random prefix, 3-byte
/// monotonic counter. Monotonic within a process only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

static PROCESS_PREFIX: Lazy<[u8; 5]> = Lazy::new(|| {
    let mut prefix = [0u8; 5];
    rand::rng().fill(&mut prefix[..]);
    prefix
});

static COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::rng().random::<u32>() & 0x00FF_FFFF));

impl ObjectId {
    #[must_use]
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_PREFIX);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Seconds-since-epoch component.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the 24-character hex form.
    /// # Errors
    /// Returns `InvalidInput` on bad length or non-hex characters.
    pub fn from_hex(s: &str) -> Result<Self, DbError> {
        if s.len() != 24 {
            return Err(DbError::InvalidInput(format!("ObjectId hex must be 24 chars, got {}", s.len())));
        }
        let raw = hex::decode(s)
            .map_err(|e| DbError::InvalidInput(format!("bad ObjectId hex: {e}")))?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
