//! Content addressing primitives
//!
//! Artifact identity is BLAKE3 over canonical msgpack bytes. Hashes travel
//! as lowercase hex in manifests, keys, and the closet DB; this module owns
//! the codec and the constant-time comparison.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of a raw content hash in bytes.
pub const HASH_LEN: usize = 32;

/// Length of a content hash in hex characters.
pub const HASH_HEX_LEN: usize = 64;

/// A 32-byte BLAKE3 content hash.
///
/// Serialized as a lowercase hex string on every wire and storage surface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32(pub [u8; HASH_LEN]);

impl Hash32 {
    /// Parse from hex, accepting either case, normalizing to raw bytes.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HASH_HEX_LEN {
            return Err(Error::InvalidInput(format!(
                "hash hex must be {HASH_HEX_LEN} chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidInput(format!("bad hash hex: {e}")))?;
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for Hash32 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash a byte sequence with BLAKE3.
pub fn hash_bytes(bytes: &[u8]) -> Hash32 {
    Hash32(*blake3::hash(bytes).as_bytes())
}

/// Constant-time hash equality.
pub fn hashes_equal(a: &Hash32, b: &Hash32) -> bool {
    // blake3::Hash compares in constant time.
    blake3::Hash::from(a.0) == blake3::Hash::from(b.0)
}

/// Recompute the hash of `bytes` and compare against `expected`.
pub fn verify_hash(bytes: &[u8], expected: &Hash32) -> bool {
    hashes_equal(&hash_bytes(bytes), expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let h = hash_bytes(b"stratus");
        let parsed = Hash32::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_hex().len(), HASH_HEX_LEN);
        assert!(h.to_hex().chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_from_hex_accepts_uppercase() {
        let h = hash_bytes(b"stratus");
        let upper = h.to_hex().to_uppercase();
        assert_eq!(Hash32::from_hex(&upper).unwrap(), h);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Hash32::from_hex("abc").is_err());
        assert!(Hash32::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_verify_hash() {
        let h = hash_bytes(b"payload");
        assert!(verify_hash(b"payload", &h));
        assert!(!verify_hash(b"payload!", &h));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = hash_bytes(b"payload");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
