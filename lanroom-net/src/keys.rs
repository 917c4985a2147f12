//! Tunnel key material.
//!
//! Keys are opaque 32-byte values. Generation and curve validation happen
//! outside this crate; here they are only carried, encoded and compared.

use crate::error::{NetError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of every key handled by the tunnel driver.
pub const KEY_LEN: usize = 32;

/// A 32-byte tunnel key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            NetError::Key(format!(
                "Invalid key length: expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| NetError::Key(format!("Invalid base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// All-zero keys mean "unset" in driver records.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_base64())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Key::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// The interface's own key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: Key,
    pub public_key: Key,
}

impl KeyPair {
    pub fn new(private_key: Key, public_key: Key) -> Self {
        Self {
            private_key,
            public_key,
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show public key in debug output
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let key = Key::from_bytes([7u8; KEY_LEN]);
        let restored = Key::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(Key::from_base64(&short), Err(NetError::Key(_))));
        assert!(Key::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_keypair_debug_hides_private() {
        let pair = KeyPair::new(Key::from_bytes([1; KEY_LEN]), Key::from_bytes([2; KEY_LEN]));
        let dbg = format!("{pair:?}");
        assert!(!dbg.contains(&pair.private_key.to_base64()));
        assert!(dbg.contains(&pair.public_key.to_base64()));
    }

    #[test]
    fn test_serde_as_base64_string() {
        let key = Key::from_bytes([9; KEY_LEN]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_base64()));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
