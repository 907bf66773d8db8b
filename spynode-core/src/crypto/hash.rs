//! 32-byte double-SHA256 hash type used for block headers and transaction ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size in bytes of a [`Hash`].
pub const HASH_SIZE: usize = 32;

/// A 32-byte hash value, used both as a block hash and as a transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Build a hash from a byte array.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Build a hash from a slice, failing if the length is wrong.
    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != HASH_SIZE {
            return Err(HashError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Hash(bytes))
    }

    /// Parse a hash from a hex string (optionally `0x`-prefixed).
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let hex = hex.trim_start_matches("0x");
        if hex.len() != HASH_SIZE * 2 {
            return Err(HashError::InvalidHexLength(hex.len()));
        }
        let mut bytes = [0u8; HASH_SIZE];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| HashError::InvalidHexCharacter)?;
            bytes[i] = u8::from_str_radix(s, 16).map_err(|_| HashError::InvalidHexCharacter)?;
        }
        Ok(Hash(bytes))
    }

    /// The all-zero hash, used as a sentinel (e.g. genesis `previous`).
    pub fn zero() -> Self {
        Hash([0u8; HASH_SIZE])
    }

    /// A random hash, for tests and synthetic fixtures.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Hash(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Borrow the underlying bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Render as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Single SHA-256 of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Double SHA-256 of `data` (the wire protocol's hash function).
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Self::sha256(data);
        Self::sha256(first.as_slice())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::LowerHex for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }
}

impl From<Hash> for [u8; HASH_SIZE] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A transaction id. Distinct type alias so call sites read intention, not representation.
pub type Txid = Hash;

/// A block hash. Distinct type alias for the same reason as [`Txid`].
pub type BlockHash = Hash;

/// Errors constructing a [`Hash`] from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("invalid hash length: expected {HASH_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex length: expected {} hex chars, got {0}", HASH_SIZE * 2)]
    InvalidHexLength(usize),
    #[error("invalid hex character")]
    InvalidHexCharacter,
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where S: serde::Serializer {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        if deserializer.is_human_readable() {
            let hex_str = String::deserialize(deserializer)?;
            Hash::from_hex(&hex_str).map_err(serde::de::Error::custom)
        } else {
            use serde::de::{self, Visitor};

            struct HashVisitor;

            impl<'de> Visitor<'de> for HashVisitor {
                type Value = [u8; HASH_SIZE];

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("a 32-byte array")
                }

                fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
                where E: de::Error {
                    if value.len() == HASH_SIZE {
                        let mut bytes = [0u8; HASH_SIZE];
                        bytes.copy_from_slice(value);
                        Ok(bytes)
                    } else {
                        Err(E::custom(format!("expected {HASH_SIZE} bytes, got {}", value.len())))
                    }
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where A: de::SeqAccess<'de> {
                    let mut bytes = [0u8; HASH_SIZE];
                    for (i, slot) in bytes.iter_mut().enumerate() {
                        *slot = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
                    }
                    Ok(bytes)
                }
            }

            let bytes = deserializer.deserialize_bytes(HashVisitor)?;
            Ok(Hash(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha256_differs_from_single() {
        let data = b"spynode hash test";
        let single = Hash::sha256(data);
        let double = Hash::double_sha256(data);
        assert_ne!(single, double);
        assert_eq!(double, Hash::sha256(single.as_slice()));
    }

    #[test]
    fn zero_hash_is_all_zero_bytes() {
        assert_eq!(Hash::zero().as_bytes(), &[0u8; HASH_SIZE]);
        assert!(Hash::zero().is_zero());
    }

    #[test]
    fn hex_round_trip() {
        let hash = Hash::double_sha256(b"round trip");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), HASH_SIZE * 2);
        assert_eq!(Hash::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!(matches!(Hash::from_hex("abcd"), Err(HashError::InvalidHexLength(_))));
        assert!(matches!(Hash::from_slice(&[0u8; 10]), Err(HashError::InvalidLength(_))));
    }

    #[test]
    fn serde_round_trip_json() {
        let hash = Hash::double_sha256(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }
}
