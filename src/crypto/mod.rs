//! Hashing primitives shared by the protocol layers.
//!
//! Protocol digests (batches, view changes, ledger leaves) are SHA-256
//! over the canonical encoding of the payload; the state trie hashes
//! its nodes with SHA3-256.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use sha3::Sha3_256;

use crate::error::*;

/// A 32-byte cryptographic digest over a canonicalized payload.
///
/// On the wire a digest travels as a base58 string.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = 32;

    /// The digest of the empty payload; used as the placeholder root
    /// for ledgers and tries with no content.
    pub fn blank() -> Self {
        Self::of(&[])
    }

    /// Computes the SHA-256 digest of `payload`.
    pub fn of(payload: &[u8]) -> Self {
        Digest(Sha256::digest(payload).into())
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err(Error::new(ErrorKind::InputMalformed, "digest has an invalid length"));
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Digest(inner))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        let raw = bs58::decode(s)
            .into_vec()
            .or_fault(ErrorKind::InputMalformed, "digest is not base58")?;
        Self::from_bytes(&raw)
    }

    /// Lowercase hex rendering; 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; Digest::LENGTH]> for Digest {
    fn from(inner: [u8; Digest::LENGTH]) -> Self {
        Digest(inner)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_base58())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_base58(&s).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

/// SHA3-256 of `payload`, as used by the state trie's content store.
pub fn sha3_256(payload: &[u8]) -> [u8; 32] {
    Sha3_256::digest(payload).into()
}
