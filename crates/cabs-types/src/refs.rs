use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TypeError;

/// Width of a [`Ref`] in bytes.
pub const REF_LEN: usize = 32;

/// Width of a [`Ref`] in lowercase hex characters.
pub const REF_HEX_LEN: usize = 2 * REF_LEN;

/// Content-addressed identifier of a blob.
///
/// A `Ref` is the SHA-256 hash of a blob's bytes. Refs are totally ordered by
/// lexicographic byte comparison, which is also the order of their lowercase
/// hex encodings. Enumeration in every store follows this order.
///
/// The all-zero ref is a sentinel: it means "start from the beginning" when
/// passed to an enumeration and "no value" in anchor-map bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref([u8; REF_LEN]);

impl Ref {
    /// Compute the ref of a byte sequence.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Create a ref from a pre-computed hash.
    pub const fn from_hash(hash: [u8; REF_LEN]) -> Self {
        Self(hash)
    }

    /// The all-zero sentinel ref.
    pub const fn zero() -> Self {
        Self([0u8; REF_LEN])
    }

    /// Returns `true` if this is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; REF_LEN]
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; REF_LEN] {
        &self.0
    }

    /// Lowercase, fixed-width (64 character) hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character lowercase hex string.
    ///
    /// Uppercase digits are rejected, so every ref has exactly one textual
    /// form and parsed names sort the same way as the refs they encode.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != REF_HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: REF_HEX_LEN,
                actual: s.len(),
            });
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(TypeError::InvalidHex(format!("{s} contains uppercase digits")));
        }
        let mut arr = [0u8; REF_LEN];
        hex::decode_to_slice(s, &mut arr).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Ok(Self(arr))
    }

    /// Parse from a raw byte slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; REF_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: REF_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

/// Compute the ref of a byte sequence. Shorthand for [`Ref::of`].
pub fn hash(data: &[u8]) -> Ref {
    Ref::of(data)
}

impl Default for Ref {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.short_hex())
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Ref {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; REF_LEN]> for Ref {
    fn from(bytes: [u8; REF_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Ref> for [u8; REF_LEN] {
    fn from(r: Ref) -> Self {
        r.0
    }
}

impl AsRef<[u8]> for Ref {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
