// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 128-bit key fingerprints.
//!
//! The cache never stores caller keys. Every key is folded into a [`Fingerprint`], and
//! equality of fingerprints is treated as equality of keys. Collisions are possible but
//! harmless: a colliding `set` simply replaces the other key's entry.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128;

/// A 128-bit digest identifying one cached item.
///
/// The first word selects the segment, the second word selects the directory group
/// within that segment.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint([u64; 2]);

impl Fingerprint {
    /// Hashes an arbitrary byte string.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self::from_u128(xxh3_128(bytes))
    }

    /// Builds a fingerprint from its two words.
    #[must_use]
    pub const fn from_words(high: u64, low: u64) -> Self {
        Self([high, low])
    }

    #[expect(clippy::cast_possible_truncation, reason = "splitting into 64-bit halves")]
    const fn from_u128(value: u128) -> Self {
        Self([(value >> 64) as u64, value as u64])
    }

    /// Combines a namespace prefix digest with the digest of a key.
    #[must_use]
    pub const fn combine(self, other: Self) -> Self {
        Self([self.0[0] ^ other.0[0], self.0[1] ^ other.0[1]])
    }

    /// The word used for segment routing.
    #[must_use]
    pub const fn high(self) -> u64 {
        self.0[0]
    }

    /// The word used for group selection.
    #[must_use]
    pub const fn low(self) -> u64 {
        self.0[1]
    }

    /// Returns the fingerprint as 16 big-endian bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0; 16];
        out[..8].copy_from_slice(&self.0[0].to_be_bytes());
        out[8..].copy_from_slice(&self.0[1].to_be_bytes());
        out
    }

    /// Reads a fingerprint written by [`to_bytes`](Self::to_bytes).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut high = [0; 8];
        let mut low = [0; 8];
        high.copy_from_slice(&bytes[..8]);
        low.copy_from_slice(&bytes[8..]);
        Self([u64::from_be_bytes(high), u64::from_be_bytes(low)])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.0[0], self.0[1])
    }
}

/// How a namespace determines the extent of a caller key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyLength {
    /// The key ends at the first NUL byte, or at the end of the slice if there is none.
    #[default]
    Delimited,

    /// Every key is exactly this many bytes long. Keys of any other length never hit
    /// and are never stored.
    Fixed(usize),
}

impl KeyLength {
    /// Returns the part of `key` that identifies the item, or `None` if the key is
    /// empty or does not match the convention.
    #[must_use]
    pub fn significant<'a>(self, key: &'a [u8]) -> Option<&'a [u8]> {
        let key = match self {
            Self::Delimited => key.iter().position(|&b| b == 0).map_or(key, |end| &key[..end]),
            Self::Fixed(len) if key.len() == len => key,
            Self::Fixed(_) => return None,
        };

        (!key.is_empty()).then_some(key)
    }
}
