// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types of the cache.

use thiserror::Error;

/// Error type returned by caller-supplied serialization and mutation callbacks.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the cache.
///
/// Capacity problems are deliberately absent: a cache that is full, or an item that is
/// too large to cache, degrades to a miss instead of an error.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The memory for a segment could not be reserved while constructing a
    /// [`Membuffer`](crate::Membuffer). No partially constructed cache is returned.
    #[error("failed to allocate {bytes} bytes for cache segment {segment}")]
    Allocation {
        /// Index of the segment whose allocation failed.
        segment: usize,
        /// Number of bytes requested for it.
        bytes: usize,
    },

    /// The configuration cannot be turned into a usable cache, even after clamping.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(&'static str),

    /// A caller-supplied serializer or deserializer failed.
    #[error("cache codec failed")]
    Codec(#[source] CodecError),

    /// A partial mutator failed. The affected entry has been dropped from the cache.
    #[error("in-place modification of a cached item failed; the item was dropped")]
    Mutate(#[source] CodecError),
}

/// A specialized `Result` for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn display_messages() {
        let err = Error::Allocation { segment: 3, bytes: 1024 };
        assert_eq!(err.to_string(), "failed to allocate 1024 bytes for cache segment 3");

        let err = Error::InvalidConfig("total size must not be zero");
        assert_eq!(err.to_string(), "invalid cache configuration: total size must not be zero");
    }

    #[test]
    fn callback_errors_keep_their_source() {
        let err = Error::Mutate("truncated".into());
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("truncated"));

        let err = Error::Codec("bad utf-8".into());
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("bad utf-8"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<Error>();
    }
}
