// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A segmented, fixed-size in-memory cache shared by many logical caches.
//!
//! This crate provides [`Membuffer`], a cache for memoizing expensive, repeatedly read
//! artifacts. Its memory is reserved once at construction and never grows; flooding it
//! with too many or too large items degrades hit rates, never memory use.
//!
//! 1. **Fingerprints, not keys:** Every key is folded into a 128-bit [`Fingerprint`]
//!    together with its namespace prefix. Keys are never stored.
//! 2. **Segments:** The budget is split into a power-of-two number of segments, each
//!    behind its own [`parking_lot`] reader/writer lock. The high fingerprint word picks
//!    the segment.
//! 3. **Set-associative directory:** Within a segment, the low fingerprint word picks a
//!    group of entry slots. A full group evicts its least-hit entry.
//! 4. **Insertion window:** Payloads are written at a cursor sweeping the data region.
//!    Entries in the way are kept or evicted by a randomized frequency test, so hot
//!    entries survive while cold ones make room.
//! 5. **Namespaces:** A [`Namespace`] combines a key prefix with a [`Codec`] and
//!    offers `get`, `set`, partial access and statistics on top of a shared cache.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use membuffer::{BytesCodec, Membuffer};
//!
//! let cache = Arc::new(Membuffer::builder().total_size(4 << 20).build()?);
//!
//! let blobs = cache.namespace("blobs").build(BytesCodec);
//! let props = cache.namespace("props").build(BytesCodec);
//!
//! blobs.set(b"r42", &b"file contents".to_vec())?;
//! assert_eq!(blobs.get(b"r42")?, Some(b"file contents".to_vec()));
//!
//! // Namespaces do not see each other's entries.
//! assert_eq!(props.get(b"r42")?, None);
//!
//! // Partial access works on the cached bytes without deserializing them.
//! let len = blobs.get_partial(b"r42", |bytes| Ok(bytes.len()))?;
//! assert_eq!(len, Some(13));
//! # Ok::<(), membuffer::Error>(())
//! ```
//!
//! # Misses Instead of Errors
//!
//! A cache is allowed to forget. Items larger than
//! [`max_item_size`](Membuffer::max_item_size), or whose insertion would evict too much,
//! are not cached; any older value under the same key is dropped, so a later `get`
//! misses instead of returning stale data. Errors are reserved for failed allocation at
//! construction and for failures of caller-supplied codecs and mutators.
//!
//! # Concurrency
//!
//! All operations are synchronous. Lookups take a segment's read lock and hand out
//! private copies or run a closure under the lock; writes take the write lock. With
//! [`WritePolicy::NonBlockingPreferred`], a write that finds its segment busy is dropped
//! unless an older value would survive it. [`Locking::Exclusive`] makes readers take
//! exclusive access too, for platforms where reader/writer locks are slow.
//!
//! # Diagnostics
//!
//! [`Validated`] wraps each segment with a fingerprint tag and content digest, checked on
//! every read. Events are emitted through [`tracing`]: construction at `debug`, rejected
//! and skipped writes at `trace`, failed mutators at `warn`, integrity failures at
//! `error`.

mod codec;
mod config;
mod directory;
mod error;
mod fingerprint;
mod membuffer;
mod namespace;
mod segment;
mod stats;
mod store;
mod validate;
mod window;

#[cfg(feature = "serde")]
pub use codec::BincodeCodec;
pub use codec::{BytesCodec, Codec, FnCodec};
pub use config::{
    DEFAULT_ALIGNMENT, DEFAULT_DIRECTORY_RATIO, DEFAULT_GROUP_SIZE, DEFAULT_MIN_SEGMENT_SIZE, DEFAULT_TOTAL_SIZE,
    EvictionTuning, Locking, MAX_ALIGNMENT, MAX_GROUP_SIZE, MAX_SEGMENT_COUNT, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE,
    MembufferConfig, WritePolicy,
};
pub use directory::ENTRY_FOOTPRINT;
pub use error::{CodecError, Error, Result};
pub use fingerprint::{Fingerprint, KeyLength};
pub use membuffer::{Membuffer, MembufferBuilder};
pub use namespace::{Namespace, NamespaceBuilder};
pub use segment::Segment;
pub use stats::{MembufferStats, NamespaceInfo, SegmentStats};
pub use store::{FingerprintStore, PayloadMut, StoreOutcome};
pub use validate::Validated;
