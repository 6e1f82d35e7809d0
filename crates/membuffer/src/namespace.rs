// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Logical caches multiplexed over one [`Membuffer`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::codec::Codec;
use crate::error::{CodecError, Error, Result};
use crate::fingerprint::{Fingerprint, KeyLength};
use crate::membuffer::Membuffer;
use crate::segment::Segment;
use crate::stats::NamespaceInfo;
use crate::store::{FingerprintStore, PayloadMut, StoreOutcome};

/// Scratch buffers that grew beyond this are shrunk back after use.
const SCRATCH_RETAIN: usize = 64 * 1024;

/// A typed view of a [`Membuffer`], scoped by a key prefix.
///
/// Keys are combined with the namespace prefix into a [`Fingerprint`]; items are
/// converted to payloads by the namespace's [`Codec`]. Any number of namespaces can
/// share one cache.
///
/// Failing to cache an item is never an error: an item that is too large, or that would
/// evict too much, is simply not cached and any older value for its key is dropped.
/// Errors are reserved for codec and mutator failures.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use membuffer::{FnCodec, KeyLength, Membuffer};
///
/// let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build()?);
/// let revisions = cache.namespace("revisions").key_length(KeyLength::Fixed(8)).build(FnCodec::new(
///     |item: &u64, out: &mut Vec<u8>| {
///         out.extend_from_slice(&item.to_le_bytes());
///         Ok(())
///     },
///     |bytes: &[u8]| Ok(u64::from_le_bytes(bytes.try_into()?)),
/// ));
///
/// revisions.set(&7_u64.to_le_bytes(), &1234)?;
/// assert_eq!(revisions.get(&7_u64.to_le_bytes())?, Some(1234));
/// assert_eq!(revisions.get(b"short")?, None);
/// # Ok::<(), membuffer::Error>(())
/// ```
pub struct Namespace<C, S = Segment> {
    membuffer: Arc<Membuffer<S>>,
    prefix: Fingerprint,
    key_length: KeyLength,
    codec: C,
    scratch: Mutex<Vec<u8>>,
    exclusive: Option<Mutex<()>>,
    gets: AtomicU64,
    hits: AtomicU64,
    sets: AtomicU64,
    failures: AtomicU64,
}

impl<C, S> std::fmt::Debug for Namespace<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("prefix", &self.prefix)
            .field("key_length", &self.key_length)
            .field("synchronized", &self.exclusive.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Codec, S: FingerprintStore> Namespace<C, S> {
    /// The cache this namespace lives in.
    #[must_use]
    pub const fn membuffer(&self) -> &Arc<Membuffer<S>> {
        &self.membuffer
    }

    /// Digest of the namespace prefix.
    #[must_use]
    pub const fn prefix(&self) -> Fingerprint {
        self.prefix
    }

    /// The codec converting items to payloads.
    #[must_use]
    pub const fn codec(&self) -> &C {
        &self.codec
    }

    /// Computes the fingerprint of `key` in this namespace.
    ///
    /// Returns `None` for keys that can never be cached: empty keys, and keys that do not
    /// match the namespace's [`KeyLength`].
    #[must_use]
    pub fn fingerprint(&self, key: &[u8]) -> Option<Fingerprint> {
        self.key_length
            .significant(key)
            .map(|key| self.prefix.combine(Fingerprint::of(key)))
    }

    /// Whether an item serialized to `size` bytes can be cached at all.
    #[must_use]
    pub fn is_cacheable(&self, size: usize) -> bool {
        self.membuffer.is_cacheable(size)
    }

    /// Looks up the item cached under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the cached payload cannot be deserialized.
    pub fn get(&self, key: &[u8]) -> Result<Option<C::Item>> {
        let _guard = self.lock();
        self.gets.fetch_add(1, Ordering::Relaxed);

        let Some(fingerprint) = self.fingerprint(key) else {
            return Ok(None);
        };

        self.with_scratch(|payload| {
            if !self.membuffer.lookup_into(fingerprint, payload) {
                return Ok(None);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.codec.deserialize(payload).map(Some).map_err(|error| self.codec_failure(error))
        })
    }

    /// Caches `item` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if `item` cannot be serialized. Any item previously cached
    /// under `key` is dropped in that case.
    pub fn set(&self, key: &[u8], item: &C::Item) -> Result<()> {
        let _guard = self.lock();
        self.sets.fetch_add(1, Ordering::Relaxed);

        let Some(fingerprint) = self.fingerprint(key) else {
            return Ok(());
        };

        self.with_scratch(|payload| {
            if let Err(error) = self.codec.serialize(item, payload) {
                self.membuffer.remove(fingerprint);
                return Err(self.codec_failure(error));
            }

            if self.membuffer.store(fingerprint, payload) != StoreOutcome::Stored {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
    }

    /// Runs `extract` over the payload cached under `key`, without deserializing it.
    ///
    /// The segment stays locked for readers while `extract` runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if `extract` fails.
    pub fn get_partial<R>(
        &self,
        key: &[u8],
        extract: impl FnOnce(&[u8]) -> std::result::Result<R, CodecError>,
    ) -> Result<Option<R>> {
        let _guard = self.lock();
        self.gets.fetch_add(1, Ordering::Relaxed);

        let Some(fingerprint) = self.fingerprint(key) else {
            return Ok(None);
        };

        let Some(extracted) = self.membuffer.lookup_with(fingerprint, extract) else {
            return Ok(None);
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        extracted.map(Some).map_err(|error| self.codec_failure(error))
    }

    /// Lets `mutate` edit the payload cached under `key` in place.
    ///
    /// Returns `Ok(false)` if nothing is cached under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mutate`] if `mutate` fails; the item is dropped from the cache.
    pub fn set_partial<F>(&self, key: &[u8], mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>,
    {
        let _guard = self.lock();
        self.sets.fetch_add(1, Ordering::Relaxed);

        let Some(fingerprint) = self.fingerprint(key) else {
            return Ok(false);
        };

        self.membuffer.modify_in_place(fingerprint, mutate).inspect_err(|_| {
            self.failures.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Whether an item is cached under `key`. Does not count as a hit.
    #[must_use]
    pub fn has_key(&self, key: &[u8]) -> bool {
        let _guard = self.lock();
        self.fingerprint(key).is_some_and(|fingerprint| self.membuffer.contains(fingerprint))
    }

    /// Returns the usage counters of this namespace and the state of its cache.
    #[must_use]
    pub fn info(&self) -> NamespaceInfo {
        NamespaceInfo {
            prefix: self.prefix,
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            membuffer: self.membuffer.stats(),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.exclusive.as_ref().map(Mutex::lock)
    }

    fn codec_failure(&self, error: CodecError) -> Error {
        self.failures.fetch_add(1, Ordering::Relaxed);
        Error::Codec(error)
    }

    /// Runs `f` with an empty buffer, reusing the namespace's scratch buffer when it is free.
    fn with_scratch<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let Some(mut scratch) = self.scratch.try_lock() else {
            return f(&mut Vec::new());
        };

        let result = f(&mut *scratch);
        scratch.clear();
        scratch.shrink_to(SCRATCH_RETAIN);
        result
    }
}

/// Builder for registering a [`Namespace`] on a [`Membuffer`].
///
/// Created by [`Membuffer::namespace`].
#[derive(Debug)]
pub struct NamespaceBuilder<S = Segment> {
    membuffer: Arc<Membuffer<S>>,
    prefix: Fingerprint,
    key_length: KeyLength,
    synchronized: bool,
}

impl<S: FingerprintStore> NamespaceBuilder<S> {
    pub(crate) fn new(membuffer: Arc<Membuffer<S>>, prefix: &[u8]) -> Self {
        Self {
            synchronized: membuffer.thread_safe(),
            membuffer,
            prefix: Fingerprint::of(prefix),
            key_length: KeyLength::default(),
        }
    }

    /// Sets how keys are delimited. Defaults to [`KeyLength::Delimited`].
    #[must_use]
    pub const fn key_length(mut self, key_length: KeyLength) -> Self {
        self.key_length = key_length;
        self
    }

    /// Sets whether every call on the namespace takes an instance mutex.
    ///
    /// Defaults to the cache's [`thread_safe`](Membuffer::thread_safe) setting. Segment
    /// locks protect the shared cache either way.
    #[must_use]
    pub const fn synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    /// Creates the namespace.
    #[must_use]
    pub fn build<C: Codec>(self, codec: C) -> Namespace<C, S> {
        Namespace {
            membuffer: self.membuffer,
            prefix: self.prefix,
            key_length: self.key_length,
            codec,
            scratch: Mutex::new(Vec::new()),
            exclusive: self.synchronized.then(|| Mutex::new(())),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}
