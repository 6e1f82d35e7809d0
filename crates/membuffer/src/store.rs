// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the cache front-ends and a segment implementation.

use std::fmt::Debug;

use crate::error::{CodecError, Result};
use crate::fingerprint::Fingerprint;
use crate::stats::SegmentStats;

/// What happened to a store request.
///
/// Callers are free to ignore this: neither a rejected nor a skipped store leaves an
/// older value for the same fingerprint behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The payload is now cached.
    Stored,

    /// The payload was too large, or making room for it would have evicted too much.
    Rejected,

    /// The segment was busy and no entry for the fingerprint existed, so the write was
    /// dropped instead of waiting.
    Skipped,
}

/// A fixed-capacity store of byte payloads keyed by [`Fingerprint`].
///
/// [`Segment`](crate::Segment) is the primary implementation;
/// [`Validated`](crate::Validated) wraps any store with integrity checks. A
/// [`Membuffer`](crate::Membuffer) routes each fingerprint to exactly one store.
pub trait FingerprintStore: Send + Sync + Debug {
    /// Largest payload this store accepts.
    fn max_item_size(&self) -> usize;

    /// Copies the payload of `fingerprint` into `out`, replacing its contents.
    ///
    /// Returns `false` if nothing is cached under the fingerprint. Counts as a hit.
    fn lookup_into(&self, fingerprint: Fingerprint, out: &mut Vec<u8>) -> bool;

    /// Returns a private copy of the payload of `fingerprint`.
    fn lookup(&self, fingerprint: Fingerprint) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        self.lookup_into(fingerprint, &mut out).then_some(out)
    }

    /// Runs `extract` over the cached payload without copying it out.
    ///
    /// The store stays locked for readers only while `extract` runs, so it should be
    /// short. Counts as a hit.
    fn lookup_with<R>(&self, fingerprint: Fingerprint, extract: impl FnOnce(&[u8]) -> R) -> Option<R>;

    /// Whether a payload is cached under `fingerprint`. Does not count as a hit.
    fn contains(&self, fingerprint: Fingerprint) -> bool;

    /// Caches `bytes` under `fingerprint`, replacing any previous payload.
    fn store(&self, fingerprint: Fingerprint, bytes: &[u8]) -> StoreOutcome;

    /// Lets `transform` edit the cached payload of `fingerprint`.
    ///
    /// Returns `Ok(false)` if nothing is cached under the fingerprint. If `transform`
    /// fails, the entry is dropped and the failure is returned as
    /// [`Error::Mutate`](crate::Error::Mutate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mutate`](crate::Error::Mutate) when `transform` fails.
    fn modify_in_place<F>(&self, fingerprint: Fingerprint, transform: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>;

    /// Drops the payload cached under `fingerprint`. Returns whether there was one.
    fn remove(&self, fingerprint: Fingerprint) -> bool;

    /// Drops every cached payload.
    fn clear(&self);

    /// Returns a snapshot of the store's statistics.
    fn stats(&self) -> SegmentStats;
}

/// Mutable access to a cached payload during [`FingerprintStore::modify_in_place`].
///
/// Edits through [`as_mut_slice`](Self::as_mut_slice) happen directly in cache memory.
/// To change the payload's length, use [`to_mut`](Self::to_mut) or
/// [`replace`](Self::replace); the cache then relocates the entry once the transform
/// returns, which may fail for lack of space and turn the entry into a miss.
#[derive(Debug)]
pub struct PayloadMut<'a> {
    live: &'a mut [u8],
    replacement: Option<Vec<u8>>,
}

impl<'a> PayloadMut<'a> {
    pub(crate) fn new(live: &'a mut [u8]) -> Self {
        Self { live, replacement: None }
    }

    /// Current payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.replacement.as_deref().unwrap_or(&*self.live)
    }

    /// The current payload, writable but fixed in length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.replacement {
            Some(replacement) => replacement.as_mut_slice(),
            None => &mut *self.live,
        }
    }

    /// Switches to an owned copy of the payload that may change length.
    pub fn to_mut(&mut self) -> &mut Vec<u8> {
        let live = &*self.live;
        self.replacement.get_or_insert_with(|| live.to_vec())
    }

    /// Replaces the whole payload.
    pub fn replace(&mut self, bytes: Vec<u8>) {
        self.replacement = Some(bytes);
    }

    pub(crate) fn into_replacement(self) -> Option<Vec<u8>> {
        self.replacement
    }
}
