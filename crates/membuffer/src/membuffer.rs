// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The segmented cache and its builder.

use std::sync::Arc;

use tracing::{debug, error};

use crate::config::{EvictionTuning, Geometry, Locking, MembufferConfig, WritePolicy};
use crate::directory::ENTRY_FOOTPRINT;
use crate::error::{CodecError, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::namespace::NamespaceBuilder;
use crate::segment::Segment;
use crate::stats::{MembufferStats, SegmentStats};
use crate::store::{FingerprintStore, PayloadMut, StoreOutcome};
use crate::validate::Validated;

/// A fixed-size in-memory cache shared by any number of namespaces.
///
/// The memory budget is split into a power-of-two number of segments, each with its own
/// lock, directory and data region. A fingerprint always maps to the same segment, so
/// operations on different segments never contend. All memory is reserved up front;
/// the cache never grows.
///
/// Most callers go through a [`Namespace`](crate::Namespace), created with
/// [`namespace`](Self::namespace). The fingerprint-level methods here are the primitives
/// namespaces are built on.
///
/// # Type Parameters
///
/// * `S` - The segment store, [`Segment`] or a decorator such as [`Validated`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use membuffer::{BytesCodec, Membuffer};
///
/// let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build()?);
/// let texts = cache.namespace("texts").build(BytesCodec);
///
/// texts.set(b"greeting", &b"hello".to_vec())?;
/// assert_eq!(texts.get(b"greeting")?, Some(b"hello".to_vec()));
/// # Ok::<(), membuffer::Error>(())
/// ```
pub struct Membuffer<S = Segment> {
    segments: Box<[S]>,
    max_item_size: usize,
    thread_safe: bool,
}

impl<S> std::fmt::Debug for Membuffer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membuffer")
            .field("segment_count", &self.segments.len())
            .field("max_item_size", &self.max_item_size)
            .field("thread_safe", &self.thread_safe)
            .finish_non_exhaustive()
    }
}

impl Membuffer<Segment> {
    /// Creates a new builder for configuring a `Membuffer`.
    #[must_use]
    pub fn builder() -> MembufferBuilder {
        MembufferBuilder::new()
    }

    /// Creates a cache from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero total size and [`Error::Allocation`]
    /// if any segment's memory cannot be reserved.
    pub fn new(config: &MembufferConfig) -> Result<Self> {
        Self::with_segments(config, |segment| segment)
    }
}

impl Membuffer<Validated<Segment>> {
    /// Creates a cache whose segments check every payload on read.
    ///
    /// # Errors
    ///
    /// Same as [`Membuffer::new`].
    pub fn new_validated(config: &MembufferConfig) -> Result<Self> {
        Self::with_segments(config, Validated::new)
    }
}

impl<S: FingerprintStore> Membuffer<S> {
    fn with_segments(config: &MembufferConfig, wrap: impl Fn(Segment) -> S) -> Result<Self> {
        let geometry = Geometry::derive(config)?;

        let mut segments = Vec::with_capacity(geometry.segment_count);
        for index in 0..geometry.segment_count {
            let seed = config.seed.map(|seed| seed.wrapping_add(index as u64));
            let Some(segment) = Segment::new(&geometry, config.write_policy, config.locking, seed) else {
                let bytes = geometry.data_size + geometry.slots() * ENTRY_FOOTPRINT;
                error!(segment = index, bytes, "failed to allocate cache segment");
                return Err(Error::Allocation { segment: index, bytes });
            };
            segments.push(wrap(segment));
        }

        let max_item_size = segments.first().map_or(0, FingerprintStore::max_item_size);

        debug!(
            segments = geometry.segment_count,
            groups_per_segment = geometry.group_count,
            group_size = geometry.group_size,
            data_size = geometry.data_size,
            max_item_size,
            "membuffer created"
        );

        Ok(Self {
            segments: segments.into_boxed_slice(),
            max_item_size,
            thread_safe: config.thread_safe,
        })
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the segments, in routing order.
    #[must_use]
    pub fn segments(&self) -> &[S] {
        &self.segments
    }

    /// Largest payload that can be cached.
    #[must_use]
    pub const fn max_item_size(&self) -> usize {
        self.max_item_size
    }

    /// Whether a payload of `size` bytes can be cached at all.
    #[must_use]
    pub const fn is_cacheable(&self, size: usize) -> bool {
        size <= self.max_item_size
    }

    /// Default synchronization mode of namespaces created on this cache.
    #[must_use]
    pub const fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Returns the segment responsible for `fingerprint`.
    #[must_use]
    pub fn segment_for(&self, fingerprint: Fingerprint) -> &S {
        &self.segments[self.segment_index(fingerprint)]
    }

    fn segment_index(&self, fingerprint: Fingerprint) -> usize {
        let mask = self.segments.len() as u64 - 1;
        #[expect(clippy::cast_possible_truncation, reason = "masked below the segment count")]
        let index = (fingerprint.high() & mask) as usize;
        index
    }

    /// Returns a copy of the payload cached under `fingerprint`.
    #[must_use]
    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<Vec<u8>> {
        self.segment_for(fingerprint).lookup(fingerprint)
    }

    /// Copies the payload cached under `fingerprint` into `out`.
    pub fn lookup_into(&self, fingerprint: Fingerprint, out: &mut Vec<u8>) -> bool {
        self.segment_for(fingerprint).lookup_into(fingerprint, out)
    }

    /// Runs `extract` over the payload cached under `fingerprint`.
    pub fn lookup_with<R>(&self, fingerprint: Fingerprint, extract: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.segment_for(fingerprint).lookup_with(fingerprint, extract)
    }

    /// Whether a payload is cached under `fingerprint`.
    #[must_use]
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.segment_for(fingerprint).contains(fingerprint)
    }

    /// Caches `bytes` under `fingerprint`.
    pub fn store(&self, fingerprint: Fingerprint, bytes: &[u8]) -> StoreOutcome {
        self.segment_for(fingerprint).store(fingerprint, bytes)
    }

    /// Lets `transform` edit the payload cached under `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mutate`] when `transform` fails; the entry is dropped.
    pub fn modify_in_place<F>(&self, fingerprint: Fingerprint, transform: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>,
    {
        self.segment_for(fingerprint).modify_in_place(fingerprint, transform)
    }

    /// Drops the payload cached under `fingerprint`.
    pub fn remove(&self, fingerprint: Fingerprint) -> bool {
        self.segment_for(fingerprint).remove(fingerprint)
    }

    /// Drops every cached payload.
    pub fn clear(&self) {
        for segment in &self.segments {
            segment.clear();
        }
    }

    /// Returns statistics summed over all segments.
    ///
    /// Segments are visited one after another, so the result is not an atomic snapshot.
    #[must_use]
    pub fn stats(&self) -> MembufferStats {
        MembufferStats::from_segments(self.segments.iter().map(FingerprintStore::stats))
    }

    /// Returns the statistics of every segment.
    #[must_use]
    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        self.segments.iter().map(FingerprintStore::stats).collect()
    }

    /// Starts registering a namespace whose keys are scoped by `prefix`.
    ///
    /// Only a digest of the prefix is kept. Namespaces with equal prefixes share entries.
    pub fn namespace(self: &Arc<Self>, prefix: impl AsRef<[u8]>) -> NamespaceBuilder<S> {
        NamespaceBuilder::new(Arc::clone(self), prefix.as_ref())
    }
}

/// Builder for configuring a [`Membuffer`].
///
/// # Examples
///
/// ```
/// use membuffer::{Membuffer, WritePolicy};
///
/// let cache = Membuffer::builder()
///     .total_size(64 << 20)
///     .segment_count(4)
///     .write_policy(WritePolicy::NonBlockingPreferred)
///     .build()?;
///
/// assert_eq!(cache.segment_count(), 4);
/// # Ok::<(), membuffer::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct MembufferBuilder {
    config: MembufferConfig,
}

impl MembufferBuilder {
    /// Creates a new builder with the defaults of [`MembufferConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all settings with `config`.
    #[must_use]
    pub fn config(mut self, config: MembufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the total memory budget in bytes.
    #[must_use]
    pub const fn total_size(mut self, bytes: usize) -> Self {
        self.config.total_size = bytes;
        self
    }

    /// Sets the fraction of the budget spent on entry directories.
    #[must_use]
    pub const fn directory_ratio(mut self, ratio: f64) -> Self {
        self.config.directory_ratio = ratio;
        self
    }

    /// Requests a number of segments; zero derives one from the total size.
    #[must_use]
    pub const fn segment_count(mut self, count: usize) -> Self {
        self.config.segment_count = count;
        self
    }

    /// Sets the number of entry slots per directory group.
    #[must_use]
    pub const fn group_size(mut self, slots: usize) -> Self {
        self.config.group_size = slots;
        self
    }

    /// Overrides the number of directory groups per segment.
    #[must_use]
    pub const fn groups_per_segment(mut self, groups: usize) -> Self {
        self.config.groups_per_segment = groups;
        self
    }

    /// Sets the alignment of payload offsets.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Lowers the largest cacheable item size.
    #[must_use]
    pub const fn max_item_size(mut self, bytes: usize) -> Self {
        self.config.max_item_size = Some(bytes);
        self
    }

    /// Sets the default synchronization mode of namespaces.
    #[must_use]
    pub const fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.config.thread_safe = thread_safe;
        self
    }

    /// Sets how writers acquire segment locks.
    #[must_use]
    pub const fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.config.write_policy = policy;
        self
    }

    /// Sets the lock flavor of each segment.
    #[must_use]
    pub const fn locking(mut self, locking: Locking) -> Self {
        self.config.locking = locking;
        self
    }

    /// Sets the eviction heuristic knobs.
    #[must_use]
    pub const fn tuning(mut self, tuning: EvictionTuning) -> Self {
        self.config.tuning = tuning;
        self
    }

    /// Seeds the eviction randomness, making eviction reproducible for a given sequence
    /// of single-threaded operations.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Builds the cache.
    ///
    /// # Errors
    ///
    /// Same as [`Membuffer::new`].
    pub fn build(self) -> Result<Membuffer> {
        Membuffer::new(&self.config)
    }

    /// Builds a cache whose segments check every payload on read.
    ///
    /// # Errors
    ///
    /// Same as [`Membuffer::new`].
    pub fn build_validated(self) -> Result<Membuffer<Validated<Segment>>> {
        Membuffer::new_validated(&self.config)
    }
}
