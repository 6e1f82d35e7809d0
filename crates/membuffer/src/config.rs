// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction parameters and the geometry derived from them.

use crate::directory::ENTRY_FOOTPRINT;
use crate::error::{Error, Result};

/// Default total budget when none is configured.
pub const DEFAULT_TOTAL_SIZE: usize = 16 * 1024 * 1024;

/// Default fraction of each segment's budget spent on the entry directory.
pub const DEFAULT_DIRECTORY_RATIO: f64 = 0.1;

/// Default number of entry slots per directory group.
pub const DEFAULT_GROUP_SIZE: usize = 16;

/// Largest supported number of entry slots per directory group.
pub const MAX_GROUP_SIZE: usize = 1024;

/// Default alignment of payload offsets within a data region.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Largest supported payload alignment.
pub const MAX_ALIGNMENT: usize = 4096;

/// Upper bound on the number of segments.
pub const MAX_SEGMENT_COUNT: usize = 0x1_0000;

/// Upper bound on the size of a single segment, keeping offsets and sizes within `u32`.
pub const MAX_SEGMENT_SIZE: usize = 0xffff_0000;

/// Smallest segment an explicitly requested segment count may produce.
pub const MIN_SEGMENT_SIZE: usize = 256;

/// Segment size below which automatic segmentation does not split the budget further.
pub const DEFAULT_MIN_SEGMENT_SIZE: usize = 32 * 1024 * 1024;

/// How writers acquire a segment's lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WritePolicy {
    /// Every write waits for exclusive access.
    #[default]
    Blocking,

    /// A write that finds the segment busy is dropped, unless an entry for the same
    /// fingerprint exists; then it waits so that the old value cannot outlive it.
    NonBlockingPreferred,
}

/// Which lock flavor protects a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Locking {
    /// Readers share the segment, writers get exclusive access.
    #[default]
    ReadWrite,

    /// Readers and writers alike take exclusive access.
    Exclusive,
}

/// Numeric knobs of the randomized LFU heuristic.
///
/// Only the qualitative behavior is guaranteed: eviction is biased toward rarely hit
/// entries, randomized, and always terminates. The defaults are tuning values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EvictionTuning {
    /// Entries smaller than the average entry size divided by this value are always
    /// kept when the insertion window passes over them.
    pub small_entry_divisor: u64,

    /// The random keep threshold is drawn from `[0, factor * (average hits + 1))`.
    pub hit_threshold_factor: u64,

    /// An insertion of `n` bytes gives up once more than `n / divisor` bytes of other
    /// entries have been evicted for it.
    pub drop_limit_divisor: u64,
}

impl Default for EvictionTuning {
    fn default() -> Self {
        Self {
            small_entry_divisor: 8,
            hit_threshold_factor: 2,
            drop_limit_divisor: 2,
        }
    }
}

impl EvictionTuning {
    fn clamped(self) -> Self {
        Self {
            small_entry_divisor: self.small_entry_divisor.max(1),
            hit_threshold_factor: self.hit_threshold_factor.max(1),
            drop_limit_divisor: self.drop_limit_divisor.max(1),
        }
    }
}

/// Construction parameters of a [`Membuffer`](crate::Membuffer).
///
/// All values are validated and clamped when the cache is built; see
/// [`MembufferBuilder`](crate::MembufferBuilder) for a chained way to set them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MembufferConfig {
    /// Total number of bytes spent on directories and data regions together.
    pub total_size: usize,

    /// Fraction of each segment's share spent on its directory, clamped to `[0.001, 0.5]`.
    pub directory_ratio: f64,

    /// Requested number of segments, rounded down to a power of two. Zero derives a
    /// count from `total_size`.
    pub segment_count: usize,

    /// Entry slots per directory group.
    pub group_size: usize,

    /// Overrides the number of directory groups per segment. Zero derives it from
    /// `directory_ratio`.
    pub groups_per_segment: usize,

    /// Alignment of payload offsets, rounded up to a power of two.
    pub alignment: usize,

    /// Lowers the largest cacheable item below the default of a quarter segment.
    pub max_item_size: Option<usize>,

    /// Default synchronization mode of namespaces created on this cache.
    pub thread_safe: bool,

    /// How writers acquire segment locks.
    pub write_policy: WritePolicy,

    /// Lock flavor protecting each segment.
    pub locking: Locking,

    /// Eviction heuristic knobs.
    pub tuning: EvictionTuning,

    /// Seeds the per-segment random number generators, for reproducible eviction.
    pub seed: Option<u64>,
}

impl Default for MembufferConfig {
    fn default() -> Self {
        Self {
            total_size: DEFAULT_TOTAL_SIZE,
            directory_ratio: DEFAULT_DIRECTORY_RATIO,
            segment_count: 0,
            group_size: DEFAULT_GROUP_SIZE,
            groups_per_segment: 0,
            alignment: DEFAULT_ALIGNMENT,
            max_item_size: None,
            thread_safe: true,
            write_policy: WritePolicy::default(),
            locking: Locking::default(),
            tuning: EvictionTuning::default(),
            seed: None,
        }
    }
}

/// Sizes shared by every segment of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub segment_count: usize,
    pub group_count: usize,
    pub group_size: usize,
    pub data_size: usize,
    pub alignment: usize,
    pub max_item_size: usize,
    pub tuning: EvictionTuning,
}

impl Geometry {
    /// Derives the cache layout from a configuration.
    pub fn derive(config: &MembufferConfig) -> Result<Self> {
        if config.total_size == 0 {
            return Err(Error::InvalidConfig("total size must not be zero"));
        }

        let total = config.total_size;
        let group_size = config.group_size.clamp(1, MAX_GROUP_SIZE);
        let alignment = config.alignment.clamp(1, MAX_ALIGNMENT).next_power_of_two();
        let group_bytes = group_size * ENTRY_FOOTPRINT;

        let segment_count = segment_count(total, config.segment_count);
        let segment_total = (total / segment_count).clamp(MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE);

        let max_groups = (u32::MAX as usize / group_size).saturating_sub(1).max(1);
        let group_count = if config.groups_per_segment > 0 {
            config.groups_per_segment
        } else {
            let ratio = if config.directory_ratio.is_nan() {
                DEFAULT_DIRECTORY_RATIO
            } else {
                config.directory_ratio.clamp(0.001, 0.5)
            };
            #[expect(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss,
                reason = "directory size is an approximate share of a bounded segment size"
            )]
            let directory_bytes = (segment_total as f64 * ratio) as usize;
            directory_bytes / group_bytes
        }
        .clamp(1, max_groups);

        let directory_bytes = group_count * group_bytes;
        let min_data = 4 * alignment;
        let data_size = (segment_total.saturating_sub(directory_bytes) & !(alignment - 1)).max(min_data);

        let default_max_item = data_size / 4;
        let max_item_size = config
            .max_item_size
            .map_or(default_max_item, |requested| requested.min(default_max_item));

        Ok(Self {
            segment_count,
            group_count,
            group_size,
            data_size,
            alignment,
            max_item_size,
            tuning: config.tuning.clamped(),
        })
    }

    /// Number of directory slots per segment.
    pub const fn slots(&self) -> usize {
        self.group_count * self.group_size
    }
}

fn segment_count(total: usize, requested: usize) -> usize {
    let mut count = requested.min(MAX_SEGMENT_COUNT).min(total / MIN_SEGMENT_SIZE);
    count = prev_power_of_two(count);

    if count == 0 {
        // Splitting small caches hurts more than lock contention does: each segment
        // bounds the largest cacheable item. Grow the segment count at half the rate
        // of the total size.
        let mut shift = 0;
        while (2 * DEFAULT_MIN_SEGMENT_SIZE).checked_shl(2 * shift).is_some_and(|limit| limit < total)
            && (1usize << shift) < MAX_SEGMENT_COUNT
        {
            shift += 1;
        }
        count = 1 << shift;
    }

    while total / count > MAX_SEGMENT_SIZE && count < MAX_SEGMENT_COUNT {
        count *= 2;
    }

    count
}

const fn prev_power_of_two(value: usize) -> usize {
    if value == 0 { 0 } else { 1 << (usize::BITS - 1 - value.leading_zeros()) }
}
