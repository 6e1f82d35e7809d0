// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Read-only statistics for monitoring.
//!
//! These records are snapshots taken under the respective locks; they are meant for
//! metrics and diagnostics, not for control flow.

use std::fmt;

use crate::fingerprint::Fingerprint;

/// Snapshot of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Size of the data region in bytes.
    pub capacity: usize,
    /// Bytes occupied by live payloads.
    pub used_bytes: usize,
    /// Number of live entries.
    pub used_entries: usize,
    /// Number of directory slots.
    pub total_entries: usize,
    /// Sum of the (aged) hit counts of all live entries.
    pub hit_count: u64,
    /// Lookups performed, including partial reads.
    pub reads: u64,
    /// Lookups that found their entry.
    pub hits: u64,
    /// Payloads written, including in-place modifications.
    pub writes: u64,
}

impl std::ops::AddAssign for SegmentStats {
    fn add_assign(&mut self, rhs: Self) {
        self.capacity += rhs.capacity;
        self.used_bytes += rhs.used_bytes;
        self.used_entries += rhs.used_entries;
        self.total_entries += rhs.total_entries;
        self.hit_count += rhs.hit_count;
        self.reads += rhs.reads;
        self.hits += rhs.hits;
        self.writes += rhs.writes;
    }
}

/// Statistics of a whole [`Membuffer`](crate::Membuffer), summed over its segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembufferStats {
    /// Number of segments.
    pub segment_count: usize,
    /// Sums over all segments.
    pub totals: SegmentStats,
}

impl MembufferStats {
    /// Sums per-segment snapshots.
    #[must_use]
    pub fn from_segments(segments: impl IntoIterator<Item = SegmentStats>) -> Self {
        segments.into_iter().fold(Self::default(), |mut stats, segment| {
            stats.segment_count += 1;
            stats.totals += segment;
            stats
        })
    }
}

impl fmt::Display for MembufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        write!(
            f,
            "{} of {} bytes used ({:.1}%), {} of {} entries used ({:.1}%), {} hits in {} reads ({:.1}%), {} writes, {} segments",
            t.used_bytes,
            t.capacity,
            percent(t.used_bytes as u64, t.capacity as u64),
            t.used_entries,
            t.total_entries,
            percent(t.used_entries as u64, t.total_entries as u64),
            t.hits,
            t.reads,
            percent(t.hits, t.reads),
            t.writes,
            self.segment_count,
        )
    }
}

/// Usage of one namespace, alongside the state of the cache it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Digest of the namespace prefix.
    pub prefix: Fingerprint,
    /// Calls to `get` and `get_partial`.
    pub gets: u64,
    /// Of those, the calls that found an item.
    pub hits: u64,
    /// Calls to `set` and `set_partial`.
    pub sets: u64,
    /// Writes that did not end up cached, and codec or mutator failures.
    pub failures: u64,
    /// Statistics of the shared cache.
    pub membuffer: MembufferStats,
}

impl fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "namespace {}: {} gets ({:.1}% hit rate), {} sets, {} failures",
            self.prefix,
            self.gets,
            percent(self.hits, self.gets),
            self.sets,
            self.failures,
        )?;
        write!(f, "cache: {}", self.membuffer)
    }
}

#[expect(clippy::cast_precision_loss, reason = "display only")]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 * 100.0 / whole as f64 }
}
