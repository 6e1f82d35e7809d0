// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache segment implementation.
//!
//! A segment owns one entry directory and one data region behind a single lock. Live
//! entries are chained into a list ordered by payload offset. New payloads are written at
//! the cursor, the start of the insertion window; the window ends at the first entry at
//! or after the cursor (`next`), or at the end of the data region.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{trace, warn};

use crate::config::{EvictionTuning, Geometry, Locking, WritePolicy};
use crate::directory::{Directory, Entry, NO_INDEX, SlotIndex};
use crate::error::{CodecError, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::stats::SegmentStats;
use crate::store::{FingerprintStore, PayloadMut, StoreOutcome};

/// One lock-protected partition of a [`Membuffer`](crate::Membuffer).
///
/// Aligned to the CPU cache line so that the locks of neighboring segments do not share
/// one.
#[repr(align(64))]
pub struct Segment {
    inner: RwLock<SegmentInner>,
    write_policy: WritePolicy,
    locking: Locking,
    max_item_size: usize,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
}

impl Segment {
    /// Allocates a segment. Returns `None` if its memory cannot be reserved.
    pub(crate) fn new(geometry: &Geometry, write_policy: WritePolicy, locking: Locking, seed: Option<u64>) -> Option<Self> {
        Some(Self {
            inner: RwLock::new(SegmentInner::new(geometry, seed)?),
            write_policy,
            locking,
            max_item_size: geometry.max_item_size,
            reads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Runs `f` with shared access, or exclusive access under [`Locking::Exclusive`].
    fn read<R>(&self, f: impl FnOnce(&SegmentInner) -> R) -> R {
        match self.locking {
            Locking::ReadWrite => f(&self.inner.read()),
            Locking::Exclusive => f(&self.inner.write()),
        }
    }

    /// Acquires the write lock according to the write policy.
    ///
    /// Returns `None` if the write should be dropped.
    fn write_for(&self, fingerprint: Fingerprint) -> Option<RwLockWriteGuard<'_, SegmentInner>> {
        match self.write_policy {
            WritePolicy::Blocking => Some(self.inner.write()),
            WritePolicy::NonBlockingPreferred => {
                if let Some(guard) = self.inner.try_write() {
                    return Some(guard);
                }

                // Dropping the write is only safe if it cannot leave an outdated value
                // behind.
                if self.read(|inner| inner.contains(fingerprint)) {
                    Some(self.inner.write())
                } else {
                    None
                }
            }
        }
    }

    fn count_read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.inner.read().check_invariants();
    }
}

impl FingerprintStore for Segment {
    fn max_item_size(&self) -> usize {
        self.max_item_size
    }

    fn lookup_into(&self, fingerprint: Fingerprint, out: &mut Vec<u8>) -> bool {
        let found = self.read(|inner| {
            inner.hit(fingerprint).map(|bytes| {
                out.clear();
                out.extend_from_slice(bytes);
            })
        });
        self.count_read(found.is_some());
        found.is_some()
    }

    fn lookup_with<R>(&self, fingerprint: Fingerprint, extract: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let result = self.read(|inner| inner.hit(fingerprint).map(extract));
        self.count_read(result.is_some());
        result
    }

    fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.read(|inner| inner.contains(fingerprint))
    }

    fn store(&self, fingerprint: Fingerprint, bytes: &[u8]) -> StoreOutcome {
        let Some(mut inner) = self.write_for(fingerprint) else {
            trace!(fingerprint = %fingerprint, size = bytes.len(), "segment busy, write skipped");
            return StoreOutcome::Skipped;
        };

        let outcome = inner.store(fingerprint, bytes);
        drop(inner);

        match outcome {
            StoreOutcome::Stored => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            StoreOutcome::Rejected => {
                trace!(fingerprint = %fingerprint, size = bytes.len(), "payload not cached");
            }
            StoreOutcome::Skipped => {}
        }
        outcome
    }

    fn modify_in_place<F>(&self, fingerprint: Fingerprint, transform: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>,
    {
        let Some(mut inner) = self.write_for(fingerprint) else {
            // The entry did not exist when the segment was probed.
            return Ok(false);
        };

        let modified = inner.modify(fingerprint, transform);
        drop(inner);

        match &modified {
            Ok(true) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(error) => {
                warn!(fingerprint = %fingerprint, error = %error, "in-place modification failed, entry dropped");
            }
        }
        modified
    }

    fn remove(&self, fingerprint: Fingerprint) -> bool {
        self.inner.write().remove(fingerprint)
    }

    fn clear(&self) {
        self.inner.write().clear();
    }

    fn stats(&self) -> SegmentStats {
        SegmentStats {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            ..self.read(SegmentInner::stats)
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("write_policy", &self.write_policy)
            .field("locking", &self.locking)
            .field("max_item_size", &self.max_item_size)
            .finish_non_exhaustive()
    }
}

/// State of a segment, protected by its lock.
pub(crate) struct SegmentInner {
    pub(crate) directory: Directory,
    pub(crate) data: Box<[u8]>,
    /// Head of the used-entry list, lowest offset.
    pub(crate) first: SlotIndex,
    /// Tail of the used-entry list, highest offset.
    pub(crate) last: SlotIndex,
    /// First entry at or after the cursor; `NO_INDEX` if the window reaches the end.
    pub(crate) next: SlotIndex,
    /// Start of the insertion window.
    pub(crate) cursor: usize,
    pub(crate) used_entries: usize,
    /// Sum of the sizes of all live entries.
    pub(crate) data_used: usize,
    /// Sum of the hit counts of all live entries. Bumped under the read lock.
    pub(crate) hit_count: AtomicU64,
    pub(crate) rng: fastrand::Rng,
    pub(crate) alignment: usize,
    pub(crate) max_item_size: usize,
    pub(crate) tuning: EvictionTuning,
}

impl SegmentInner {
    pub(crate) fn new(geometry: &Geometry, seed: Option<u64>) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(geometry.data_size).ok()?;
        data.resize(geometry.data_size, 0);

        Some(Self {
            directory: Directory::new(geometry.group_count, geometry.group_size)?,
            data: data.into_boxed_slice(),
            first: NO_INDEX,
            last: NO_INDEX,
            next: NO_INDEX,
            cursor: 0,
            used_entries: 0,
            data_used: 0,
            hit_count: AtomicU64::new(0),
            rng: seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
            alignment: geometry.alignment,
            max_item_size: geometry.max_item_size,
            tuning: geometry.tuning,
        })
    }

    pub(crate) const fn align(&self, size: usize) -> usize {
        (size + self.alignment - 1) & !(self.alignment - 1)
    }

    fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.directory.find(fingerprint).is_some()
    }

    /// Returns the payload of `fingerprint`, recording a hit.
    pub(crate) fn hit(&self, fingerprint: Fingerprint) -> Option<&[u8]> {
        let entry = self.directory.entry(self.directory.find(fingerprint)?);
        if entry.record_hit() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        Some(&self.data[entry.offset as usize..entry.end()])
    }

    pub(crate) fn store(&mut self, fingerprint: Fingerprint, bytes: &[u8]) -> StoreOutcome {
        let size = bytes.len();

        if size <= self.max_item_size
            && let Some(index) = self.directory.find(fingerprint)
        {
            let entry = self.directory.entry(index);
            let (offset, old_size) = (entry.offset as usize, entry.size as usize);
            if size <= self.align(old_size) {
                self.data[offset..offset + size].copy_from_slice(bytes);
                self.directory.entry_mut(index).size = to_u32(size);
                self.data_used = self.data_used - old_size + size;
                return StoreOutcome::Stored;
            }
        }

        if size > self.max_item_size || !self.ensure_space(size) {
            self.remove(fingerprint);
            return StoreOutcome::Rejected;
        }

        // Dropping entries only ever widens the window, so the space found above remains.
        self.make_room_in_group(fingerprint);

        let offset = self.cursor;
        let index = self.directory.push(Entry::new(fingerprint, to_u32(offset), to_u32(size)));
        self.link_before_next(index);
        self.data[offset..offset + size].copy_from_slice(bytes);

        self.used_entries += 1;
        self.data_used += size;
        self.cursor = self.align(offset + size);
        debug_assert!(self.cursor <= self.data.len());

        StoreOutcome::Stored
    }

    fn modify<F>(&mut self, fingerprint: Fingerprint, transform: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>,
    {
        let Some(index) = self.directory.find(fingerprint) else {
            return Ok(false);
        };

        let entry = self.directory.entry(index);
        let (offset, size) = (entry.offset as usize, entry.size as usize);

        let mut payload = PayloadMut::new(&mut self.data[offset..offset + size]);
        let transformed = transform(&mut payload);
        let replacement = payload.into_replacement();

        if let Err(error) = transformed {
            self.drop_entry(index);
            return Err(Error::Mutate(error));
        }

        match replacement {
            Some(bytes) if bytes.len() == size => {
                self.data[offset..offset + size].copy_from_slice(&bytes);
            }
            Some(bytes) => {
                self.drop_entry(index);
                self.store(fingerprint, &bytes);
            }
            None => {}
        }
        Ok(true)
    }

    fn remove(&mut self, fingerprint: Fingerprint) -> bool {
        self.directory.find(fingerprint).map(|index| self.drop_entry(index)).is_some()
    }

    fn clear(&mut self) {
        self.directory.clear();
        self.first = NO_INDEX;
        self.last = NO_INDEX;
        self.next = NO_INDEX;
        self.cursor = 0;
        self.used_entries = 0;
        self.data_used = 0;
        *self.hit_count.get_mut() = 0;
    }

    fn stats(&self) -> SegmentStats {
        SegmentStats {
            capacity: self.data.len(),
            used_bytes: self.data_used,
            used_entries: self.used_entries,
            total_entries: self.directory.slot_count(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            ..SegmentStats::default()
        }
    }

    /// Frees a directory slot for `fingerprint` in its group.
    ///
    /// Drops an older entry of the same fingerprint. If the group is still full, the
    /// entry with the fewest hits goes, and the survivors' hit counts are halved.
    fn make_room_in_group(&mut self, fingerprint: Fingerprint) {
        if let Some(index) = self.directory.find(fingerprint) {
            self.drop_entry(index);
        }

        let group = self.directory.group_for(fingerprint);
        if self.directory.is_full(group) {
            let victim = self.directory.victim(group, &mut self.rng);
            let aged = self.directory.age_group(group, victim);
            *self.hit_count.get_mut() -= aged;
            self.drop_entry(victim);
        }
    }

    /// Links a freshly pushed entry into the used list right before `next`.
    fn link_before_next(&mut self, index: SlotIndex) {
        let next = self.next;
        let prev = if next == NO_INDEX {
            self.last
        } else {
            self.directory.entry(next).prev
        };

        let entry = self.directory.entry_mut(index);
        entry.prev = prev;
        entry.next = next;

        if prev == NO_INDEX {
            self.first = index;
        } else {
            self.directory.entry_mut(prev).next = index;
        }

        if next == NO_INDEX {
            self.last = index;
        } else {
            self.directory.entry_mut(next).prev = index;
        }
    }

    /// Removes a live entry, widening the insertion window if it borders it.
    pub(crate) fn drop_entry(&mut self, index: SlotIndex) {
        let entry = self.directory.entry(index);
        let (prev, next, size) = (entry.prev, entry.next, entry.size as usize);
        let hits = u64::from(entry.hit_count());

        self.data_used -= size;
        self.used_entries -= 1;
        *self.hit_count.get_mut() -= hits;

        if index == self.next {
            self.next = next;
        } else if next == self.next {
            // The entry sits right before the window: the window now starts behind its
            // predecessor.
            self.cursor = if prev == NO_INDEX {
                0
            } else {
                let end = self.directory.entry(prev).end();
                self.align(end)
            };
        }

        if prev == NO_INDEX {
            self.first = next;
        } else {
            self.directory.entry_mut(prev).next = next;
        }
        if next == NO_INDEX {
            self.last = prev;
        } else {
            self.directory.entry_mut(next).prev = prev;
        }

        if let Some(moved) = self.directory.swap_remove(index) {
            self.relink(moved, index);
        }
    }

    /// Redirects links to an entry that moved from slot `from` to slot `to`.
    fn relink(&mut self, from: SlotIndex, to: SlotIndex) {
        let entry = self.directory.entry(to);
        let (prev, next) = (entry.prev, entry.next);

        if prev == NO_INDEX {
            self.first = to;
        } else {
            self.directory.entry_mut(prev).next = to;
        }
        if next == NO_INDEX {
            self.last = to;
        } else {
            self.directory.entry_mut(next).prev = to;
        }
        if self.next == from {
            self.next = to;
        }
    }

    /// Asserts the structural invariants of the used list and the accounting totals.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut count = 0;
        let mut bytes = 0;
        let mut hits = 0;
        let mut prev = NO_INDEX;
        let mut prev_end = 0;
        let mut seen_next = self.next == NO_INDEX;
        let mut index = self.first;

        while index != NO_INDEX {
            assert!(self.directory.is_live(index), "list links a dead slot {index}");
            let entry = self.directory.entry(index);
            assert_eq!(entry.prev, prev, "broken back link at slot {index}");
            assert!(entry.offset as usize >= prev_end, "entries overlap at slot {index}");
            assert_eq!(entry.offset as usize % self.alignment, 0, "misaligned entry");
            assert!(entry.end() <= self.data.len(), "entry exceeds the data region");
            assert_eq!(self.directory.find(entry.fingerprint), Some(index), "fingerprint stored twice");

            if index == self.next {
                seen_next = true;
                assert!(entry.offset as usize >= self.cursor, "window bound lies before the cursor");
            } else if !seen_next {
                assert!(entry.end() <= self.cursor, "entry before the window overlaps it");
            }

            count += 1;
            bytes += entry.size as usize;
            hits += u64::from(entry.hit_count());
            prev_end = self.align(entry.end());
            prev = index;
            index = entry.next;
        }

        assert!(seen_next, "window bound is not in the used list");
        assert_eq!(prev, self.last, "tail mismatch");
        assert_eq!(count, self.used_entries, "used entry count mismatch");
        assert_eq!(
            count,
            (0..self.directory.group_count()).map(|group| self.directory.used(group)).sum::<usize>(),
            "directory holds unlinked entries"
        );
        assert_eq!(bytes, self.data_used, "used byte count mismatch");
        assert!(self.data_used <= self.data.len());
        assert!(self.cursor <= self.data.len());
        assert_eq!(hits, self.hit_count.load(Ordering::Relaxed), "hit count mismatch");
    }
}

#[expect(clippy::cast_possible_truncation, reason = "segment sizes are capped below u32::MAX")]
pub(crate) const fn to_u32(value: usize) -> u32 {
    value as u32
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::config::MembufferConfig;
    use crate::directory::ENTRY_FOOTPRINT;

    /// One group of four slots over a 256-byte data region.
    fn small_segment(write_policy: WritePolicy) -> Segment {
        let geometry = Geometry::derive(&MembufferConfig {
            total_size: 256 + 4 * ENTRY_FOOTPRINT,
            segment_count: 1,
            group_size: 4,
            groups_per_segment: 1,
            ..MembufferConfig::default()
        })
        .expect("valid config");
        Segment::new(&geometry, write_policy, Locking::ReadWrite, Some(11)).expect("allocation")
    }

    fn fp(tag: u64) -> Fingerprint {
        Fingerprint::from_words(tag, tag)
    }

    #[test]
    fn store_then_lookup() {
        let segment = small_segment(WritePolicy::Blocking);
        assert_eq!(segment.store(fp(1), b"hello"), StoreOutcome::Stored);
        assert_eq!(segment.lookup(fp(1)).as_deref(), Some(&b"hello"[..]));
        assert!(segment.lookup(fp(2)).is_none());
        segment.check_invariants();

        let stats = segment.stats();
        assert_eq!(stats.used_entries, 1);
        assert_eq!(stats.used_bytes, 5);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hit_count, 1);
    }

    #[test]
    fn smaller_overwrite_stays_in_place() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), &[1; 16]);
        segment.store(fp(2), &[2; 16]);
        segment.store(fp(1), &[3; 10]);

        let inner = segment.inner.read();
        let index = inner.directory.find(fp(1)).expect("present");
        assert_eq!(inner.directory.entry(index).offset, 0);
        assert_eq!(inner.data_used, 26);
        drop(inner);

        assert_eq!(segment.lookup(fp(1)), Some(vec![3; 10]));
        segment.check_invariants();
    }

    #[test]
    fn larger_overwrite_relocates() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), &[1; 16]);
        segment.store(fp(1), &[2; 40]);
        assert_eq!(segment.lookup(fp(1)), Some(vec![2; 40]));
        assert_eq!(segment.stats().used_entries, 1);
        segment.check_invariants();
    }

    #[test]
    fn oversized_store_purges_the_old_value() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), b"small");
        assert_eq!(segment.store(fp(1), &[0; 65]), StoreOutcome::Rejected);
        assert!(segment.lookup(fp(1)).is_none());
        segment.check_invariants();
    }

    #[test]
    fn full_group_evicts_the_coldest_entry() {
        let segment = small_segment(WritePolicy::Blocking);
        for tag in 1..=4 {
            segment.store(fp(tag), &[0; 8]);
        }
        for tag in [1, 2, 4] {
            assert!(segment.lookup(fp(tag)).is_some());
        }

        segment.store(fp(5), &[0; 8]);
        assert!(!segment.contains(fp(3)));
        assert!([1, 2, 4, 5].into_iter().all(|tag| segment.contains(fp(tag))));
        segment.check_invariants();
    }

    #[test]
    fn window_wraps_around() {
        let segment = small_segment(WritePolicy::Blocking);
        for round in 0..64u8 {
            let tag = u64::from(round % 6);
            segment.store(fp(tag), &[round; 48]);
            segment.check_invariants();
        }
        let stats = segment.stats();
        assert!(stats.used_bytes <= stats.capacity);
        assert!(stats.used_entries <= 4);
    }

    #[test]
    fn modify_in_place_edits_live_bytes() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), b"abc");

        let modified = segment
            .modify_in_place(fp(1), |payload| {
                payload.as_mut_slice()[0] = b'x';
                Ok(())
            })
            .expect("mutator succeeds");
        assert!(modified);
        assert_eq!(segment.lookup(fp(1)).as_deref(), Some(&b"xbc"[..]));
    }

    #[test]
    fn modify_in_place_can_resize() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), b"abc");
        segment
            .modify_in_place(fp(1), |payload| {
                payload.to_mut().extend_from_slice(&[b'd'; 30]);
                Ok(())
            })
            .expect("mutator succeeds");
        assert_eq!(segment.lookup(fp(1)).map(|bytes| bytes.len()), Some(33));
        segment.check_invariants();
    }

    #[test]
    fn failed_modify_drops_the_entry() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), b"abc");
        let err = segment
            .modify_in_place(fp(1), |_| Err("corrupt".into()))
            .expect_err("mutator fails");
        assert!(matches!(err, Error::Mutate(_)));
        assert!(!segment.contains(fp(1)));
        segment.check_invariants();
    }

    #[test]
    fn modify_of_missing_entry_is_a_no_op() {
        let segment = small_segment(WritePolicy::Blocking);
        let modified = segment.modify_in_place(fp(1), |_| Ok(())).expect("no mutator call");
        assert!(!modified);
    }

    #[test]
    fn busy_segment_skips_writes_of_new_keys() {
        let segment = small_segment(WritePolicy::NonBlockingPreferred);
        segment.store(fp(1), b"old");

        let guard = segment.inner.read();
        assert_eq!(segment.store(fp(2), b"new"), StoreOutcome::Skipped);
        drop(guard);

        assert!(!segment.contains(fp(2)));
        assert_eq!(segment.store(fp(2), b"new"), StoreOutcome::Stored);
    }

    #[test]
    fn busy_segment_waits_for_writes_of_existing_keys() {
        let segment = small_segment(WritePolicy::NonBlockingPreferred);
        segment.store(fp(1), b"old");
        let finished = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let guard = segment.inner.read();
            let writer = scope.spawn(|| {
                let outcome = segment.store(fp(1), b"new");
                finished.store(true, Ordering::SeqCst);
                outcome
            });

            std::thread::sleep(Duration::from_millis(100));
            let waited = !finished.load(Ordering::SeqCst);
            drop(guard);

            assert!(waited, "write of a cached key must wait instead of being dropped");
            assert_eq!(writer.join().expect("writer thread"), StoreOutcome::Stored);
        });

        assert_eq!(segment.lookup(fp(1)).as_deref(), Some(&b"new"[..]));
        segment.check_invariants();
    }

    #[test]
    fn payload_offsets_round_up_to_the_alignment() {
        let segment = small_segment(WritePolicy::Blocking);
        let inner = segment.inner.read();
        assert_eq!(inner.align(0), 0);
        assert_eq!(inner.align(1), 16);
        assert_eq!(inner.align(16), 16);
        assert_eq!(inner.align(17), 32);
    }

    #[test]
    fn exclusive_locking_serves_reads() {
        let geometry = Geometry::derive(&MembufferConfig {
            total_size: 1 << 16,
            segment_count: 1,
            ..MembufferConfig::default()
        })
        .expect("valid config");
        let segment = Segment::new(&geometry, WritePolicy::Blocking, Locking::Exclusive, None).expect("allocation");

        segment.store(fp(1), b"value");
        assert_eq!(segment.lookup_with(fp(1), <[u8]>::len), Some(5));
        assert!(segment.contains(fp(1)));
    }

    #[test]
    fn clear_resets_everything() {
        let segment = small_segment(WritePolicy::Blocking);
        segment.store(fp(1), b"abc");
        segment.store(fp(2), b"def");
        segment.clear();

        assert!(!segment.contains(fp(1)));
        let stats = segment.stats();
        assert_eq!(stats.used_entries, 0);
        assert_eq!(stats.used_bytes, 0);
        segment.check_invariants();
        assert_eq!(segment.store(fp(3), b"ghi"), StoreOutcome::Stored);
    }
}
