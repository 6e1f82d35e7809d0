// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The insertion window allocator and its randomized LFU eviction.
//!
//! Space for a new payload is found by growing the window at its end: the entry bounding
//! it is either kept, which moves it in front of the window, or evicted, which merges its
//! bytes into the window. Once the end of the data region is reached the window starts
//! over at offset zero, so every entry is reconsidered once per pass.

use crate::directory::{NO_INDEX, SlotIndex};
use crate::segment::{SegmentInner, to_u32};

impl SegmentInner {
    /// Grows the insertion window until it holds `size` bytes.
    ///
    /// Returns `false` if that would evict too much, in which case the payload should not
    /// be cached. Entries evicted before giving up stay evicted.
    pub(crate) fn ensure_space(&mut self, size: usize) -> bool {
        debug_assert!(size <= self.data.len());

        let mut dropped = 0_u64;
        loop {
            let end = if self.next == NO_INDEX {
                self.data.len()
            } else {
                self.directory.entry(self.next).offset as usize
            };

            if end >= self.cursor + size {
                return true;
            }

            // Small items fit after a single eviction; of the larger ones only about
            // half get in.
            if dropped.saturating_mul(self.tuning.drop_limit_divisor) > size as u64 {
                return false;
            }

            if self.next == NO_INDEX {
                self.cursor = 0;
                self.next = self.first;
                continue;
            }

            let index = self.next;
            if self.should_keep(index) {
                self.relocate(index);
            } else {
                dropped += u64::from(self.directory.entry(index).size);
                self.drop_entry(index);
            }
        }
    }

    /// Decides whether the entry bounding the window survives this pass.
    fn should_keep(&mut self, index: SlotIndex) -> bool {
        let entry = self.directory.entry(index);
        let size = u64::from(entry.size);
        let hits = u64::from(entry.hit_count());
        let used_entries = self.used_entries as u64;

        // Tiny entries are likely headers or similar; keep them while they are a minority.
        if size * used_entries < self.data_used as u64 / self.tuning.small_entry_divisor {
            return true;
        }

        let total_hits = *self.hit_count.get_mut();
        if total_hits > used_entries {
            let average = total_hits / used_entries;
            let bound = self.tuning.hit_threshold_factor.saturating_mul(average + 1);
            hits >= self.rng.u64(..bound)
        } else {
            hits > 0 || self.rng.bool()
        }
    }

    /// Moves a surviving entry to the start of the window and halves its hit count.
    fn relocate(&mut self, index: SlotIndex) {
        let entry = self.directory.entry_mut(index);
        let aged = entry.age();
        let (offset, size, next) = (entry.offset as usize, entry.size as usize, entry.next);
        *self.hit_count.get_mut() -= u64::from(aged);

        debug_assert!(self.cursor <= offset);
        if offset != self.cursor {
            self.data.copy_within(offset..offset + size, self.cursor);
            self.directory.entry_mut(index).offset = to_u32(self.cursor);
        }

        self.cursor = self.align(self.cursor + size);
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::config::{Geometry, MembufferConfig};
    use crate::directory::ENTRY_FOOTPRINT;
    use crate::fingerprint::Fingerprint;
    use crate::segment::SegmentInner;

    /// 1 KiB of data, 64 slots in 8 groups.
    fn inner(seed: u64) -> SegmentInner {
        let geometry = Geometry::derive(&MembufferConfig {
            total_size: 1024 + 64 * ENTRY_FOOTPRINT,
            segment_count: 1,
            group_size: 8,
            groups_per_segment: 8,
            ..MembufferConfig::default()
        })
        .expect("valid config");
        SegmentInner::new(&geometry, Some(seed)).expect("allocation")
    }

    fn fp(tag: u64) -> Fingerprint {
        Fingerprint::from_words(tag, tag)
    }

    fn fill(inner: &mut SegmentInner, tags: std::ops::Range<u64>) {
        for tag in tags {
            #[expect(clippy::cast_possible_truncation, reason = "test tags are small")]
            let byte = tag as u8;
            inner.store(fp(tag), &[byte; 64]);
        }
    }

    #[test]
    fn fitting_window_evicts_nothing() {
        let mut inner = inner(1);
        fill(&mut inner, 0..2);
        assert!(inner.ensure_space(64));
        assert_eq!(inner.used_entries, 2);
        inner.check_invariants();
    }

    #[test]
    fn full_region_wraps_and_makes_room() {
        let mut inner = inner(2);
        fill(&mut inner, 0..16);
        assert_eq!(inner.cursor, inner.data.len());

        assert!(inner.ensure_space(64));
        assert!(inner.cursor + 64 <= inner.data.len());
        assert!(inner.used_entries < 16);
        inner.check_invariants();
    }

    #[test]
    fn relocated_entries_keep_their_bytes() {
        let mut inner = inner(3);
        fill(&mut inner, 0..64);
        inner.check_invariants();

        let mut survivors = 0;
        for tag in 0..64_u64 {
            if let Some(bytes) = inner.hit(fp(tag)) {
                #[expect(clippy::cast_possible_truncation, reason = "test tags are small")]
                let expected = tag as u8;
                assert!(bytes.iter().all(|&byte| byte == expected), "payload of {tag} corrupted");
                survivors += 1;
            }
        }
        assert_eq!(survivors, inner.used_entries);
    }

    #[test]
    fn hot_entries_survive_passes() {
        let mut inner = inner(4);
        fill(&mut inner, 0..16);

        for _ in 0..1000 {
            assert!(inner.hit(fp(0)).is_some());
        }

        fill(&mut inner, 16..48);
        assert!(inner.hit(fp(0)).is_some());
        inner.check_invariants();
    }

    #[test]
    fn tiny_entries_survive_without_hits() {
        for seed in 0..32 {
            let mut inner = inner(seed);
            inner.store(fp(100), &[0xEE]);
            fill(&mut inner, 0..15);
            assert_eq!(inner.cursor, inner.data.len() - 48);

            // Wraps around, so the tiny entry at offset zero bounds the window first.
            assert!(inner.ensure_space(64));
            assert_eq!(inner.hit(fp(100)), Some(&[0xEE][..]), "tiny entry evicted with seed {seed}");
            inner.check_invariants();
        }
    }

    #[test]
    fn any_hit_protects_an_entry_while_hits_are_scarce() {
        for seed in 0..32 {
            let mut inner = inner(seed);
            fill(&mut inner, 0..16);
            assert!(inner.hit(fp(0)).is_some());
            assert!(inner.hit_count.load(Ordering::Relaxed) <= inner.used_entries as u64);

            assert!(inner.ensure_space(64));
            let index = inner.directory.find(fp(0)).expect("entry with a hit was evicted");
            assert_eq!(inner.directory.entry(index).hit_count(), 0, "survivors are aged");
            inner.check_invariants();
        }
    }

    #[test]
    fn giving_up_leaves_a_sound_state() {
        let mut inner = inner(5);
        fill(&mut inner, 0..16);
        for _ in 0..64 {
            let _ = inner.ensure_space(256);
            inner.check_invariants();
        }
    }
}
