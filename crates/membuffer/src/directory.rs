// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The set-associative entry directory of a segment.
//!
//! The directory is a flat array of entry slots, partitioned into groups of equal size.
//! A fingerprint maps to exactly one group, and the live slots of a group are always
//! packed at its front. Slots are addressed by a `u32` [`SlotIndex`], which is also what
//! the segment's used-entry list links through.
//!
//! Directories can be large and are mostly empty for a long time, so their memory is
//! left uninitialized at construction. Groups are initialized in batches the first time
//! an entry is written into them; a group in an untouched batch reads as empty. All
//! `unsafe` code of the crate lives in this module, behind checked accessors.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::fingerprint::Fingerprint;

/// Index of an entry slot within a directory.
pub(crate) type SlotIndex = u32;

/// Sentinel for "no slot", terminating the used-entry list.
pub(crate) const NO_INDEX: SlotIndex = SlotIndex::MAX;

/// Number of directory bytes consumed by one entry slot.
///
/// Useful for sizing a cache whose directory must hold a given number of slots.
pub const ENTRY_FOOTPRINT: usize = size_of::<Entry>();

/// Number of groups initialized together.
const INIT_BATCH: usize = 32;

/// Metadata of one cached item.
#[derive(Debug)]
pub(crate) struct Entry {
    /// Identity of the item.
    pub fingerprint: Fingerprint,
    /// Start of the payload within the data region.
    pub offset: u32,
    /// Payload length in bytes.
    pub size: u32,
    /// Access frequency estimate. Bumped under the read lock, aged under the write lock.
    hits: AtomicU32,
    /// Next entry by offset.
    pub next: SlotIndex,
    /// Previous entry by offset.
    pub prev: SlotIndex,
}

impl Entry {
    /// Creates an unlinked entry with a zero hit count.
    pub fn new(fingerprint: Fingerprint, offset: u32, size: u32) -> Self {
        Self {
            fingerprint,
            offset,
            size,
            hits: AtomicU32::new(0),
            next: NO_INDEX,
            prev: NO_INDEX,
        }
    }

    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Bumps the hit count. Returns `false` once it has saturated.
    pub fn record_hit(&self) -> bool {
        // Saturate instead of wrapping so that a hot entry never looks cold.
        self.hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |hits| hits.checked_add(1))
            .is_ok()
    }

    /// Halves the hit count, rounding the removed share up. Returns the number removed.
    pub fn age(&mut self) -> u32 {
        let hits = self.hits.get_mut();
        let removed = hits.div_ceil(2);
        *hits -= removed;
        removed
    }

    /// Position of the first byte following the payload.
    pub fn end(&self) -> usize {
        self.offset as usize + self.size as usize
    }
}

/// Fixed-size table of entry slots, grouped for set-associative lookup.
pub(crate) struct Directory {
    /// Entry slots. Slot `g * group_size + i` is initialized iff group `g` is
    /// initialized and `i < used[g]`.
    slots: Box<[MaybeUninit<Entry>]>,
    /// Live slot count per group. Initialized per batch, tracked by `initialized`.
    used: Box<[MaybeUninit<u16>]>,
    /// One bit per batch of `INIT_BATCH` groups.
    initialized: Box<[u64]>,
    group_size: usize,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("group_count", &self.group_count())
            .field("group_size", &self.group_size)
            .finish_non_exhaustive()
    }
}

impl Directory {
    /// Reserves a directory of `group_count` groups with `group_size` slots each.
    ///
    /// Returns `None` if the memory cannot be reserved.
    pub fn new(group_count: usize, group_size: usize) -> Option<Self> {
        debug_assert!(group_size > 0 && group_size <= usize::from(u16::MAX));
        debug_assert!(group_count * group_size < NO_INDEX as usize);

        let batches = group_count.div_ceil(INIT_BATCH);

        Some(Self {
            slots: uninit_slice(group_count.checked_mul(group_size)?)?,
            used: uninit_slice(group_count)?,
            initialized: zeroed_slice(batches.div_ceil(64))?,
            group_size,
        })
    }

    pub fn group_count(&self) -> usize {
        self.used.len()
    }

    /// Total number of entry slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The group a slot belongs to.
    pub fn group_of(&self, index: SlotIndex) -> usize {
        index as usize / self.group_size
    }

    /// The group a fingerprint maps to.
    pub fn group_for(&self, fingerprint: Fingerprint) -> usize {
        #[expect(clippy::cast_possible_truncation, reason = "the remainder is below the group count")]
        let group = (fingerprint.low() % self.group_count() as u64) as usize;
        group
    }

    fn is_initialized(&self, group: usize) -> bool {
        let batch = group / INIT_BATCH;
        self.initialized[batch / 64] & (1 << (batch % 64)) != 0
    }

    /// Makes sure the batch containing `group` is initialized.
    fn initialize(&mut self, group: usize) {
        if self.is_initialized(group) {
            return;
        }

        let batch = group / INIT_BATCH;
        let start = batch * INIT_BATCH;
        let end = (start + INIT_BATCH).min(self.group_count());
        for used in &mut self.used[start..end] {
            used.write(0);
        }
        self.initialized[batch / 64] |= 1 << (batch % 64);
    }

    /// Number of live slots in `group`. Untouched groups are empty.
    pub fn used(&self, group: usize) -> usize {
        if !self.is_initialized(group) {
            return 0;
        }

        // SAFETY: every `used` counter of an initialized batch has been written.
        usize::from(unsafe { self.used[group].assume_init() })
    }

    fn set_used(&mut self, group: usize, used: usize) {
        debug_assert!(self.is_initialized(group));
        debug_assert!(used <= self.group_size);
        #[expect(clippy::cast_possible_truncation, reason = "group sizes are bounded by u16::MAX")]
        self.used[group].write(used as u16);
    }

    /// Whether `index` addresses a live slot.
    pub fn is_live(&self, index: SlotIndex) -> bool {
        let index = index as usize;
        index < self.slots.len() && index % self.group_size < self.used(index / self.group_size)
    }

    fn slot_index(&self, group: usize, position: usize) -> SlotIndex {
        #[expect(clippy::cast_possible_truncation, reason = "slot counts are bounded below NO_INDEX")]
        let index = (group * self.group_size + position) as SlotIndex;
        index
    }

    /// Returns the live entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not address a live slot.
    pub fn entry(&self, index: SlotIndex) -> &Entry {
        assert!(self.is_live(index), "slot {index} is not live");
        // SAFETY: live slots are always initialized.
        unsafe { self.slots[index as usize].assume_init_ref() }
    }

    /// Returns the live entry at `index` for modification.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not address a live slot.
    pub fn entry_mut(&mut self, index: SlotIndex) -> &mut Entry {
        assert!(self.is_live(index), "slot {index} is not live");
        // SAFETY: live slots are always initialized.
        unsafe { self.slots[index as usize].assume_init_mut() }
    }

    /// Finds the live slot holding `fingerprint` in its group.
    pub fn find(&self, fingerprint: Fingerprint) -> Option<SlotIndex> {
        let group = self.group_for(fingerprint);
        (0..self.used(group))
            .map(|position| self.slot_index(group, position))
            .find(|&index| self.entry(index).fingerprint == fingerprint)
    }

    /// Whether `group` has no free slot left.
    pub fn is_full(&self, group: usize) -> bool {
        self.used(group) == self.group_size
    }

    /// Picks the slot of a full group that is least likely to be useful.
    ///
    /// The scan starts from a random slot so that ties do not always hit the same
    /// position, which would turn one slot into a revolving door.
    pub fn victim(&self, group: usize, rng: &mut fastrand::Rng) -> SlotIndex {
        let used = self.used(group);
        debug_assert!(used > 0);

        let mut victim = self.slot_index(group, rng.usize(..used));
        for position in 0..used {
            let candidate = self.slot_index(group, position);
            if self.entry(candidate).hit_count() < self.entry(victim).hit_count() {
                victim = candidate;
            }
        }
        victim
    }

    /// Halves the hit counts of every live slot in `group` except `spared`.
    ///
    /// Returns the total number of hits removed.
    pub fn age_group(&mut self, group: usize, spared: SlotIndex) -> u64 {
        let mut removed = 0;
        for position in 0..self.used(group) {
            let index = self.slot_index(group, position);
            if index != spared {
                removed += u64::from(self.entry_mut(index).age());
            }
        }
        removed
    }

    /// Appends an entry to its fingerprint's group and returns its slot.
    ///
    /// # Panics
    ///
    /// Panics if the group is full.
    pub fn push(&mut self, entry: Entry) -> SlotIndex {
        let group = self.group_for(entry.fingerprint);
        self.initialize(group);

        let used = self.used(group);
        assert!(used < self.group_size, "group {group} is full");

        let index = self.slot_index(group, used);
        self.slots[index as usize].write(entry);
        self.set_used(group, used + 1);
        index
    }

    /// Removes the live slot at `index`, filling the hole with the last live slot of the
    /// same group.
    ///
    /// Returns the former index of the moved slot, if a slot was moved. Its entry now
    /// lives at `index` and links pointing at the former index must be redirected.
    pub fn swap_remove(&mut self, index: SlotIndex) -> Option<SlotIndex> {
        assert!(self.is_live(index), "slot {index} is not live");

        let group = self.group_of(index);
        let used = self.used(group);
        let last = self.slot_index(group, used - 1);

        self.slots.swap(index as usize, last as usize);
        self.set_used(group, used - 1);

        (last != index).then_some(last)
    }

    /// Marks every group empty.
    pub fn clear(&mut self) {
        for group in 0..self.group_count() {
            if self.is_initialized(group) {
                self.set_used(group, 0);
            }
        }
    }
}

// `Entry` has no drop glue, so leaving stale or uninitialized slots behind leaks nothing.
const _: () = assert!(!std::mem::needs_drop::<Entry>());

fn uninit_slice<T>(len: usize) -> Option<Box<[MaybeUninit<T>]>> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(len).ok()?;
    slots.resize_with(len, MaybeUninit::uninit);
    Some(slots.into_boxed_slice())
}

fn zeroed_slice(len: usize) -> Option<Box<[u64]>> {
    let mut words = Vec::new();
    words.try_reserve_exact(len).ok()?;
    words.resize(len, 0);
    Some(words.into_boxed_slice())
}
