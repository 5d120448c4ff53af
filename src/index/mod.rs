//! Index Module
//!
//! In-memory key directory: for every live key, where its newest entry sits
//! on disk. Tombstones are never stored here; a deleted key is simply absent.
//!
//! ## Concurrency
//! - One `parking_lot::RwLock` around the whole map
//! - Reads take the read lock just long enough to copy a pointer out
//! - Compaction repoints keys with compare-and-set so a write that lands
//!   mid-merge is never overwritten by a stale relocation

mod rebuild;

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::TOMBSTONE_MARKER;

pub use rebuild::{rebuild, rebuild_by_scan, rebuild_from_hints, RecoveryReport, SegmentRecovery, VersionTable};

/// Where one entry lives on disk, without its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub segment_id: u16,
    pub offset: u64,
    /// Full encoded size (header + key + value)
    pub entry_size: u32,
    /// Value length, `TOMBSTONE_MARKER` for deletes
    pub value_size: u32,
    pub timestamp: u64,
}

impl EntryLocation {
    /// Last-writer-wins ordering: timestamp, then segment id, then offset
    pub fn version(&self) -> (u64, u16, u64) {
        (self.timestamp, self.segment_id, self.offset)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_MARKER
    }
}

/// Index record for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPointer {
    pub key: Arc<[u8]>,
    pub segment_id: u16,
    pub offset: u64,
    pub entry_size: u32,
    pub value_size: u32,
    pub timestamp: u64,
}

impl RecordPointer {
    pub fn new(key: Arc<[u8]>, location: EntryLocation) -> Self {
        Self {
            key,
            segment_id: location.segment_id,
            offset: location.offset,
            entry_size: location.entry_size,
            value_size: location.value_size,
            timestamp: location.timestamp,
        }
    }

    pub fn location(&self) -> EntryLocation {
        EntryLocation {
            segment_id: self.segment_id,
            offset: self.offset,
            entry_size: self.entry_size,
            value_size: self.value_size,
            timestamp: self.timestamp,
        }
    }

    pub fn version(&self) -> (u64, u16, u64) {
        self.location().version()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_MARKER
    }

    /// Same entry on disk (ignores the key)
    pub fn same_location(&self, other: &RecordPointer) -> bool {
        self.segment_id == other.segment_id
            && self.offset == other.offset
            && self.timestamp == other.timestamp
    }
}

/// Map slot: a pointer hashed and compared by its key alone, so the key
/// bytes are stored exactly once per entry.
#[derive(Debug, Clone)]
struct Slot(RecordPointer);

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key
    }
}

impl Eq for Slot {}

impl Hash for Slot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        <[u8] as Hash>::hash(&*self.0.key, state)
    }
}

impl Borrow<[u8]> for Slot {
    fn borrow(&self) -> &[u8] {
        &self.0.key
    }
}

type SlotSet = HashSet<Slot, ahash::RandomState>;

/// Thread-safe key directory
#[derive(Debug, Default)]
pub struct Index {
    slots: RwLock<SlotSet>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(SlotSet::with_capacity_and_hasher(
                capacity,
                ahash::RandomState::new(),
            )),
        }
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Current pointer for `key`
    pub fn get(&self, key: &[u8]) -> Option<RecordPointer> {
        self.slots.read().get(key).map(|slot| slot.0.clone())
    }

    /// Run `f` on the pointer for `key` while the read lock is held
    ///
    /// Lets a reader pin whatever the pointer references (e.g. the segment
    /// handle) before a concurrent compaction can repoint the key.
    pub fn with_pointer<R>(&self, key: &[u8], f: impl FnOnce(&RecordPointer) -> R) -> Option<R> {
        self.slots.read().get(key).map(|slot| f(&slot.0))
    }

    /// Insert or replace the pointer for `pointer.key`, returning the old one
    pub fn put(&self, pointer: RecordPointer) -> Option<RecordPointer> {
        self.slots.write().replace(Slot(pointer)).map(|slot| slot.0)
    }

    /// Remove `key`, returning its pointer if it was present
    pub fn delete(&self, key: &[u8]) -> Option<RecordPointer> {
        self.slots.write().take(key).map(|slot| slot.0)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.slots.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    // =========================================================================
    // Compare-and-Set (used by compaction)
    // =========================================================================

    /// True if `key` still points at exactly `expected`'s entry
    pub fn points_to(&self, expected: &RecordPointer) -> bool {
        self.slots
            .read()
            .get(&*expected.key)
            .map(|slot| slot.0.same_location(expected))
            .unwrap_or(false)
    }

    /// Replace `expected` with `new` only if the key still points at `expected`
    pub fn replace_if(&self, expected: &RecordPointer, new: RecordPointer) -> bool {
        let mut slots = self.slots.write();
        Self::swap_locked(&mut slots, expected, Some(new))
    }

    /// Remove the key only if it still points at `expected`
    pub fn remove_if(&self, expected: &RecordPointer) -> bool {
        let mut slots = self.slots.write();
        Self::swap_locked(&mut slots, expected, None)
    }

    /// Apply a batch of compare-and-set moves under one write lock
    ///
    /// Each move is `(expected, replacement)`; `None` removes the key.
    /// Returns how many moves took effect.
    pub fn apply_moves<I>(&self, moves: I) -> usize
    where
        I: IntoIterator<Item = (RecordPointer, Option<RecordPointer>)>,
    {
        let mut slots = self.slots.write();
        moves
            .into_iter()
            .filter(|(expected, new)| Self::swap_locked(&mut slots, expected, new.clone()))
            .count()
    }

    fn swap_locked(slots: &mut SlotSet, expected: &RecordPointer, new: Option<RecordPointer>) -> bool {
        let current_matches = slots
            .get(&*expected.key)
            .map(|slot| slot.0.same_location(expected))
            .unwrap_or(false);
        if !current_matches {
            return false;
        }

        match new {
            Some(pointer) => {
                slots.replace(Slot(pointer));
            }
            None => {
                slots.remove(&*expected.key);
            }
        }
        true
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Visit every pointer under the read lock
    pub fn for_each(&self, mut f: impl FnMut(&RecordPointer)) {
        for slot in self.slots.read().iter() {
            f(&slot.0);
        }
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<Arc<[u8]>> {
        self.slots.read().iter().map(|slot| slot.0.key.clone()).collect()
    }

    /// Sum of live entry bytes per segment
    pub fn live_bytes_by_segment(&self) -> HashMap<u16, u64> {
        let mut live = HashMap::new();
        self.for_each(|pointer| {
            *live.entry(pointer.segment_id).or_insert(0) += pointer.entry_size as u64;
        });
        live
    }

    /// Replace the whole map (used once recovery has chosen every winner)
    pub fn replace_all<I>(&self, pointers: I)
    where
        I: IntoIterator<Item = RecordPointer>,
    {
        let mut fresh = SlotSet::with_hasher(ahash::RandomState::new());
        fresh.extend(pointers.into_iter().map(Slot));
        *self.slots.write() = fresh;
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }
}
