//! # Hash Index
//!
//! Point-lookup multiset over 1..=4 key fields. The combined key is the
//! tuple of raw field values under the archetype semantics from the parent
//! module: strings participate up to their first NUL, bit flags as a
//! normalized boolean. Records live in hash buckets keyed by the combined
//! key's hash; a bucket chain may mix distinct keys that collide, so
//! lookups filter the chain by exact per-field equality.
//!
//! ## Relocation
//!
//! A record whose key bytes change no longer belongs in its bucket. Three
//! situations are handled differently:
//!
//! - the change came from this index's own edit cursor: the entry is
//!   extracted from the stale bucket and queued; queued entries re-hash by
//!   their current bytes when the writer closes,
//! - the change came from another index's cursor: the store reports it via
//!   `on_record_changed` with the pre-edit backup; the stale bucket is
//!   found by hashing the backup bytes and the entry is queued the same
//!   way,
//! - the record is deleted mid-edit: the stale entry is located through the
//!   backup (or the pending queue, if its key already changed earlier in
//!   the same writer session) and dropped.

use std::cell::{Cell, RefCell};
use std::hash::{BuildHasher, Hasher};
use std::rc::{Rc, Weak};

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::index::{field_value, hash_value, index_token, value_equals, StoreIndex};
use crate::layout::{Field, FieldArchetype};
use crate::store::{record_slice, record_slice_mut, ReaderGuard, StoreInner, WriterGuard};

type Bucket = SmallVec<[*mut u8; 2]>;

pub struct HashIndex {
    store: Weak<StoreInner>,
    key_fields: SmallVec<[Field; 4]>,
    buckets: RefCell<HashMap<u64, Bucket>>,
    pending_reinsertion: RefCell<Vec<*mut u8>>,
    active_cursors: Cell<usize>,
    build_hasher: DefaultHashBuilder,
}

impl HashIndex {
    pub(crate) fn new(store: Weak<StoreInner>, key_fields: SmallVec<[Field; 4]>) -> Self {
        HashIndex {
            store,
            key_fields,
            buckets: RefCell::new(HashMap::new()),
            pending_reinsertion: RefCell::new(Vec::new()),
            active_cursors: Cell::new(0),
            build_hasher: DefaultHashBuilder::default(),
        }
    }

    fn store(&self) -> Rc<StoreInner> {
        self.store.upgrade().expect("index outlived its store")
    }

    /// Hash of the combined key read from a record (or backup) buffer.
    fn hash_record(&self, record: *const u8) -> u64 {
        let mut state = self.build_hasher.build_hasher();
        for field in &self.key_fields {
            hash_value(field, unsafe { field_value(field, record) }, &mut state);
        }
        state.finish()
    }

    fn hash_lookup_key(&self, key: &[&[u8]]) -> u64 {
        let mut state = self.build_hasher.build_hasher();
        for (field, chunk) in self.key_fields.iter().zip(key) {
            hash_key_chunk(field, chunk, &mut state);
        }
        state.finish()
    }

    fn record_matches_key(&self, record: *const u8, key: &[Vec<u8>]) -> bool {
        self.key_fields.iter().zip(key).all(|(field, chunk)| {
            key_chunk_matches(field, unsafe { field_value(field, record) }, chunk)
        })
    }

    fn validate_key<'k>(&self, key: &[&'k [u8]]) -> Vec<Vec<u8>> {
        assert!(
            key.len() == self.key_fields.len(),
            "hash lookup key has {} chunks, index has {} key fields",
            key.len(),
            self.key_fields.len()
        );
        for (field, chunk) in self.key_fields.iter().zip(key) {
            assert!(
                chunk.len() == field.size(),
                "key chunk for field '{}' has {} bytes, field has {}",
                field.name(),
                chunk.len(),
                field.size()
            );
        }
        key.iter().map(|chunk| chunk.to_vec()).collect()
    }

    /// Pulls `record` out of the bucket addressed by `hash`, or out of the
    /// pending queue when its key already changed this writer session.
    /// Returns whether the entry was found in a bucket.
    fn extract(&self, record: *mut u8, hash: u64) -> bool {
        let mut buckets = self.buckets.borrow_mut();
        if let Some(bucket) = buckets.get_mut(&hash) {
            if let Some(position) = bucket.iter().position(|entry| *entry == record) {
                bucket.swap_remove(position);
                if bucket.is_empty() {
                    buckets.remove(&hash);
                }
                return true;
            }
        }
        drop(buckets);

        let mut pending = self.pending_reinsertion.borrow_mut();
        if let Some(position) = pending.iter().position(|entry| *entry == record) {
            pending.swap_remove(position);
        }
        false
    }

    pub(crate) fn active_cursors(&self) -> usize {
        self.active_cursors.get()
    }
}

impl StoreIndex for HashIndex {
    fn on_record_inserted(&self, record: *mut u8) {
        let hash = self.hash_record(record);
        self.buckets.borrow_mut().entry(hash).or_default().push(record);
    }

    fn on_record_changed(&self, record: *mut u8, backup: *const u8) {
        let stale_hash = self.hash_record(backup);
        if self.extract(record, stale_hash) {
            self.pending_reinsertion.borrow_mut().push(record);
        }
    }

    fn on_record_deleted(&self, record: *mut u8, backup: *const u8) {
        let stale_hash = self.hash_record(backup);
        self.extract(record, stale_hash);
    }

    fn on_writer_closed(&self) {
        let pending = std::mem::take(&mut *self.pending_reinsertion.borrow_mut());
        for record in pending {
            self.on_record_inserted(record);
        }
    }
}

/// Reference-counted handle to a hash index attached to a store.
#[derive(Clone)]
pub struct HashIndexHandle {
    index: Rc<HashIndex>,
}

impl HashIndexHandle {
    pub(crate) fn new(index: Rc<HashIndex>) -> Self {
        HashIndexHandle { index }
    }

    pub(crate) fn into_index(self) -> Rc<HashIndex> {
        self.index
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &Field> {
        self.index.key_fields.iter()
    }

    pub fn is_same_index(&self, other: &HashIndexHandle) -> bool {
        Rc::ptr_eq(&self.index, &other.index)
    }

    /// Whether the owning store may drop this index right now: no other
    /// external handles, no cursors, quiescent store.
    pub fn can_be_dropped(&self) -> bool {
        let store_quiescent = self
            .index
            .store
            .upgrade()
            .map(|store| store.counters().is_quiescent())
            .unwrap_or(true);
        Rc::strong_count(&self.index) == 2
            && self.index.active_cursors.get() == 0
            && store_quiescent
    }

    /// Opens a read cursor over every record matching `key` (one
    /// field-sized byte chunk per key field; bit chunks are zero/non-zero
    /// booleans).
    pub fn lookup_to_read(&self, key: &[&[u8]]) -> HashReadCursor {
        let owned_key = self.index.validate_key(key);
        let guard = ReaderGuard::new(self.index.store());
        let hash = self.index.hash_lookup_key(key);
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);

        let mut cursor = HashReadCursor {
            index: self.index.clone(),
            _guard: guard,
            hash,
            key: owned_key,
            position: 0,
        };
        cursor.position = cursor.seek_match(0);
        cursor
    }

    /// Opens an edit cursor over every record matching `key`.
    pub fn lookup_to_edit(&self, key: &[&[u8]]) -> HashEditCursor {
        let owned_key = self.index.validate_key(key);
        let guard = WriterGuard::new(self.index.store());
        let hash = self.index.hash_lookup_key(key);
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);

        let mut cursor = HashEditCursor {
            index: self.index.clone(),
            writer: guard,
            hash,
            key: owned_key,
            position: 0,
        };
        cursor.position = cursor.seek_match(0);
        if let Some(record) = cursor.current_record() {
            cursor.writer.store().begin_record_edition(record);
        }
        cursor
    }
}

fn hash_key_chunk(field: &Field, chunk: &[u8], state: &mut impl Hasher) {
    if field.archetype() == FieldArchetype::Bit {
        state.write_u8(if chunk[0] != 0 { 1 } else { 0 });
    } else {
        hash_value(field, chunk, state);
    }
}

fn key_chunk_matches(field: &Field, record_value: &[u8], chunk: &[u8]) -> bool {
    if field.archetype() == FieldArchetype::Bit {
        let mask = 1u8 << field.bit_offset();
        (record_value[0] & mask != 0) == (chunk[0] != 0)
    } else {
        value_equals(field, record_value, chunk)
    }
}

/// Read cursor over one combined-key value. Clonable; dereferences to
/// `None` once every match was visited.
pub struct HashReadCursor {
    index: Rc<HashIndex>,
    _guard: ReaderGuard,
    hash: u64,
    key: Vec<Vec<u8>>,
    position: usize,
}

impl HashReadCursor {
    fn seek_match(&self, from: usize) -> usize {
        let buckets = self.index.buckets.borrow();
        let Some(bucket) = buckets.get(&self.hash) else {
            return 0;
        };
        let mut position = from;
        while position < bucket.len()
            && !self.index.record_matches_key(bucket[position], &self.key)
        {
            position += 1;
        }
        position
    }

    fn current_record(&self) -> Option<*mut u8> {
        let buckets = self.index.buckets.borrow();
        buckets
            .get(&self.hash)
            .and_then(|bucket| bucket.get(self.position))
            .copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        let store = self.index.store();
        self.current_record()
            .map(|record| unsafe { record_slice(record, store.layout().object_size()) })
    }

    /// Moves to the next matching record. Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        self.position = self.seek_match(self.position + 1);
    }
}

impl Clone for HashReadCursor {
    fn clone(&self) -> Self {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() + 1);
        HashReadCursor {
            index: self.index.clone(),
            _guard: self._guard.clone(),
            hash: self.hash,
            key: self.key.clone(),
            position: self.position,
        }
    }
}

impl Drop for HashReadCursor {
    fn drop(&mut self) {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}

/// Edit cursor over one combined-key value. Holds the store's writer; the
/// record under the cursor is in an open edition.
pub struct HashEditCursor {
    index: Rc<HashIndex>,
    writer: WriterGuard,
    hash: u64,
    key: Vec<Vec<u8>>,
    position: usize,
}

impl HashEditCursor {
    fn seek_match(&self, from: usize) -> usize {
        let buckets = self.index.buckets.borrow();
        let Some(bucket) = buckets.get(&self.hash) else {
            return 0;
        };
        let mut position = from;
        while position < bucket.len()
            && !self.index.record_matches_key(bucket[position], &self.key)
        {
            position += 1;
        }
        position
    }

    fn current_record(&self) -> Option<*mut u8> {
        let buckets = self.index.buckets.borrow();
        buckets
            .get(&self.hash)
            .and_then(|bucket| bucket.get(self.position))
            .copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        let size = self.writer.store().layout().object_size();
        self.current_record()
            .map(|record| unsafe { record_slice(record, size) })
    }

    pub fn current_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.writer.store().layout().object_size();
        self.current_record()
            .map(|record| unsafe { record_slice_mut(record, size) })
    }

    /// Finishes the current record's edition and moves on. If the edit
    /// changed this index's own key fields, the entry leaves its stale
    /// bucket and the slot the swap filled is examined instead of
    /// advancing, so no record is skipped.
    pub fn advance(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: advancing a finished cursor")
        });

        let token = index_token(&*self.index);
        let key_changed = self.writer.store().end_record_edition(record, token);
        if key_changed {
            self.index.extract(record, self.hash);
            self.index.pending_reinsertion.borrow_mut().push(record);
            self.position = self.seek_match(self.position);
        } else {
            self.position = self.seek_match(self.position + 1);
        }

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }

    /// Deletes the current record from the store (cascading to every other
    /// index) and lands on the next match.
    pub fn delete_current(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: deleting through a finished cursor")
        });

        self.index.extract(record, self.hash);
        let token = index_token(&*self.index);
        self.writer.store().delete_record(record, token);
        self.position = self.seek_match(self.position);

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }
}

impl Drop for HashEditCursor {
    fn drop(&mut self) {
        if let Some(record) = self.current_record() {
            let token = index_token(&*self.index);
            let key_changed = self.writer.store().end_record_edition(record, token);
            if key_changed {
                self.index.extract(record, self.hash);
                self.index.pending_reinsertion.borrow_mut().push(record);
            }
        }
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}
