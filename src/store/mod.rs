//! # Record Store
//!
//! Owner of one record type's memory and of every index attached to it.
//! The store never interprets record bytes on its own: it allocates slots,
//! enforces the access contract, and routes insert/change/delete
//! notifications to the attached indices.
//!
//! ## Access Contract
//!
//! | State          | Readers allowed | Writer allowed |
//! |----------------|-----------------|----------------|
//! | quiescent      | yes             | yes            |
//! | readers active | yes             | no             |
//! | writer active  | no              | no             |
//!
//! The counters are plain `Cell`s mutated only by the scoped guards below.
//! A violating acquisition is an integration bug in the caller's task
//! schedule and panics immediately rather than blocking or returning an
//! error. Closing the writer flushes every index's deferred reorder queue.
//!
//! ## Edition Protocol
//!
//! Indexed fields of the record under edit are snapshotted into a single
//! backup buffer (`begin_record_edition`). Finishing the edit
//! (`end_record_edition`) byte-diffs each indexed field against the backup
//! into a per-field bitmask and notifies exactly the indices whose field
//! masks intersect it, skipping the index that drove the edit — that index
//! learns about its own change from the returned flag and relocates the
//! record itself.

pub(crate) mod pool;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::index::hash::{HashIndex, HashIndexHandle};
use crate::index::ordered::{OrderedIndex, OrderedIndexHandle};
use crate::index::signal::{SignalIndex, SignalIndexHandle};
use crate::index::volumetric::{Dimension, VolumetricIndex, VolumetricIndexHandle};
use crate::index::{index_token, StoreIndex};
use crate::layout::{resolve_leaf_fields, Field, FieldArchetype, FieldId, RecordLayout};

use pool::RecordPool;

/// Indexed fields per store are tracked in a compact registry addressed by
/// bits of a `u32` change mask.
pub(crate) const MAX_INDEXED_FIELDS: usize = 32;

/// Reader/writer occupancy counters shared by stores and containers.
#[derive(Default)]
pub(crate) struct AccessCounters {
    readers: Cell<usize>,
    writers: Cell<usize>,
}

impl AccessCounters {
    pub fn enter_reader(&self) {
        assert!(
            self.writers.get() == 0,
            "access contract violation: read access requested while a writer is active"
        );
        self.readers.set(self.readers.get() + 1);
    }

    pub fn exit_reader(&self) {
        self.readers.set(self.readers.get() - 1);
    }

    pub fn enter_writer(&self) {
        assert!(
            self.writers.get() == 0,
            "access contract violation: write access requested while a writer is active"
        );
        assert!(
            self.readers.get() == 0,
            "access contract violation: write access requested while {} readers are active",
            self.readers.get()
        );
        self.writers.set(1);
    }

    pub fn exit_writer(&self) {
        self.writers.set(self.writers.get() - 1);
    }

    pub fn is_quiescent(&self) -> bool {
        self.readers.get() == 0 && self.writers.get() == 0
    }
}

struct IndexHolder<T> {
    index: Rc<T>,
    fields: SmallVec<[Field; 4]>,
    mask: Cell<u32>,
}

#[derive(Default)]
struct IndexSet {
    hash: Vec<IndexHolder<HashIndex>>,
    ordered: Vec<IndexHolder<OrderedIndex>>,
    volumetric: Vec<IndexHolder<VolumetricIndex>>,
    signal: Vec<IndexHolder<SignalIndex>>,
}

impl IndexSet {
    fn for_each(&self, mut visit: impl FnMut(&dyn StoreIndex, u32, usize)) {
        for holder in &self.hash {
            visit(&*holder.index, holder.mask.get(), index_token(&*holder.index));
        }
        for holder in &self.ordered {
            visit(&*holder.index, holder.mask.get(), index_token(&*holder.index));
        }
        for holder in &self.volumetric {
            visit(&*holder.index, holder.mask.get(), index_token(&*holder.index));
        }
        for holder in &self.signal {
            visit(&*holder.index, holder.mask.get(), index_token(&*holder.index));
        }
    }

    fn is_empty(&self) -> bool {
        self.hash.is_empty()
            && self.ordered.is_empty()
            && self.volumetric.is_empty()
            && self.signal.is_empty()
    }
}

struct IndexedFieldSlot {
    field: Field,
    usage: Cell<u32>,
}

pub(crate) struct StoreInner {
    layout: RecordLayout,
    pool: RefCell<RecordPool>,
    backup: RefCell<Box<[u8]>>,
    counters: AccessCounters,
    indices: RefCell<IndexSet>,
    indexed_fields: RefCell<Vec<IndexedFieldSlot>>,
}

impl StoreInner {
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn counters(&self) -> &AccessCounters {
        &self.counters
    }

    pub fn record_count(&self) -> usize {
        self.pool.borrow().len()
    }

    /// Snapshots every indexed field of `record` into the backup buffer.
    ///
    /// Only one record is ever under edit at a time (single-writer
    /// contract), so one buffer per store suffices.
    pub fn begin_record_edition(&self, record: *mut u8) {
        debug_assert!(self.counters.writers.get() > 0);
        let mut backup = self.backup.borrow_mut();
        let record = unsafe { record_slice(record, self.layout.object_size()) };

        for slot in self.indexed_fields.borrow().iter() {
            let field = &slot.field;
            backup[field.offset..field.offset + field.size]
                .copy_from_slice(field.bytes_of(record));
        }
    }

    /// Diffs `record` against the backup and notifies affected indices,
    /// skipping `requester`. Returns whether the requester's own fields
    /// changed.
    pub fn end_record_edition(&self, record: *mut u8, requester: usize) -> bool {
        debug_assert!(self.counters.writers.get() > 0);
        let backup = self.backup.borrow();
        let record_bytes = unsafe { record_slice(record, self.layout.object_size()) };

        let mut changed: u32 = 0;
        for (bit, slot) in self.indexed_fields.borrow().iter().enumerate() {
            let field = &slot.field;
            let differs = if field.archetype() == FieldArchetype::Bit {
                let mask = 1u8 << field.bit_offset();
                (record_bytes[field.offset()] ^ backup[field.offset()]) & mask != 0
            } else {
                field.bytes_of(record_bytes) != &backup[field.offset()..field.offset() + field.size()]
            };

            if differs {
                changed |= 1 << bit;
            }
        }

        if changed == 0 {
            return false;
        }

        let backup_ptr = backup.as_ptr();
        let mut requester_affected = false;
        self.indices.borrow().for_each(|index, mask, token| {
            if mask & changed == 0 {
                return;
            }
            if token == requester {
                requester_affected = true;
            } else {
                index.on_record_changed(record, backup_ptr);
            }
        });
        requester_affected
    }

    /// Removes `record` from every index except `requester` and frees its
    /// slot. Only valid inside an edition: indices locate the record
    /// through the backup snapshot.
    pub fn delete_record(&self, record: *mut u8, requester: usize) {
        debug_assert!(self.counters.writers.get() > 0);
        {
            let backup = self.backup.borrow();
            let backup_ptr = backup.as_ptr();
            self.indices.borrow().for_each(|index, _, token| {
                if token != requester {
                    index.on_record_deleted(record, backup_ptr);
                }
            });
        }
        self.pool.borrow_mut().release(record);
    }

    fn insert_into_indices(&self, record: *mut u8) {
        self.indices.borrow().for_each(|index, _, _| {
            index.on_record_inserted(record);
        });
    }

    fn on_writer_closed(&self) {
        self.indices.borrow().for_each(|index, _, _| {
            index.on_writer_closed();
        });
    }

    /// Registers `fields` in the indexed-field registry, bumping usage
    /// counts, and returns the change-mask bits covering them.
    fn register_indexed_fields(&self, fields: &[Field]) -> Result<u32> {
        let mut registry = self.indexed_fields.borrow_mut();
        let mut mask = 0u32;

        for field in fields {
            let position = registry.iter().position(|slot| slot.field.is_same(field));
            let bit = match position {
                Some(bit) => {
                    let slot = &registry[bit];
                    slot.usage.set(slot.usage.get() + 1);
                    bit
                }
                None => {
                    ensure!(
                        registry.len() < MAX_INDEXED_FIELDS,
                        "store '{}' exceeds {} distinct indexed fields",
                        self.layout.name(),
                        MAX_INDEXED_FIELDS
                    );
                    registry.push(IndexedFieldSlot {
                        field: field.clone(),
                        usage: Cell::new(1),
                    });
                    registry.len() - 1
                }
            };
            mask |= 1 << bit;
        }
        Ok(mask)
    }

    /// Drops usage counts for `fields`, compacts the registry, and rebuilds
    /// every remaining index's change mask against the new bit positions.
    fn unregister_indexed_fields(&self, fields: &[Field]) {
        {
            let mut registry = self.indexed_fields.borrow_mut();
            for field in fields {
                let slot = registry
                    .iter()
                    .position(|slot| slot.field.is_same(field))
                    .expect("indexed field registered at index creation");
                let usage = registry[slot].usage.get();
                if usage == 1 {
                    registry.remove(slot);
                } else {
                    registry[slot].usage.set(usage - 1);
                }
            }
        }

        let registry = self.indexed_fields.borrow();
        let rebuild = |fields: &[Field]| {
            let mut mask = 0u32;
            for field in fields {
                if let Some(bit) = registry.iter().position(|slot| slot.field.is_same(field)) {
                    mask |= 1 << bit;
                }
            }
            mask
        };

        let indices = self.indices.borrow();
        for holder in &indices.hash {
            holder.mask.set(rebuild(&holder.fields));
        }
        for holder in &indices.ordered {
            holder.mask.set(rebuild(&holder.fields));
        }
        for holder in &indices.volumetric {
            holder.mask.set(rebuild(&holder.fields));
        }
        for holder in &indices.signal {
            holder.mask.set(rebuild(&holder.fields));
        }
    }

    /// Feeds every live record to a freshly created index. Walks an
    /// ordered index when one exists so the new index observes records in
    /// a deterministic order; otherwise walks the pool.
    fn back_fill(&self, index: &dyn StoreIndex) {
        let indices = self.indices.borrow();
        if let Some(holder) = indices.ordered.first() {
            holder.index.for_each_record(&mut |record| index.on_record_inserted(record));
        } else {
            for record in self.pool.borrow().iter() {
                index.on_record_inserted(record);
            }
        }
    }

    fn assert_quiescent_for_index_change(&self, what: &str) {
        assert!(
            self.counters.is_quiescent(),
            "access contract violation: {what} requires a quiescent store"
        );
    }
}

/// Scoped read access to one store. Construction panics if a writer is
/// active.
pub(crate) struct ReaderGuard {
    store: Rc<StoreInner>,
}

impl ReaderGuard {
    pub fn new(store: Rc<StoreInner>) -> Self {
        store.counters.enter_reader();
        ReaderGuard { store }
    }
}

impl Clone for ReaderGuard {
    fn clone(&self) -> Self {
        ReaderGuard::new(self.store.clone())
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.store.counters.exit_reader();
    }
}

/// Scoped exclusive write access. Construction panics if any access is
/// active; dropping flushes deferred index reorders.
pub(crate) struct WriterGuard {
    store: Rc<StoreInner>,
}

impl WriterGuard {
    pub fn new(store: Rc<StoreInner>) -> Self {
        store.counters.enter_writer();
        WriterGuard { store }
    }

    pub fn store(&self) -> &Rc<StoreInner> {
        &self.store
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.store.counters.exit_writer();
        self.store.on_writer_closed();
    }
}

/// Insertion transaction: holds the writer, hands out zeroed slots, and
/// commits each filled record into every index when the next slot is
/// requested or the allocator drops.
pub struct Allocator {
    writer: WriterGuard,
    pending: *mut u8,
}

impl Allocator {
    fn new(store: Rc<StoreInner>) -> Self {
        Allocator {
            writer: WriterGuard::new(store),
            pending: std::ptr::null_mut(),
        }
    }

    /// Commits the previously allocated record and returns a fresh zeroed
    /// slot to fill in.
    pub fn allocate(&mut self) -> &mut [u8] {
        self.commit_pending();
        let store = self.writer.store();
        let slot = store.pool.borrow_mut().acquire();
        self.pending = slot;
        unsafe { record_slice_mut(slot, store.layout.object_size()) }
    }

    pub(crate) fn pending(&self) -> *mut u8 {
        self.pending
    }

    pub(crate) fn commit_pending(&mut self) {
        if !self.pending.is_null() {
            self.writer.store().insert_into_indices(self.pending);
            self.pending = std::ptr::null_mut();
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.commit_pending();
    }
}

/// One record type's storage plus its attached indices.
pub struct RecordStore {
    inner: Rc<StoreInner>,
}

impl RecordStore {
    pub fn new(layout: RecordLayout) -> Self {
        let pool = RecordPool::new(layout.object_size());
        let backup = vec![0u8; pool.slot_size()].into_boxed_slice();
        tracing::debug!(record_type = layout.name(), "record store created");

        RecordStore {
            inner: Rc::new(StoreInner {
                layout,
                pool: RefCell::new(pool),
                backup: RefCell::new(backup),
                counters: AccessCounters::default(),
                indices: RefCell::new(IndexSet::default()),
                indexed_fields: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn layout(&self) -> &RecordLayout {
        self.inner.layout()
    }

    pub fn record_count(&self) -> usize {
        self.inner.record_count()
    }

    pub fn is_quiescent(&self) -> bool {
        self.inner.counters.is_quiescent()
    }

    pub(crate) fn inner(&self) -> &Rc<StoreInner> {
        &self.inner
    }

    /// Opens an insertion transaction. Panics while any access is active.
    pub fn allocate(&self) -> Allocator {
        Allocator::new(self.inner.clone())
    }

    /// Creates (or reuses) a hash index over `key_fields`. Requires a
    /// quiescent store; existing records are back-filled.
    pub fn create_hash_index(&self, key_fields: &[FieldId]) -> Result<HashIndexHandle> {
        self.inner.assert_quiescent_for_index_change("index creation");
        let leafs = resolve_leaf_fields(&self.inner.layout, key_fields)?;
        ensure!(!leafs.is_empty(), "hash index needs at least one key field");
        ensure!(leafs.len() <= 4, "hash index supports at most 4 key fields");

        if let Some(holder) = self
            .inner
            .indices
            .borrow()
            .hash
            .iter()
            .find(|holder| same_fields(&holder.fields, &leafs))
        {
            return Ok(HashIndexHandle::new(holder.index.clone()));
        }

        let index = Rc::new(HashIndex::new(Rc::downgrade(&self.inner), leafs.clone()));
        self.inner.back_fill(&*index);
        let mask = self.inner.register_indexed_fields(&leafs)?;
        self.inner.indices.borrow_mut().hash.push(IndexHolder {
            index: index.clone(),
            fields: leafs,
            mask: Cell::new(mask),
        });

        tracing::debug!(
            record_type = self.inner.layout.name(),
            keys = key_fields.len(),
            "hash index created"
        );
        Ok(HashIndexHandle::new(index))
    }

    /// Creates (or reuses) an ordered index over one sort field.
    pub fn create_ordered_index(&self, field: FieldId) -> Result<OrderedIndexHandle> {
        self.inner.assert_quiescent_for_index_change("index creation");
        let leafs = resolve_leaf_fields(&self.inner.layout, &[field])?;
        ensure!(
            leafs.len() == 1,
            "ordered index sorts by exactly one leaf field"
        );

        if let Some(holder) = self
            .inner
            .indices
            .borrow()
            .ordered
            .iter()
            .find(|holder| same_fields(&holder.fields, &leafs))
        {
            return Ok(OrderedIndexHandle::new(holder.index.clone()));
        }

        let index = Rc::new(OrderedIndex::new(
            Rc::downgrade(&self.inner),
            leafs[0].clone(),
        ));
        self.inner.back_fill(&*index);
        index.finish_mass_insertion();
        let mask = self.inner.register_indexed_fields(&leafs)?;
        self.inner.indices.borrow_mut().ordered.push(IndexHolder {
            index: index.clone(),
            fields: leafs,
            mask: Cell::new(mask),
        });

        tracing::debug!(
            record_type = self.inner.layout.name(),
            "ordered index created"
        );
        Ok(OrderedIndexHandle::new(index))
    }

    /// Creates (or reuses) a volumetric index over 1..=3 dimensions.
    pub fn create_volumetric_index(&self, dimensions: &[Dimension]) -> Result<VolumetricIndexHandle> {
        self.inner.assert_quiescent_for_index_change("index creation");
        ensure!(
            (1..=3).contains(&dimensions.len()),
            "volumetric index supports 1 to 3 dimensions"
        );

        let mut leafs: SmallVec<[Field; 4]> = SmallVec::new();
        for dimension in dimensions {
            let bounds =
                resolve_leaf_fields(&self.inner.layout, &[dimension.min_field, dimension.max_field])?;
            ensure!(
                bounds.len() == 2,
                "volumetric dimension bounds must be scalar leaf fields"
            );
            ensure!(
                bounds[0].archetype() == bounds[1].archetype()
                    && bounds[0].size() == bounds[1].size(),
                "volumetric dimension bounds must share one numeric representation"
            );
            ensure!(
                matches!(
                    bounds[0].archetype(),
                    FieldArchetype::Int | FieldArchetype::Uint | FieldArchetype::Float
                ),
                "volumetric dimension bounds must be numeric"
            );
            leafs.extend(bounds);
        }

        if let Some(holder) = self
            .inner
            .indices
            .borrow()
            .volumetric
            .iter()
            .find(|holder| same_fields(&holder.fields, &leafs))
        {
            return Ok(VolumetricIndexHandle::new(holder.index.clone()));
        }

        let index = Rc::new(VolumetricIndex::new(Rc::downgrade(&self.inner), &leafs));
        self.inner.back_fill(&*index);
        let mask = self.inner.register_indexed_fields(&leafs)?;
        self.inner.indices.borrow_mut().volumetric.push(IndexHolder {
            index: index.clone(),
            fields: leafs,
            mask: Cell::new(mask),
        });

        tracing::debug!(
            record_type = self.inner.layout.name(),
            dimensions = dimensions.len(),
            "volumetric index created"
        );
        Ok(VolumetricIndexHandle::new(index))
    }

    /// Creates (or reuses) a signal index watching `field & mask ==
    /// signaled_value & mask`.
    pub fn create_signal_index(
        &self,
        field: FieldId,
        mask: u64,
        signaled_value: u64,
    ) -> Result<SignalIndexHandle> {
        self.inner.assert_quiescent_for_index_change("index creation");
        let leafs = resolve_leaf_fields(&self.inner.layout, &[field])?;
        ensure!(leafs.len() == 1, "signal index watches exactly one leaf field");
        ensure!(
            leafs[0].size() <= 8,
            "signal index fields must fit a machine word"
        );

        if let Some(holder) = self.inner.indices.borrow().signal.iter().find(|holder| {
            same_fields(&holder.fields, &leafs)
                && holder.index.mask() == mask
                && holder.index.signaled_value() == signaled_value
        }) {
            return Ok(SignalIndexHandle::new(holder.index.clone()));
        }

        let index = Rc::new(SignalIndex::new(
            Rc::downgrade(&self.inner),
            leafs[0].clone(),
            mask,
            signaled_value,
        )?);
        self.inner.back_fill(&*index);
        let field_mask = self.inner.register_indexed_fields(&leafs)?;
        self.inner.indices.borrow_mut().signal.push(IndexHolder {
            index: index.clone(),
            fields: leafs,
            mask: Cell::new(field_mask),
        });

        tracing::debug!(record_type = self.inner.layout.name(), "signal index created");
        Ok(SignalIndexHandle::new(index))
    }

    pub fn drop_hash_index(&self, handle: HashIndexHandle) {
        self.inner.assert_quiescent_for_index_change("index drop");
        assert!(
            handle.can_be_dropped(),
            "access contract violation: dropping a hash index that is still in use"
        );
        let index = handle.into_index();
        let mut indices = self.inner.indices.borrow_mut();
        let position = indices
            .hash
            .iter()
            .position(|holder| Rc::ptr_eq(&holder.index, &index))
            .expect("handle belongs to this store");
        let holder = indices.hash.remove(position);
        drop(indices);
        self.inner.unregister_indexed_fields(&holder.fields);
    }

    pub fn drop_ordered_index(&self, handle: OrderedIndexHandle) {
        self.inner.assert_quiescent_for_index_change("index drop");
        assert!(
            handle.can_be_dropped(),
            "access contract violation: dropping an ordered index that is still in use"
        );
        let index = handle.into_index();
        let mut indices = self.inner.indices.borrow_mut();
        let position = indices
            .ordered
            .iter()
            .position(|holder| Rc::ptr_eq(&holder.index, &index))
            .expect("handle belongs to this store");
        let holder = indices.ordered.remove(position);
        drop(indices);
        self.inner.unregister_indexed_fields(&holder.fields);
    }

    pub fn drop_volumetric_index(&self, handle: VolumetricIndexHandle) {
        self.inner.assert_quiescent_for_index_change("index drop");
        assert!(
            handle.can_be_dropped(),
            "access contract violation: dropping a volumetric index that is still in use"
        );
        let index = handle.into_index();
        let mut indices = self.inner.indices.borrow_mut();
        let position = indices
            .volumetric
            .iter()
            .position(|holder| Rc::ptr_eq(&holder.index, &index))
            .expect("handle belongs to this store");
        let holder = indices.volumetric.remove(position);
        drop(indices);
        self.inner.unregister_indexed_fields(&holder.fields);
    }

    pub fn drop_signal_index(&self, handle: SignalIndexHandle) {
        self.inner.assert_quiescent_for_index_change("index drop");
        assert!(
            handle.can_be_dropped(),
            "access contract violation: dropping a signal index that is still in use"
        );
        let index = handle.into_index();
        let mut indices = self.inner.indices.borrow_mut();
        let position = indices
            .signal
            .iter()
            .position(|holder| Rc::ptr_eq(&holder.index, &index))
            .expect("handle belongs to this store");
        let holder = indices.signal.remove(position);
        drop(indices);
        self.inner.unregister_indexed_fields(&holder.fields);
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if !self.inner.indices.borrow().is_empty() {
            tracing::debug!(
                record_type = self.inner.layout.name(),
                "record store dropped with indices still attached"
            );
        }
    }
}

fn same_fields(lhs: &[Field], rhs: &[Field]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(a, b)| a.is_same(b))
}

/// # Safety
///
/// `record` must point at a live pool slot of at least `size` bytes. The
/// access contract guarantees no aliasing writer exists while the slice is
/// read.
pub(crate) unsafe fn record_slice<'a>(record: *const u8, size: usize) -> &'a [u8] {
    std::slice::from_raw_parts(record, size)
}

/// # Safety
///
/// `record` must point at a live pool slot of at least `size` bytes and the
/// caller must hold the store's writer.
pub(crate) unsafe fn record_slice_mut<'a>(record: *mut u8, size: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(record, size)
}
