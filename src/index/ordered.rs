//! # Ordered Index
//!
//! Range queries over one sort field. Records are kept as a flat sorted
//! pointer vector; lookups are binary searches (`partition_point`) under
//! the archetype's total order, so a range cursor is a window `[lower,
//! upper)` walked forward or backward.
//!
//! ## Edits Under A Live Cursor
//!
//! Changing the sort key of the record under an edit cursor would either
//! move it behind the cursor (lost) or ahead of it (visited twice). The
//! entry is therefore pulled out of the vector immediately and re-inserted
//! by its current bytes only when the writer closes, after every cursor is
//! gone. Deletions compact the vector at once: the cursor's window shrinks
//! and the next record slides into the vacated slot, so iteration neither
//! skips nor revisits.
//!
//! Changes arriving from another index's cursor locate the stale entry by
//! binary search on the backup value. The edited record's slot still sits
//! at its pre-edit position while its bytes already changed, so the search
//! predicate short-circuits on pointer identity instead of comparing the
//! record against itself.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::index::{compare_values, field_value, index_token, StoreIndex};
use crate::layout::Field;
use crate::store::{record_slice, record_slice_mut, ReaderGuard, StoreInner, WriterGuard};

pub struct OrderedIndex {
    store: Weak<StoreInner>,
    field: Field,
    records: RefCell<Vec<*mut u8>>,
    pending_reinsertion: RefCell<Vec<*mut u8>>,
    mass_insertion: Cell<bool>,
    active_cursors: Cell<usize>,
}

impl OrderedIndex {
    pub(crate) fn new(store: Weak<StoreInner>, field: Field) -> Self {
        OrderedIndex {
            store,
            field,
            records: RefCell::new(Vec::new()),
            pending_reinsertion: RefCell::new(Vec::new()),
            mass_insertion: Cell::new(true),
            active_cursors: Cell::new(0),
        }
    }

    fn store(&self) -> Rc<StoreInner> {
        self.store.upgrade().expect("index outlived its store")
    }

    fn value_of<'a>(&self, record: *const u8) -> &'a [u8] {
        unsafe { field_value(&self.field, record) }
    }

    /// Back-fill appends unsorted; one sort when the store finishes
    /// feeding existing records.
    pub(crate) fn finish_mass_insertion(&self) {
        let field = self.field.clone();
        self.records
            .borrow_mut()
            .sort_by(|lhs, rhs| unsafe {
                compare_values(&field, field_value(&field, *lhs), field_value(&field, *rhs))
            });
        self.mass_insertion.set(false);
    }

    pub(crate) fn for_each_record(&self, visit: &mut dyn FnMut(*mut u8)) {
        for record in self.records.borrow().iter() {
            visit(*record);
        }
    }

    fn sorted_insert(&self, record: *mut u8) {
        let value = self.value_of(record);
        let mut records = self.records.borrow_mut();
        let position = records.partition_point(|entry| {
            compare_values(&self.field, self.value_of(*entry), value) != Ordering::Greater
        });
        records.insert(position, record);
    }

    /// Finds the stale slot of `record` whose sorted position corresponds
    /// to `stale_value` while its bytes may already differ.
    fn locate_stale(&self, record: *mut u8, stale_value: &[u8]) -> Option<usize> {
        let records = self.records.borrow();
        let mut position = records.partition_point(|entry| {
            *entry != record
                && compare_values(&self.field, self.value_of(*entry), stale_value)
                    == Ordering::Less
        });

        while position < records.len() {
            let entry = records[position];
            if entry == record {
                return Some(position);
            }
            if compare_values(&self.field, self.value_of(entry), stale_value) != Ordering::Equal {
                return None;
            }
            position += 1;
        }
        None
    }

    fn remove_pending(&self, record: *mut u8) {
        let mut pending = self.pending_reinsertion.borrow_mut();
        if let Some(position) = pending.iter().position(|entry| *entry == record) {
            pending.swap_remove(position);
        }
    }

    fn lower_bound(&self, min: Option<&[u8]>) -> usize {
        match min {
            None => 0,
            Some(min) => self.records.borrow().partition_point(|entry| {
                compare_values(&self.field, self.value_of(*entry), min) == Ordering::Less
            }),
        }
    }

    fn upper_bound(&self, max: Option<&[u8]>) -> usize {
        match max {
            None => self.records.borrow().len(),
            Some(max) => self.records.borrow().partition_point(|entry| {
                compare_values(&self.field, self.value_of(*entry), max) != Ordering::Greater
            }),
        }
    }

    fn validate_bound(&self, bound: Option<&[u8]>) {
        if let Some(bound) = bound {
            assert!(
                bound.len() == self.field.size(),
                "range bound for field '{}' has {} bytes, field has {}",
                self.field.name(),
                bound.len(),
                self.field.size()
            );
        }
    }
}

impl StoreIndex for OrderedIndex {
    fn on_record_inserted(&self, record: *mut u8) {
        if self.mass_insertion.get() {
            self.records.borrow_mut().push(record);
        } else {
            self.sorted_insert(record);
        }
    }

    fn on_record_changed(&self, record: *mut u8, backup: *const u8) {
        let stale_value = unsafe { field_value(&self.field, backup) };
        match self.locate_stale(record, stale_value) {
            Some(position) => {
                self.records.borrow_mut().remove(position);
                self.pending_reinsertion.borrow_mut().push(record);
            }
            // Already extracted earlier in this writer session.
            None => debug_assert!(self
                .pending_reinsertion
                .borrow()
                .contains(&record)),
        }
    }

    fn on_record_deleted(&self, record: *mut u8, backup: *const u8) {
        let stale_value = unsafe { field_value(&self.field, backup) };
        match self.locate_stale(record, stale_value) {
            Some(position) => {
                self.records.borrow_mut().remove(position);
            }
            None => self.remove_pending(record),
        }
    }

    fn on_writer_closed(&self) {
        let pending = std::mem::take(&mut *self.pending_reinsertion.borrow_mut());
        for record in pending {
            self.sorted_insert(record);
        }
    }
}

/// Reference-counted handle to an ordered index attached to a store.
#[derive(Clone)]
pub struct OrderedIndexHandle {
    index: Rc<OrderedIndex>,
}

impl OrderedIndexHandle {
    pub(crate) fn new(index: Rc<OrderedIndex>) -> Self {
        OrderedIndexHandle { index }
    }

    pub(crate) fn into_index(self) -> Rc<OrderedIndex> {
        self.index
    }

    pub fn key_field(&self) -> &Field {
        &self.index.field
    }

    pub fn is_same_index(&self, other: &OrderedIndexHandle) -> bool {
        Rc::ptr_eq(&self.index, &other.index)
    }

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

    /// Read cursor over `[min, max]` (closed interval, `None` =
    /// unbounded), smallest value first.
    pub fn read_ascending_range(
        &self,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
    ) -> OrderedReadCursor {
        self.index.validate_bound(min);
        self.index.validate_bound(max);
        let guard = ReaderGuard::new(self.index.store());
        let lower = self.index.lower_bound(min);
        let upper = self.index.upper_bound(max);
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);

        OrderedReadCursor {
            index: self.index.clone(),
            _guard: guard,
            position: lower.min(upper),
            end: upper,
            descending: false,
            lower: lower.min(upper),
        }
    }

    /// Read cursor over `[min, max]`, greatest value first.
    pub fn read_descending_range(
        &self,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
    ) -> OrderedReadCursor {
        self.index.validate_bound(min);
        self.index.validate_bound(max);
        let guard = ReaderGuard::new(self.index.store());
        let lower = self.index.lower_bound(min);
        let upper = self.index.upper_bound(max);
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);

        OrderedReadCursor {
            index: self.index.clone(),
            _guard: guard,
            position: upper.max(lower),
            end: upper,
            descending: true,
            lower: lower.min(upper),
        }
    }

    /// Edit cursor over `[min, max]`, smallest value first.
    pub fn edit_ascending_range(
        &self,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
    ) -> OrderedEditCursor {
        self.open_edit(min, max, false)
    }

    /// Edit cursor over `[min, max]`, greatest value first.
    pub fn edit_descending_range(
        &self,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
    ) -> OrderedEditCursor {
        self.open_edit(min, max, true)
    }

    fn open_edit(&self, min: Option<&[u8]>, max: Option<&[u8]>, descending: bool) -> OrderedEditCursor {
        self.index.validate_bound(min);
        self.index.validate_bound(max);
        let guard = WriterGuard::new(self.index.store());
        let lower = self.index.lower_bound(min);
        let upper = self.index.upper_bound(max);
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);

        let cursor = OrderedEditCursor {
            index: self.index.clone(),
            writer: guard,
            position: if descending { upper.max(lower) } else { lower.min(upper) },
            end: upper,
            lower: lower.min(upper),
            descending,
        };
        if let Some(record) = cursor.current_record() {
            cursor.writer.store().begin_record_edition(record);
        }
        cursor
    }
}

/// Read cursor over a sorted window. Ascending cursors hold the index of
/// the current entry; descending cursors hold one past it, counting down.
pub struct OrderedReadCursor {
    index: Rc<OrderedIndex>,
    _guard: ReaderGuard,
    position: usize,
    end: usize,
    lower: usize,
    descending: bool,
}

impl OrderedReadCursor {
    fn current_record(&self) -> Option<*mut u8> {
        let records = self.index.records.borrow();
        if self.descending {
            (self.position > self.lower).then(|| records[self.position - 1])
        } else {
            (self.position < self.end).then(|| records[self.position])
        }
    }

    pub fn current(&self) -> Option<&[u8]> {
        let size = self.index.store().layout().object_size();
        self.current_record()
            .map(|record| unsafe { record_slice(record, size) })
    }

    /// Moves to the next record in iteration order. Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        if self.descending {
            self.position -= 1;
        } else {
            self.position += 1;
        }
    }
}

impl Clone for OrderedReadCursor {
    fn clone(&self) -> Self {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() + 1);
        OrderedReadCursor {
            index: self.index.clone(),
            _guard: self._guard.clone(),
            position: self.position,
            end: self.end,
            lower: self.lower,
            descending: self.descending,
        }
    }
}

impl Drop for OrderedReadCursor {
    fn drop(&mut self) {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}

/// Edit cursor over a sorted window. The record under the cursor is in an
/// open edition; sort-key changes defer re-insertion to writer close so
/// the cursor never revisits a repositioned record.
pub struct OrderedEditCursor {
    index: Rc<OrderedIndex>,
    writer: WriterGuard,
    position: usize,
    end: usize,
    lower: usize,
    descending: bool,
}

impl OrderedEditCursor {
    fn current_record(&self) -> Option<*mut u8> {
        let records = self.index.records.borrow();
        if self.descending {
            (self.position > self.lower).then(|| records[self.position - 1])
        } else {
            (self.position < self.end).then(|| records[self.position])
        }
    }

    fn current_slot(&self) -> usize {
        if self.descending {
            self.position - 1
        } else {
            self.position
        }
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

    /// Pulls the current entry out of the vector and shrinks the window.
    fn extract_current(&mut self) -> *mut u8 {
        let slot = self.current_slot();
        let record = self.index.records.borrow_mut().remove(slot);
        self.end -= 1;
        if self.descending {
            self.position -= 1;
        }
        record
    }

    /// Finishes the current record's edition and moves on. A sort-key
    /// change extracts the entry, so the window slides the next record
    /// under the cursor without advancing.
    pub fn advance(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: advancing a finished cursor")
        });

        let token = index_token(&*self.index);
        let key_changed = self.writer.store().end_record_edition(record, token);
        if key_changed {
            let extracted = self.extract_current();
            self.index.pending_reinsertion.borrow_mut().push(extracted);
        } else if self.descending {
            self.position -= 1;
        } else {
            self.position += 1;
        }

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }

    /// Deletes the current record from the store (cascading to every other
    /// index) and lands on the next record in iteration order.
    pub fn delete_current(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: deleting through a finished cursor"
        );
        let record = self.extract_current();
        let token = index_token(&*self.index);
        self.writer.store().delete_record(record, token);

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }
}

impl Drop for OrderedEditCursor {
    fn drop(&mut self) {
        if let Some(record) = self.current_record() {
            let token = index_token(&*self.index);
            let key_changed = self.writer.store().end_record_edition(record, token);
            if key_changed {
                let extracted = self.extract_current();
                self.index.pending_reinsertion.borrow_mut().push(extracted);
            }
        }
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}
