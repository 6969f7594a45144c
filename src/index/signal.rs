//! # Signal Index
//!
//! Watches one field (up to 8 bytes) against a bitmask and target value:
//! a record is *signaled* when `field & mask == value & mask`. The index
//! maintains an unordered list of exactly the signaled records, so
//! "fetch all signaled" is a plain list walk with no per-record test.
//!
//! The field value is widened into a machine word for the check, which
//! makes the mask form uniform across 1/2/4/8 byte fields.
//!
//! ## Flips Under A Live Cursor
//!
//! An edit can lower the watched flag of the record under the cursor. The
//! entry is swap-removed and the record the swap pulled into the slot
//! becomes the current one — the cursor does not advance, so the set is
//! visited exhaustively even while it shrinks. Deletion behaves the same
//! way.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use eyre::{ensure, Result};

use crate::index::{field_value, index_token, StoreIndex};
use crate::layout::Field;
use crate::store::{record_slice, record_slice_mut, ReaderGuard, StoreInner, WriterGuard};

pub struct SignalIndex {
    store: Weak<StoreInner>,
    field: Field,
    mask: u64,
    signaled_value: u64,
    signaled: RefCell<Vec<*mut u8>>,
    active_cursors: Cell<usize>,
}

impl SignalIndex {
    pub(crate) fn new(
        store: Weak<StoreInner>,
        field: Field,
        mask: u64,
        signaled_value: u64,
    ) -> Result<Self> {
        ensure!(mask != 0, "signal mask must select at least one bit");
        Ok(SignalIndex {
            store,
            field,
            mask,
            signaled_value: signaled_value & mask,
            signaled: RefCell::new(Vec::new()),
            active_cursors: Cell::new(0),
        })
    }

    fn store(&self) -> Rc<StoreInner> {
        self.store.upgrade().expect("index outlived its store")
    }

    fn field_word(&self, record: *const u8) -> u64 {
        let bytes = unsafe { field_value(&self.field, record) };
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(bytes);
        u64::from_ne_bytes(word)
    }

    pub(crate) fn is_signaled(&self, record: *const u8) -> bool {
        self.field_word(record) & self.mask == self.signaled_value
    }

    fn remove(&self, record: *mut u8) {
        let mut signaled = self.signaled.borrow_mut();
        if let Some(position) = signaled.iter().position(|entry| *entry == record) {
            signaled.swap_remove(position);
        }
    }

    pub fn watched_field(&self) -> &Field {
        &self.field
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn signaled_value(&self) -> u64 {
        self.signaled_value
    }
}

impl StoreIndex for SignalIndex {
    fn on_record_inserted(&self, record: *mut u8) {
        if self.is_signaled(record) {
            self.signaled.borrow_mut().push(record);
        }
    }

    fn on_record_changed(&self, record: *mut u8, backup: *const u8) {
        let was_signaled = self.field_word(backup) & self.mask == self.signaled_value;
        let now_signaled = self.is_signaled(record);
        if was_signaled && !now_signaled {
            self.remove(record);
        } else if !was_signaled && now_signaled {
            self.signaled.borrow_mut().push(record);
        }
    }

    fn on_record_deleted(&self, record: *mut u8, backup: *const u8) {
        if self.field_word(backup) & self.mask == self.signaled_value {
            self.remove(record);
        }
    }

    fn on_writer_closed(&self) {}
}

/// Reference-counted handle to a signal index attached to a store.
#[derive(Clone)]
pub struct SignalIndexHandle {
    index: Rc<SignalIndex>,
}

impl SignalIndexHandle {
    pub(crate) fn new(index: Rc<SignalIndex>) -> Self {
        SignalIndexHandle { index }
    }

    pub(crate) fn into_index(self) -> Rc<SignalIndex> {
        self.index
    }

    pub fn watched_field(&self) -> &Field {
        self.index.watched_field()
    }

    pub fn mask(&self) -> u64 {
        self.index.mask()
    }

    pub fn signaled_value(&self) -> u64 {
        self.index.signaled_value()
    }

    pub fn is_same_index(&self, other: &SignalIndexHandle) -> bool {
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

    /// Read cursor over the currently signaled records.
    pub fn read_signaled(&self) -> SignalReadCursor {
        let guard = ReaderGuard::new(self.index.store());
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);
        SignalReadCursor {
            index: self.index.clone(),
            _guard: guard,
            position: 0,
        }
    }

    /// Edit cursor over the currently signaled records.
    pub fn edit_signaled(&self) -> SignalEditCursor {
        let guard = WriterGuard::new(self.index.store());
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);
        let cursor = SignalEditCursor {
            index: self.index.clone(),
            writer: guard,
            position: 0,
        };
        if let Some(record) = cursor.current_record() {
            cursor.writer.store().begin_record_edition(record);
        }
        cursor
    }
}

/// Read cursor over the signaled set, unordered.
pub struct SignalReadCursor {
    index: Rc<SignalIndex>,
    _guard: ReaderGuard,
    position: usize,
}

impl SignalReadCursor {
    fn current_record(&self) -> Option<*mut u8> {
        self.index.signaled.borrow().get(self.position).copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        let size = self.index.store().layout().object_size();
        self.current_record()
            .map(|record| unsafe { record_slice(record, size) })
    }

    /// Moves to the next signaled record. Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        self.position += 1;
    }
}

impl Clone for SignalReadCursor {
    fn clone(&self) -> Self {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() + 1);
        SignalReadCursor {
            index: self.index.clone(),
            _guard: self._guard.clone(),
            position: self.position,
        }
    }
}

impl Drop for SignalReadCursor {
    fn drop(&mut self) {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}

/// Edit cursor over the signaled set. Lowering the watched flag of the
/// current record swap-removes its entry and leaves the cursor in place so
/// the swapped-in record is examined next.
pub struct SignalEditCursor {
    index: Rc<SignalIndex>,
    writer: WriterGuard,
    position: usize,
}

impl SignalEditCursor {
    fn current_record(&self) -> Option<*mut u8> {
        self.index.signaled.borrow().get(self.position).copied()
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

    /// Finishes the current record's edition. If the edit left the record
    /// signaled the cursor advances; if it de-signaled it, the entry is
    /// swap-removed and the slot's new occupant becomes current.
    pub fn advance(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: advancing a finished cursor")
        });

        let token = index_token(&*self.index);
        let watched_changed = self.writer.store().end_record_edition(record, token);
        if watched_changed && !self.index.is_signaled(record) {
            self.index.signaled.borrow_mut().swap_remove(self.position);
        } else {
            self.position += 1;
        }

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }

    /// Deletes the current record from the store; the slot's new occupant
    /// becomes current.
    pub fn delete_current(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: deleting through a finished cursor")
        });

        self.index.signaled.borrow_mut().swap_remove(self.position);
        let token = index_token(&*self.index);
        self.writer.store().delete_record(record, token);

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }
}

impl Drop for SignalEditCursor {
    fn drop(&mut self) {
        if let Some(record) = self.current_record() {
            let token = index_token(&*self.index);
            let watched_changed = self.writer.store().end_record_edition(record, token);
            if watched_changed && !self.index.is_signaled(record) {
                self.index.signaled.borrow_mut().swap_remove(self.position);
            }
        }
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}
