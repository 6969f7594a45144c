//! # Volumetric Index
//!
//! Spatial queries over records carrying an axis-aligned extent per
//! dimension (1..=3 dimensions, each a `min`/`max` field pair of one
//! numeric representation). Geometry is evaluated in `f64` regardless of
//! the stored archetype.
//!
//! ## Structure
//!
//! A flat record list with on-demand extent decoding. Insertion and
//! removal are constant-time list edits, extent changes need no
//! maintenance at all, and both query contracts reduce to a predicate
//! filter during iteration. Cursors therefore iterate the whole list and
//! test each record:
//!
//! - shape intersection: closed-interval overlap on every axis,
//! - ray intersection: slab test with `t >= 0` and
//!   `t * |direction| <= max_distance`; a zero direction component
//!   degenerates to containment on that axis.
//!
//! Deleting through an edit cursor swap-removes the list entry, so the
//! cursor re-examines the record the swap pulled into the vacated slot
//! instead of advancing past it.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::index::{decode_numeric, field_value, index_token, StoreIndex};
use crate::layout::{Field, FieldId};
use crate::store::{record_slice, record_slice_mut, ReaderGuard, StoreInner, WriterGuard};

/// One axis of a volumetric index: the record fields holding the extent's
/// minimum and maximum along that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub min_field: FieldId,
    pub max_field: FieldId,
}

pub struct VolumetricIndex {
    store: Weak<StoreInner>,
    axes: SmallVec<[(Field, Field); 3]>,
    records: RefCell<Vec<*mut u8>>,
    active_cursors: Cell<usize>,
}

impl VolumetricIndex {
    /// `bounds` is the flat `[min0, max0, min1, max1, ..]` leaf field list
    /// the store resolved from the dimension descriptors.
    pub(crate) fn new(store: Weak<StoreInner>, bounds: &[Field]) -> Self {
        let axes = bounds
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        VolumetricIndex {
            store,
            axes,
            records: RefCell::new(Vec::new()),
            active_cursors: Cell::new(0),
        }
    }

    fn store(&self) -> Rc<StoreInner> {
        self.store.upgrade().expect("index outlived its store")
    }

    fn extent(&self, record: *const u8, axis: usize) -> (f64, f64) {
        let (min_field, max_field) = &self.axes[axis];
        let min = decode_numeric(min_field, unsafe { field_value(min_field, record) });
        let max = decode_numeric(max_field, unsafe { field_value(max_field, record) });
        (min, max)
    }

    fn matches(&self, record: *const u8, query: &Query) -> bool {
        match query {
            Query::Shape { min, max } => (0..self.axes.len()).all(|axis| {
                let (record_min, record_max) = self.extent(record, axis);
                record_min <= max[axis] && min[axis] <= record_max
            }),
            Query::Ray {
                origin,
                direction,
                max_distance,
            } => {
                let mut enter = 0.0f64;
                let mut exit = f64::INFINITY;
                for axis in 0..self.axes.len() {
                    let (record_min, record_max) = self.extent(record, axis);
                    let component = direction[axis];
                    if component == 0.0 {
                        if origin[axis] < record_min || origin[axis] > record_max {
                            return false;
                        }
                        continue;
                    }
                    let mut t_near = (record_min - origin[axis]) / component;
                    let mut t_far = (record_max - origin[axis]) / component;
                    if t_near > t_far {
                        std::mem::swap(&mut t_near, &mut t_far);
                    }
                    enter = enter.max(t_near);
                    exit = exit.min(t_far);
                }

                if enter > exit {
                    return false;
                }
                let length: f64 = direction.iter().map(|component| component * component).sum::<f64>().sqrt();
                enter * length <= *max_distance
            }
        }
    }

    fn validate_axes(&self, values: &[f64], what: &str) {
        assert!(
            values.len() == self.axes.len(),
            "{what} has {} components, index has {} dimensions",
            values.len(),
            self.axes.len()
        );
    }
}

impl StoreIndex for VolumetricIndex {
    fn on_record_inserted(&self, record: *mut u8) {
        self.records.borrow_mut().push(record);
    }

    fn on_record_changed(&self, _record: *mut u8, _backup: *const u8) {
        // Membership does not depend on extent values; queries decode on
        // demand, so a moved extent needs no maintenance.
    }

    fn on_record_deleted(&self, record: *mut u8, _backup: *const u8) {
        let mut records = self.records.borrow_mut();
        let position = records
            .iter()
            .position(|entry| *entry == record)
            .expect("deleted record was indexed");
        records.swap_remove(position);
    }

    fn on_writer_closed(&self) {}
}

enum Query {
    Shape {
        min: SmallVec<[f64; 3]>,
        max: SmallVec<[f64; 3]>,
    },
    Ray {
        origin: SmallVec<[f64; 3]>,
        direction: SmallVec<[f64; 3]>,
        max_distance: f64,
    },
}

/// Reference-counted handle to a volumetric index attached to a store.
#[derive(Clone)]
pub struct VolumetricIndexHandle {
    index: Rc<VolumetricIndex>,
}

impl VolumetricIndexHandle {
    pub(crate) fn new(index: Rc<VolumetricIndex>) -> Self {
        VolumetricIndexHandle { index }
    }

    pub(crate) fn into_index(self) -> Rc<VolumetricIndex> {
        self.index
    }

    /// `(min, max)` field pairs, one per axis.
    pub fn dimensions(&self) -> impl Iterator<Item = (&Field, &Field)> {
        self.index.axes.iter().map(|(min, max)| (min, max))
    }

    pub fn is_same_index(&self, other: &VolumetricIndexHandle) -> bool {
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

    /// Read cursor over records whose extent overlaps the closed box
    /// `[min, max]` on every axis.
    pub fn read_shape_intersection(&self, min: &[f64], max: &[f64]) -> VolumetricReadCursor {
        self.index.validate_axes(min, "shape minimum");
        self.index.validate_axes(max, "shape maximum");
        self.open_read(Query::Shape {
            min: min.into(),
            max: max.into(),
        })
    }

    /// Read cursor over records whose extent is hit by the ray
    /// `origin + direction * t` within `max_distance`.
    pub fn read_ray_intersection(
        &self,
        origin: &[f64],
        direction: &[f64],
        max_distance: f64,
    ) -> VolumetricReadCursor {
        self.index.validate_axes(origin, "ray origin");
        self.index.validate_axes(direction, "ray direction");
        self.open_read(Query::Ray {
            origin: origin.into(),
            direction: direction.into(),
            max_distance,
        })
    }

    /// Edit cursor over shape-overlapping records.
    pub fn edit_shape_intersection(&self, min: &[f64], max: &[f64]) -> VolumetricEditCursor {
        self.index.validate_axes(min, "shape minimum");
        self.index.validate_axes(max, "shape maximum");
        self.open_edit(Query::Shape {
            min: min.into(),
            max: max.into(),
        })
    }

    /// Edit cursor over ray-intersected records.
    pub fn edit_ray_intersection(
        &self,
        origin: &[f64],
        direction: &[f64],
        max_distance: f64,
    ) -> VolumetricEditCursor {
        self.index.validate_axes(origin, "ray origin");
        self.index.validate_axes(direction, "ray direction");
        self.open_edit(Query::Ray {
            origin: origin.into(),
            direction: direction.into(),
            max_distance,
        })
    }

    fn open_read(&self, query: Query) -> VolumetricReadCursor {
        let guard = ReaderGuard::new(self.index.store());
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);
        let mut cursor = VolumetricReadCursor {
            index: self.index.clone(),
            _guard: guard,
            query,
            position: 0,
        };
        cursor.position = cursor.seek_match(0);
        cursor
    }

    fn open_edit(&self, query: Query) -> VolumetricEditCursor {
        let guard = WriterGuard::new(self.index.store());
        self.index.active_cursors.set(self.index.active_cursors.get() + 1);
        let mut cursor = VolumetricEditCursor {
            index: self.index.clone(),
            writer: guard,
            query,
            position: 0,
        };
        cursor.position = cursor.seek_match(0);
        if let Some(record) = cursor.current_record() {
            cursor.writer.store().begin_record_edition(record);
        }
        cursor
    }
}

/// Read cursor filtering the record list by a spatial predicate.
pub struct VolumetricReadCursor {
    index: Rc<VolumetricIndex>,
    _guard: ReaderGuard,
    query: Query,
    position: usize,
}

impl VolumetricReadCursor {
    fn seek_match(&self, from: usize) -> usize {
        let records = self.index.records.borrow();
        let mut position = from;
        while position < records.len() && !self.index.matches(records[position], &self.query) {
            position += 1;
        }
        position
    }

    fn current_record(&self) -> Option<*mut u8> {
        self.index.records.borrow().get(self.position).copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        let size = self.index.store().layout().object_size();
        self.current_record()
            .map(|record| unsafe { record_slice(record, size) })
    }

    /// Moves to the next intersecting record. Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        self.position = self.seek_match(self.position + 1);
    }
}

impl Drop for VolumetricReadCursor {
    fn drop(&mut self) {
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}

/// Edit cursor filtering the record list by a spatial predicate.
pub struct VolumetricEditCursor {
    index: Rc<VolumetricIndex>,
    writer: WriterGuard,
    query: Query,
    position: usize,
}

impl VolumetricEditCursor {
    fn seek_match(&self, from: usize) -> usize {
        let records = self.index.records.borrow();
        let mut position = from;
        while position < records.len() && !self.index.matches(records[position], &self.query) {
            position += 1;
        }
        position
    }

    fn current_record(&self) -> Option<*mut u8> {
        self.index.records.borrow().get(self.position).copied()
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

    /// Finishes the current record's edition and moves to the next
    /// intersecting record. An extent edit never repositions the entry, so
    /// iteration order is unaffected.
    pub fn advance(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: advancing a finished cursor")
        });

        let token = index_token(&*self.index);
        self.writer.store().end_record_edition(record, token);
        self.position = self.seek_match(self.position + 1);

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }

    /// Deletes the current record from the store. The swap pulls the last
    /// list entry into the vacated slot, which is examined before the
    /// cursor moves on.
    pub fn delete_current(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: deleting through a finished cursor")
        });

        self.index.records.borrow_mut().swap_remove(self.position);
        let token = index_token(&*self.index);
        self.writer.store().delete_record(record, token);
        self.position = self.seek_match(self.position);

        if let Some(next) = self.current_record() {
            self.writer.store().begin_record_edition(next);
        }
    }
}

impl Drop for VolumetricEditCursor {
    fn drop(&mut self) {
        if let Some(record) = self.current_record() {
            let token = index_token(&*self.index);
            self.writer.store().end_record_edition(record, token);
        }
        self.index
            .active_cursors
            .set(self.index.active_cursors.get() - 1);
    }
}
