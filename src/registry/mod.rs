//! # Registry
//!
//! The façade most callers live behind: one object owning every record
//! type's container and handing out prepared queries. Containers are
//! created lazily on the first query against a type and torn down when the
//! last thing referencing them is released, so holding a query is what
//! keeps data alive.
//!
//! ## Container Families
//!
//! | Family | Storage | Queries |
//! |------------|----------------------------------|---------------------------------------------|
//! | singleton | one fixed zeroed slot | fetch/modify singleton |
//! | short-term | append-only pool, insertion order| insert, fetch/modify sequence, clear |
//! | long-term | `RecordStore` + indices | insert, value, ranges, shapes/rays, signals |
//!
//! Index-backed queries with the same parameters on the same type share
//! one index instance; the store dedupes by parameter equality.
//!
//! ## Event Wiring
//!
//! Event bindings are registered against a record type *before* its
//! long-term container exists. Container creation bakes them: each trivial
//! trigger gets a sink into the event type's short-term container, and all
//! on-change triggers fold into one `ChangeTracker`. Long-term modify
//! cursors bracket every record with the tracker (enter = snapshot, exit =
//! diff and fire); deletion fires on-remove triggers with the record's
//! bytes before the store cascade; insertion fires on-add triggers once
//! the record is committed to every index.

use std::cell::{RefCell, UnsafeCell};
use std::ops::Deref;
use std::rc::{Rc, Weak};

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::events::{ChangeTracker, OnChangeEventTrigger, TrivialEventTrigger};
use crate::index::hash::{HashEditCursor, HashIndexHandle, HashReadCursor};
use crate::index::ordered::{OrderedEditCursor, OrderedIndexHandle, OrderedReadCursor};
use crate::index::signal::{SignalEditCursor, SignalIndexHandle, SignalReadCursor};
use crate::index::volumetric::{
    Dimension, VolumetricEditCursor, VolumetricIndexHandle, VolumetricReadCursor,
};
use crate::layout::{FieldId, RecordLayout};
use crate::store::pool::RecordPool;
use crate::store::{
    record_slice, record_slice_mut, AccessCounters, Allocator, RecordStore,
};

/// Uniform surface of the four index edit cursors, so one modify wrapper
/// can bracket any of them with change tracking and event firing.
pub trait EditCursor {
    fn current(&self) -> Option<&[u8]>;
    fn current_mut(&mut self) -> Option<&mut [u8]>;
    fn advance(&mut self);
    fn delete_current(&mut self);
}

macro_rules! forward_edit_cursor {
    ($cursor:ty) => {
        impl EditCursor for $cursor {
            fn current(&self) -> Option<&[u8]> {
                <$cursor>::current(self)
            }
            fn current_mut(&mut self) -> Option<&mut [u8]> {
                <$cursor>::current_mut(self)
            }
            fn advance(&mut self) {
                <$cursor>::advance(self)
            }
            fn delete_current(&mut self) {
                <$cursor>::delete_current(self)
            }
        }
    };
}

forward_edit_cursor!(HashEditCursor);
forward_edit_cursor!(OrderedEditCursor);
forward_edit_cursor!(VolumetricEditCursor);
forward_edit_cursor!(SignalEditCursor);

#[derive(Default)]
struct EventProfile {
    on_add: Vec<TrivialEventTrigger>,
    on_remove: Vec<TrivialEventTrigger>,
    on_change: Vec<OnChangeEventTrigger>,
}

struct RegistryInner {
    name: Rc<str>,
    singletons: RefCell<HashMap<usize, Rc<SingletonContainer>>>,
    short_term: RefCell<HashMap<usize, Rc<ShortTermContainer>>>,
    long_term: RefCell<HashMap<usize, Rc<LongTermContainer>>>,
    events: RefCell<HashMap<usize, EventProfile>>,
}

trait ContainerKind: Sized {
    const FAMILY: &'static str;
    fn map(registry: &RegistryInner) -> &RefCell<HashMap<usize, Rc<Self>>>;
    fn layout(&self) -> &RecordLayout;
}

/// Shared container reference. Dropping the second-to-last one (the map
/// itself holds the last) removes the container from its registry, which
/// is the whole garbage collection story: no cycles, no sweeps.
struct ContainerRef<T: ContainerKind> {
    container: Rc<T>,
    registry: Weak<RegistryInner>,
}

impl<T: ContainerKind> ContainerRef<T> {
    fn new(container: Rc<T>, registry: &Rc<RegistryInner>) -> Self {
        ContainerRef {
            container,
            registry: Rc::downgrade(registry),
        }
    }
}

impl<T: ContainerKind> Deref for ContainerRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.container
    }
}

impl<T: ContainerKind> Clone for ContainerRef<T> {
    fn clone(&self) -> Self {
        ContainerRef {
            container: self.container.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T: ContainerKind> Drop for ContainerRef<T> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // This reference plus the map entry: nobody else is left.
        if Rc::strong_count(&self.container) == 2 {
            T::map(&registry)
                .borrow_mut()
                .remove(&self.container.layout().identity());
            tracing::debug!(
                registry = &*registry.name,
                record_type = self.container.layout().name(),
                family = T::FAMILY,
                "container released"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Singleton containers
// ---------------------------------------------------------------------------

struct SingletonContainer {
    layout: RecordLayout,
    slot: UnsafeCell<Box<[u8]>>,
    counters: AccessCounters,
}

impl ContainerKind for SingletonContainer {
    const FAMILY: &'static str = "singleton";
    fn map(registry: &RegistryInner) -> &RefCell<HashMap<usize, Rc<Self>>> {
        &registry.singletons
    }
    fn layout(&self) -> &RecordLayout {
        &self.layout
    }
}

impl SingletonContainer {
    // The read path must not materialize a unique reference: several read
    // accesses may be live at once.
    fn slot_ptr(&self) -> *const u8 {
        unsafe { (*self.slot.get()).as_ptr() }
    }

    fn slot_ptr_mut(&self) -> *mut u8 {
        // Counter discipline guarantees no aliasing reader or writer.
        unsafe { (*self.slot.get()).as_mut_ptr() }
    }
}

/// Scoped read access to the singleton instance.
pub struct SingletonReadAccess {
    container: ContainerRef<SingletonContainer>,
}

impl SingletonReadAccess {
    pub fn record(&self) -> &[u8] {
        unsafe { record_slice(self.container.slot_ptr(), self.container.layout.object_size()) }
    }
}

impl Drop for SingletonReadAccess {
    fn drop(&mut self) {
        self.container.counters.exit_reader();
    }
}

/// Scoped exclusive write access to the singleton instance.
pub struct SingletonWriteAccess {
    container: ContainerRef<SingletonContainer>,
}

impl SingletonWriteAccess {
    pub fn record(&self) -> &[u8] {
        unsafe { record_slice(self.container.slot_ptr(), self.container.layout.object_size()) }
    }

    pub fn record_mut(&mut self) -> &mut [u8] {
        unsafe {
            record_slice_mut(self.container.slot_ptr_mut(), self.container.layout.object_size())
        }
    }
}

impl Drop for SingletonWriteAccess {
    fn drop(&mut self) {
        self.container.counters.exit_writer();
    }
}

/// Prepared read access to a singleton type.
pub struct FetchSingletonQuery {
    container: ContainerRef<SingletonContainer>,
}

impl FetchSingletonQuery {
    pub fn access(&self) -> SingletonReadAccess {
        self.container.counters.enter_reader();
        SingletonReadAccess {
            container: self.container.clone(),
        }
    }
}

/// Prepared write access to a singleton type.
pub struct ModifySingletonQuery {
    container: ContainerRef<SingletonContainer>,
}

impl ModifySingletonQuery {
    pub fn access(&self) -> SingletonWriteAccess {
        self.container.counters.enter_writer();
        SingletonWriteAccess {
            container: self.container.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Short-term containers
// ---------------------------------------------------------------------------

struct ShortTermContainer {
    layout: RecordLayout,
    pool: RefCell<RecordPool>,
    order: RefCell<Vec<*mut u8>>,
    counters: AccessCounters,
}

impl ContainerKind for ShortTermContainer {
    const FAMILY: &'static str = "short-term";
    fn map(registry: &RegistryInner) -> &RefCell<HashMap<usize, Rc<Self>>> {
        &registry.short_term
    }
    fn layout(&self) -> &RecordLayout {
        &self.layout
    }
}

impl ShortTermContainer {
    /// One-shot insertion used by event firing: the event producer holds
    /// no lasting writer on the event store.
    fn insert_with(&self, fill: &mut dyn FnMut(&mut [u8])) {
        self.counters.enter_writer();
        let slot = self.pool.borrow_mut().acquire();
        self.order.borrow_mut().push(slot);
        fill(unsafe { record_slice_mut(slot, self.layout.object_size()) });
        self.counters.exit_writer();
    }
}

/// Prepared append-only insertion into a short-term type.
pub struct InsertShortTermQuery {
    container: ContainerRef<ShortTermContainer>,
}

impl InsertShortTermQuery {
    pub fn execute(&self) -> ShortTermInserter {
        self.container.counters.enter_writer();
        ShortTermInserter {
            container: self.container.clone(),
        }
    }
}

/// Writer-scoped inserter appending zeroed records.
pub struct ShortTermInserter {
    container: ContainerRef<ShortTermContainer>,
}

impl ShortTermInserter {
    pub fn insert(&mut self) -> &mut [u8] {
        let slot = self.container.pool.borrow_mut().acquire();
        self.container.order.borrow_mut().push(slot);
        unsafe { record_slice_mut(slot, self.container.layout.object_size()) }
    }
}

impl Drop for ShortTermInserter {
    fn drop(&mut self) {
        self.container.counters.exit_writer();
    }
}

/// Prepared forward iteration over a short-term type.
pub struct FetchSequenceQuery {
    container: ContainerRef<ShortTermContainer>,
}

impl FetchSequenceQuery {
    pub fn execute(&self) -> SequenceReadCursor {
        self.container.counters.enter_reader();
        SequenceReadCursor {
            container: self.container.clone(),
            position: 0,
        }
    }
}

/// Read cursor in insertion order.
pub struct SequenceReadCursor {
    container: ContainerRef<ShortTermContainer>,
    position: usize,
}

impl SequenceReadCursor {
    fn current_record(&self) -> Option<*mut u8> {
        self.container.order.borrow().get(self.position).copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        self.current_record()
            .map(|record| unsafe { record_slice(record, self.container.layout.object_size()) })
    }

    /// Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        self.position += 1;
    }
}

impl Clone for SequenceReadCursor {
    fn clone(&self) -> Self {
        self.container.counters.enter_reader();
        SequenceReadCursor {
            container: self.container.clone(),
            position: self.position,
        }
    }
}

impl Drop for SequenceReadCursor {
    fn drop(&mut self) {
        self.container.counters.exit_reader();
    }
}

/// Prepared mutation pass over a short-term type.
pub struct ModifySequenceQuery {
    container: ContainerRef<ShortTermContainer>,
}

impl ModifySequenceQuery {
    pub fn execute(&self) -> SequenceEditCursor {
        self.container.counters.enter_writer();
        SequenceEditCursor {
            container: self.container.clone(),
            position: 0,
        }
    }

    /// Drops every record at once. The pool is rebuilt, which returns its
    /// chunks instead of free-listing each slot.
    pub fn clear(&self) {
        self.container.counters.enter_writer();
        self.container.order.borrow_mut().clear();
        *self.container.pool.borrow_mut() =
            RecordPool::new(self.container.layout.object_size());
        self.container.counters.exit_writer();
    }
}

/// Edit cursor in insertion order with delete-and-continue.
pub struct SequenceEditCursor {
    container: ContainerRef<ShortTermContainer>,
    position: usize,
}

impl SequenceEditCursor {
    fn current_record(&self) -> Option<*mut u8> {
        self.container.order.borrow().get(self.position).copied()
    }

    pub fn current(&self) -> Option<&[u8]> {
        self.current_record()
            .map(|record| unsafe { record_slice(record, self.container.layout.object_size()) })
    }

    pub fn current_mut(&mut self) -> Option<&mut [u8]> {
        self.current_record()
            .map(|record| unsafe { record_slice_mut(record, self.container.layout.object_size()) })
    }

    /// Panics past the end.
    pub fn advance(&mut self) {
        assert!(
            self.current_record().is_some(),
            "access contract violation: advancing a finished cursor"
        );
        self.position += 1;
    }

    /// Deletes the current record; the next one slides under the cursor.
    pub fn delete_current(&mut self) {
        let record = self.current_record().unwrap_or_else(|| {
            panic!("access contract violation: deleting through a finished cursor")
        });
        self.container.order.borrow_mut().remove(self.position);
        self.container.pool.borrow_mut().release(record);
    }
}

impl Drop for SequenceEditCursor {
    fn drop(&mut self) {
        self.container.counters.exit_writer();
    }
}

// ---------------------------------------------------------------------------
// Long-term containers
// ---------------------------------------------------------------------------

struct TriggerInstance {
    trigger: TrivialEventTrigger,
    sink: ContainerRef<ShortTermContainer>,
}

impl TriggerInstance {
    fn fire(&self, record: &[u8]) {
        self.sink.insert_with(&mut |event_out| {
            self.trigger.apply(record, event_out);
        });
    }
}

struct LongTermContainer {
    layout: RecordLayout,
    store: RecordStore,
    on_add: Vec<TriggerInstance>,
    on_remove: Vec<TriggerInstance>,
    tracker: Option<ChangeTracker>,
    change_sinks: HashMap<usize, ContainerRef<ShortTermContainer>>,
}

impl ContainerKind for LongTermContainer {
    const FAMILY: &'static str = "long-term";
    fn map(registry: &RegistryInner) -> &RefCell<HashMap<usize, Rc<Self>>> {
        &registry.long_term
    }
    fn layout(&self) -> &RecordLayout {
        &self.layout
    }
}

impl LongTermContainer {
    fn fire_on_add(&self, record: &[u8]) {
        for instance in &self.on_add {
            instance.fire(record);
        }
    }

    fn fire_on_remove(&self, record: &[u8]) {
        for instance in &self.on_remove {
            instance.fire(record);
        }
    }

    fn enter_record(&self, record: &[u8]) {
        if let Some(tracker) = &self.tracker {
            tracker.begin_edition(record);
        }
    }

    fn exit_record(&self, record: &[u8]) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let changed = tracker.end_edition(record);
        tracker.for_each_hit(changed, &mut |trigger, snapshot| {
            let sink = self
                .change_sinks
                .get(&trigger.event_layout().identity())
                .expect("sink baked for every on-change event type");
            sink.insert_with(&mut |event_out| {
                trigger.apply_initial(snapshot, event_out);
                trigger.apply_changed(record, event_out);
            });
        });
    }
}

/// Prepared insertion transaction opener for a long-term type.
pub struct InsertLongTermQuery {
    container: ContainerRef<LongTermContainer>,
}

impl InsertLongTermQuery {
    pub fn execute(&self) -> LongTermInserter {
        LongTermInserter {
            allocator: self.container.store.allocate(),
            container: self.container.clone(),
        }
    }
}

/// Writer-scoped inserter. Each record is committed to every index (and
/// on-add events fire) when the next slot is requested or the inserter
/// drops.
pub struct LongTermInserter {
    container: ContainerRef<LongTermContainer>,
    allocator: Allocator,
}

impl LongTermInserter {
    fn commit_and_fire(&mut self) {
        let committed = self.allocator.pending();
        self.allocator.commit_pending();
        if !committed.is_null() {
            let record =
                unsafe { record_slice(committed, self.container.layout.object_size()) };
            self.container.fire_on_add(record);
        }
    }

    pub fn insert(&mut self) -> &mut [u8] {
        self.commit_and_fire();
        self.allocator.allocate()
    }
}

impl Drop for LongTermInserter {
    fn drop(&mut self) {
        self.commit_and_fire();
    }
}

/// Modify cursor wrapper: any index edit cursor bracketed with change
/// tracking and event firing.
pub struct ModifyCursor<C: EditCursor> {
    inner: C,
    container: ContainerRef<LongTermContainer>,
}

impl<C: EditCursor> ModifyCursor<C> {
    fn new(inner: C, container: ContainerRef<LongTermContainer>) -> Self {
        if let Some(record) = inner.current() {
            container.enter_record(record);
        }
        ModifyCursor { inner, container }
    }

    pub fn current(&self) -> Option<&[u8]> {
        self.inner.current()
    }

    pub fn current_mut(&mut self) -> Option<&mut [u8]> {
        self.inner.current_mut()
    }

    /// Fires any on-change events for the current record, then moves on.
    pub fn advance(&mut self) {
        if let Some(record) = self.inner.current() {
            self.container.exit_record(record);
        }
        self.inner.advance();
        if let Some(record) = self.inner.current() {
            self.container.enter_record(record);
        }
    }

    /// Fires on-remove events with the record's current bytes, then
    /// deletes it store-wide.
    pub fn delete_current(&mut self) {
        if let Some(record) = self.inner.current() {
            self.container.fire_on_remove(record);
        }
        self.inner.delete_current();
        if let Some(record) = self.inner.current() {
            self.container.enter_record(record);
        }
    }
}

impl<C: EditCursor> Drop for ModifyCursor<C> {
    fn drop(&mut self) {
        if let Some(record) = self.inner.current() {
            self.container.exit_record(record);
        }
    }
}

/// Prepared point lookup on a long-term type.
pub struct FetchValueQuery {
    _container: ContainerRef<LongTermContainer>,
    index: HashIndexHandle,
}

impl FetchValueQuery {
    pub fn execute(&self, key: &[&[u8]]) -> HashReadCursor {
        self.index.lookup_to_read(key)
    }
}

/// Prepared point mutation on a long-term type.
pub struct ModifyValueQuery {
    container: ContainerRef<LongTermContainer>,
    index: HashIndexHandle,
}

impl ModifyValueQuery {
    pub fn execute(&self, key: &[&[u8]]) -> ModifyCursor<HashEditCursor> {
        ModifyCursor::new(self.index.lookup_to_edit(key), self.container.clone())
    }
}

/// Prepared ascending range scan on a long-term type.
pub struct FetchAscendingRangeQuery {
    _container: ContainerRef<LongTermContainer>,
    index: OrderedIndexHandle,
}

impl FetchAscendingRangeQuery {
    pub fn execute(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> OrderedReadCursor {
        self.index.read_ascending_range(min, max)
    }
}

/// Prepared ascending range mutation on a long-term type.
pub struct ModifyAscendingRangeQuery {
    container: ContainerRef<LongTermContainer>,
    index: OrderedIndexHandle,
}

impl ModifyAscendingRangeQuery {
    pub fn execute(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> ModifyCursor<OrderedEditCursor> {
        ModifyCursor::new(
            self.index.edit_ascending_range(min, max),
            self.container.clone(),
        )
    }
}

/// Prepared descending range scan on a long-term type.
pub struct FetchDescendingRangeQuery {
    _container: ContainerRef<LongTermContainer>,
    index: OrderedIndexHandle,
}

impl FetchDescendingRangeQuery {
    pub fn execute(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> OrderedReadCursor {
        self.index.read_descending_range(min, max)
    }
}

/// Prepared descending range mutation on a long-term type.
pub struct ModifyDescendingRangeQuery {
    container: ContainerRef<LongTermContainer>,
    index: OrderedIndexHandle,
}

impl ModifyDescendingRangeQuery {
    pub fn execute(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> ModifyCursor<OrderedEditCursor> {
        ModifyCursor::new(
            self.index.edit_descending_range(min, max),
            self.container.clone(),
        )
    }
}

/// Prepared shape intersection scan on a long-term type.
pub struct FetchShapeIntersectionQuery {
    _container: ContainerRef<LongTermContainer>,
    index: VolumetricIndexHandle,
}

impl FetchShapeIntersectionQuery {
    pub fn execute(&self, min: &[f64], max: &[f64]) -> VolumetricReadCursor {
        self.index.read_shape_intersection(min, max)
    }
}

/// Prepared shape intersection mutation on a long-term type.
pub struct ModifyShapeIntersectionQuery {
    container: ContainerRef<LongTermContainer>,
    index: VolumetricIndexHandle,
}

impl ModifyShapeIntersectionQuery {
    pub fn execute(&self, min: &[f64], max: &[f64]) -> ModifyCursor<VolumetricEditCursor> {
        ModifyCursor::new(
            self.index.edit_shape_intersection(min, max),
            self.container.clone(),
        )
    }
}

/// Prepared ray intersection scan on a long-term type.
pub struct FetchRayIntersectionQuery {
    _container: ContainerRef<LongTermContainer>,
    index: VolumetricIndexHandle,
}

impl FetchRayIntersectionQuery {
    pub fn execute(
        &self,
        origin: &[f64],
        direction: &[f64],
        max_distance: f64,
    ) -> VolumetricReadCursor {
        self.index.read_ray_intersection(origin, direction, max_distance)
    }
}

/// Prepared ray intersection mutation on a long-term type.
pub struct ModifyRayIntersectionQuery {
    container: ContainerRef<LongTermContainer>,
    index: VolumetricIndexHandle,
}

impl ModifyRayIntersectionQuery {
    pub fn execute(
        &self,
        origin: &[f64],
        direction: &[f64],
        max_distance: f64,
    ) -> ModifyCursor<VolumetricEditCursor> {
        ModifyCursor::new(
            self.index.edit_ray_intersection(origin, direction, max_distance),
            self.container.clone(),
        )
    }
}

/// Prepared scan over currently signaled records of a long-term type.
pub struct FetchSignaledQuery {
    _container: ContainerRef<LongTermContainer>,
    index: SignalIndexHandle,
}

impl FetchSignaledQuery {
    pub fn execute(&self) -> SignalReadCursor {
        self.index.read_signaled()
    }
}

/// Prepared mutation pass over currently signaled records.
pub struct ModifySignaledQuery {
    container: ContainerRef<LongTermContainer>,
    index: SignalIndexHandle,
}

impl ModifySignaledQuery {
    pub fn execute(&self) -> ModifyCursor<SignalEditCursor> {
        ModifyCursor::new(self.index.edit_signaled(), self.container.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owner of all containers; the entry point for prepared queries.
pub struct Registry {
    inner: Rc<RegistryInner>,
}

impl Registry {
    pub fn new(name: &str) -> Self {
        tracing::debug!(registry = name, "registry created");
        Registry {
            inner: Rc::new(RegistryInner {
                name: name.into(),
                singletons: RefCell::new(HashMap::new()),
                short_term: RefCell::new(HashMap::new()),
                long_term: RefCell::new(HashMap::new()),
                events: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn singleton_container(&self, layout: &RecordLayout) -> ContainerRef<SingletonContainer> {
        let mut map = self.inner.singletons.borrow_mut();
        let container = map
            .entry(layout.identity())
            .or_insert_with(|| {
                tracing::debug!(
                    registry = &*self.inner.name,
                    record_type = layout.name(),
                    "singleton container created"
                );
                Rc::new(SingletonContainer {
                    layout: layout.clone(),
                    slot: UnsafeCell::new(vec![0u8; layout.object_size()].into_boxed_slice()),
                    counters: AccessCounters::default(),
                })
            })
            .clone();
        ContainerRef::new(container, &self.inner)
    }

    fn short_term_container(&self, layout: &RecordLayout) -> ContainerRef<ShortTermContainer> {
        let mut map = self.inner.short_term.borrow_mut();
        let container = map
            .entry(layout.identity())
            .or_insert_with(|| {
                tracing::debug!(
                    registry = &*self.inner.name,
                    record_type = layout.name(),
                    "short-term container created"
                );
                Rc::new(ShortTermContainer {
                    layout: layout.clone(),
                    pool: RefCell::new(RecordPool::new(layout.object_size())),
                    order: RefCell::new(Vec::new()),
                    counters: AccessCounters::default(),
                })
            })
            .clone();
        ContainerRef::new(container, &self.inner)
    }

    fn long_term_container(&self, layout: &RecordLayout) -> ContainerRef<LongTermContainer> {
        if let Some(container) = self.inner.long_term.borrow().get(&layout.identity()) {
            return ContainerRef::new(container.clone(), &self.inner);
        }

        let events = self.inner.events.borrow();
        let profile = events.get(&layout.identity());
        let bake = |triggers: &[TrivialEventTrigger]| -> Vec<TriggerInstance> {
            triggers
                .iter()
                .map(|trigger| TriggerInstance {
                    trigger: trigger.clone(),
                    sink: self.short_term_container(trigger.event_layout()),
                })
                .collect()
        };

        let (on_add, on_remove, tracker, change_sinks) = match profile {
            None => (Vec::new(), Vec::new(), None, HashMap::new()),
            Some(profile) => {
                let tracker = if profile.on_change.is_empty() {
                    None
                } else {
                    Some(
                        ChangeTracker::new(profile.on_change.clone())
                            .expect("event profile validated at registration"),
                    )
                };
                let mut sinks = HashMap::new();
                for trigger in &profile.on_change {
                    let event = trigger.event_layout();
                    sinks
                        .entry(event.identity())
                        .or_insert_with(|| self.short_term_container(event));
                }
                (bake(&profile.on_add), bake(&profile.on_remove), tracker, sinks)
            }
        };
        drop(events);

        tracing::debug!(
            registry = &*self.inner.name,
            record_type = layout.name(),
            "long-term container created"
        );
        let container = Rc::new(LongTermContainer {
            layout: layout.clone(),
            store: RecordStore::new(layout.clone()),
            on_add,
            on_remove,
            tracker,
            change_sinks,
        });
        self.inner
            .long_term
            .borrow_mut()
            .insert(layout.identity(), container.clone());
        ContainerRef::new(container, &self.inner)
    }

    pub fn fetch_singleton(&self, layout: &RecordLayout) -> FetchSingletonQuery {
        FetchSingletonQuery {
            container: self.singleton_container(layout),
        }
    }

    pub fn modify_singleton(&self, layout: &RecordLayout) -> ModifySingletonQuery {
        ModifySingletonQuery {
            container: self.singleton_container(layout),
        }
    }

    pub fn insert_short_term(&self, layout: &RecordLayout) -> InsertShortTermQuery {
        InsertShortTermQuery {
            container: self.short_term_container(layout),
        }
    }

    pub fn fetch_sequence(&self, layout: &RecordLayout) -> FetchSequenceQuery {
        FetchSequenceQuery {
            container: self.short_term_container(layout),
        }
    }

    pub fn modify_sequence(&self, layout: &RecordLayout) -> ModifySequenceQuery {
        ModifySequenceQuery {
            container: self.short_term_container(layout),
        }
    }

    pub fn insert_long_term(&self, layout: &RecordLayout) -> InsertLongTermQuery {
        InsertLongTermQuery {
            container: self.long_term_container(layout),
        }
    }

    pub fn fetch_value(
        &self,
        layout: &RecordLayout,
        key_fields: &[FieldId],
    ) -> Result<FetchValueQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_hash_index(key_fields)?;
        Ok(FetchValueQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_value(
        &self,
        layout: &RecordLayout,
        key_fields: &[FieldId],
    ) -> Result<ModifyValueQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_hash_index(key_fields)?;
        Ok(ModifyValueQuery { container, index })
    }

    pub fn fetch_ascending_range(
        &self,
        layout: &RecordLayout,
        field: FieldId,
    ) -> Result<FetchAscendingRangeQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_ordered_index(field)?;
        Ok(FetchAscendingRangeQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_ascending_range(
        &self,
        layout: &RecordLayout,
        field: FieldId,
    ) -> Result<ModifyAscendingRangeQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_ordered_index(field)?;
        Ok(ModifyAscendingRangeQuery { container, index })
    }

    pub fn fetch_descending_range(
        &self,
        layout: &RecordLayout,
        field: FieldId,
    ) -> Result<FetchDescendingRangeQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_ordered_index(field)?;
        Ok(FetchDescendingRangeQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_descending_range(
        &self,
        layout: &RecordLayout,
        field: FieldId,
    ) -> Result<ModifyDescendingRangeQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_ordered_index(field)?;
        Ok(ModifyDescendingRangeQuery { container, index })
    }

    pub fn fetch_shape_intersection(
        &self,
        layout: &RecordLayout,
        dimensions: &[Dimension],
    ) -> Result<FetchShapeIntersectionQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_volumetric_index(dimensions)?;
        Ok(FetchShapeIntersectionQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_shape_intersection(
        &self,
        layout: &RecordLayout,
        dimensions: &[Dimension],
    ) -> Result<ModifyShapeIntersectionQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_volumetric_index(dimensions)?;
        Ok(ModifyShapeIntersectionQuery { container, index })
    }

    pub fn fetch_ray_intersection(
        &self,
        layout: &RecordLayout,
        dimensions: &[Dimension],
    ) -> Result<FetchRayIntersectionQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_volumetric_index(dimensions)?;
        Ok(FetchRayIntersectionQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_ray_intersection(
        &self,
        layout: &RecordLayout,
        dimensions: &[Dimension],
    ) -> Result<ModifyRayIntersectionQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_volumetric_index(dimensions)?;
        Ok(ModifyRayIntersectionQuery { container, index })
    }

    pub fn fetch_signaled(
        &self,
        layout: &RecordLayout,
        field: FieldId,
        mask: u64,
        signaled_value: u64,
    ) -> Result<FetchSignaledQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_signal_index(field, mask, signaled_value)?;
        Ok(FetchSignaledQuery {
            _container: container,
            index,
        })
    }

    pub fn modify_signaled(
        &self,
        layout: &RecordLayout,
        field: FieldId,
        mask: u64,
        signaled_value: u64,
    ) -> Result<ModifySignaledQuery> {
        let container = self.long_term_container(layout);
        let index = container.store.create_signal_index(field, mask, signaled_value)?;
        Ok(ModifySignaledQuery { container, index })
    }

    /// Event bindings are sealed once the tracked type's long-term
    /// container exists, so registration happens up front.
    pub fn event_registrar(&self) -> EventRegistrar<'_> {
        EventRegistrar { registry: self }
    }

    #[cfg(test)]
    fn long_term_container_count(&self) -> usize {
        self.inner.long_term.borrow().len()
    }

    #[cfg(test)]
    fn short_term_container_count(&self) -> usize {
        self.inner.short_term.borrow().len()
    }
}

/// Registers event bindings for record types whose containers do not
/// exist yet.
pub struct EventRegistrar<'a> {
    registry: &'a Registry,
}

impl EventRegistrar<'_> {
    fn profile_of<'m>(
        &self,
        events: &'m mut HashMap<usize, EventProfile>,
        tracked: &RecordLayout,
    ) -> Result<&'m mut EventProfile> {
        if self
            .registry
            .inner
            .long_term
            .borrow()
            .contains_key(&tracked.identity())
        {
            bail!(
                "record type '{}' already has a live container; events must be \
                 registered before the first query",
                tracked.name()
            );
        }
        Ok(events.entry(tracked.identity()).or_default())
    }

    /// Fires `trigger` whenever a record of its tracked type is inserted.
    pub fn on_add_event(&mut self, trigger: TrivialEventTrigger) -> Result<()> {
        let mut events = self.registry.inner.events.borrow_mut();
        let profile = self.profile_of(&mut events, trigger.tracked_layout())?;
        profile.on_add.push(trigger);
        Ok(())
    }

    /// Fires `trigger` right before a record of its tracked type is
    /// deleted.
    pub fn on_remove_event(&mut self, trigger: TrivialEventTrigger) -> Result<()> {
        let mut events = self.registry.inner.events.borrow_mut();
        let profile = self.profile_of(&mut events, trigger.tracked_layout())?;
        profile.on_remove.push(trigger);
        Ok(())
    }

    /// Fires `trigger` when an edit changes its tracked bytes. Tracker
    /// capacity is validated here, cumulatively, so container creation
    /// cannot fail later.
    pub fn on_change_event(&mut self, trigger: OnChangeEventTrigger) -> Result<()> {
        let mut events = self.registry.inner.events.borrow_mut();
        let profile = self.profile_of(&mut events, trigger.tracked_layout())?;

        let mut combined = profile.on_change.clone();
        combined.push(trigger.clone());
        ChangeTracker::new(combined)?;

        profile.on_change.push(trigger);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CopyOut, EventRoute};

    fn unit_layout() -> RecordLayout {
        let mut builder = RecordLayout::builder("unit", 24);
        builder.register_uint("id", 0, 8).unwrap();
        builder.register_int("health", 8, 4).unwrap();
        builder.register_uint("team", 12, 4).unwrap();
        builder.build().unwrap()
    }

    fn event_layout() -> RecordLayout {
        let mut builder = RecordLayout::builder("unit_event", 24);
        builder.register_uint("unit_id", 0, 8).unwrap();
        builder.register_int("old_health", 8, 4).unwrap();
        builder.register_int("new_health", 12, 4).unwrap();
        builder.build().unwrap()
    }

    fn id_of(layout: &RecordLayout, name: &str) -> FieldId {
        layout.field_by_name(name).unwrap().id()
    }

    fn insert_units(registry: &Registry, layout: &RecordLayout, units: &[(u64, i32)]) {
        let insert = registry.insert_long_term(layout);
        let mut inserter = insert.execute();
        for (id, health) in units {
            let record = inserter.insert();
            record[0..8].copy_from_slice(&id.to_ne_bytes());
            record[8..12].copy_from_slice(&health.to_ne_bytes());
        }
    }

    #[test]
    fn singleton_starts_zeroed_and_keeps_edits() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let fetch = registry.fetch_singleton(&layout);
        let modify = registry.modify_singleton(&layout);

        assert!(fetch.access().record().iter().all(|byte| *byte == 0));
        modify.access().record_mut()[0..8].copy_from_slice(&5u64.to_ne_bytes());
        assert_eq!(
            u64::from_ne_bytes(fetch.access().record()[0..8].try_into().unwrap()),
            5
        );
    }

    #[test]
    fn singleton_readers_coexist_over_the_same_slot() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let fetch = registry.fetch_singleton(&layout);
        let modify = registry.modify_singleton(&layout);

        modify.access().record_mut()[0..8].copy_from_slice(&3u64.to_ne_bytes());

        let first = fetch.access();
        let second = fetch.access();
        let first_bytes = first.record();
        let second_bytes = second.record();
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(
            u64::from_ne_bytes(first_bytes[0..8].try_into().unwrap()),
            3
        );
    }

    #[test]
    #[should_panic(expected = "access contract violation")]
    fn singleton_read_rejected_while_write_access_open() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let fetch = registry.fetch_singleton(&layout);
        let modify = registry.modify_singleton(&layout);

        let _write = modify.access();
        let _read = fetch.access();
    }

    #[test]
    fn short_term_sequence_keeps_insertion_order() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let insert = registry.insert_short_term(&layout);
        {
            let mut inserter = insert.execute();
            for id in [3u64, 1, 2] {
                inserter.insert()[0..8].copy_from_slice(&id.to_ne_bytes());
            }
        }

        let fetch = registry.fetch_sequence(&layout);
        let mut cursor = fetch.execute();
        let mut ids = Vec::new();
        while let Some(record) = cursor.current() {
            ids.push(u64::from_ne_bytes(record[0..8].try_into().unwrap()));
            cursor.advance();
        }
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn short_term_clear_empties_the_sequence() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let insert = registry.insert_short_term(&layout);
        {
            let mut inserter = insert.execute();
            inserter.insert();
            inserter.insert();
        }

        let modify = registry.modify_sequence(&layout);
        modify.clear();
        assert!(registry.fetch_sequence(&layout).execute().current().is_none());
    }

    #[test]
    fn long_term_value_query_roundtrip() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let fetch = registry.fetch_value(&layout, &[id_of(&layout, "id")]).unwrap();
        insert_units(&registry, &layout, &[(1, 10), (2, 20)]);

        let cursor = fetch.execute(&[&2u64.to_ne_bytes()[..]]);
        let record = cursor.current().unwrap();
        assert_eq!(i32::from_ne_bytes(record[8..12].try_into().unwrap()), 20);
    }

    #[test]
    fn same_parameters_share_one_container_and_index() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let key = [id_of(&layout, "id")];
        let first = registry.fetch_value(&layout, &key).unwrap();
        let second = registry.fetch_value(&layout, &key).unwrap();
        assert!(first.index.is_same_index(&second.index));
        assert_eq!(registry.long_term_container_count(), 1);
    }

    #[test]
    fn container_is_released_with_its_last_query() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let fetch = registry.fetch_value(&layout, &[id_of(&layout, "id")]).unwrap();
        insert_units(&registry, &layout, &[(1, 10)]);
        assert_eq!(registry.long_term_container_count(), 1);

        drop(fetch);
        assert_eq!(registry.long_term_container_count(), 0);

        // A fresh query sees a fresh, empty container.
        let reborn = registry.fetch_value(&layout, &[id_of(&layout, "id")]).unwrap();
        assert!(reborn.execute(&[&1u64.to_ne_bytes()[..]]).current().is_none());
    }

    fn drain_events(registry: &Registry, event: &RecordLayout) -> Vec<(u64, i32, i32)> {
        let fetch = registry.fetch_sequence(event);
        let mut cursor = fetch.execute();
        let mut out = Vec::new();
        while let Some(record) = cursor.current() {
            out.push((
                u64::from_ne_bytes(record[0..8].try_into().unwrap()),
                i32::from_ne_bytes(record[8..12].try_into().unwrap()),
                i32::from_ne_bytes(record[12..16].try_into().unwrap()),
            ));
            cursor.advance();
        }
        out
    }

    #[test]
    fn add_and_remove_events_fire_with_payload() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let added = event_layout();
        let removed = event_layout();

        let mut registrar = registry.event_registrar();
        registrar
            .on_add_event(
                TrivialEventTrigger::new(
                    layout.clone(),
                    added.clone(),
                    EventRoute::Fixed,
                    &[CopyOut {
                        source: id_of(&layout, "id"),
                        target: id_of(&added, "unit_id"),
                    }],
                )
                .unwrap(),
            )
            .unwrap();
        registrar
            .on_remove_event(
                TrivialEventTrigger::new(
                    layout.clone(),
                    removed.clone(),
                    EventRoute::Fixed,
                    &[CopyOut {
                        source: id_of(&layout, "id"),
                        target: id_of(&removed, "unit_id"),
                    }],
                )
                .unwrap(),
            )
            .unwrap();

        let modify = registry.modify_value(&layout, &[id_of(&layout, "id")]).unwrap();
        insert_units(&registry, &layout, &[(7, 10), (8, 20)]);

        let add_events = drain_events(&registry, &added);
        assert_eq!(add_events.iter().map(|e| e.0).collect::<Vec<_>>(), vec![7, 8]);

        let mut cursor = modify.execute(&[&7u64.to_ne_bytes()[..]]);
        cursor.delete_current();
        drop(cursor);

        let remove_events = drain_events(&registry, &removed);
        assert_eq!(remove_events.iter().map(|e| e.0).collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn change_events_carry_old_and_new_payload() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let event = event_layout();

        registry
            .event_registrar()
            .on_change_event(
                OnChangeEventTrigger::new(
                    layout.clone(),
                    event.clone(),
                    EventRoute::Normal,
                    &[id_of(&layout, "health")],
                    &[CopyOut {
                        source: id_of(&layout, "health"),
                        target: id_of(&event, "old_health"),
                    }],
                    &[CopyOut {
                        source: id_of(&layout, "health"),
                        target: id_of(&event, "new_health"),
                    }],
                )
                .unwrap(),
            )
            .unwrap();

        let modify = registry.modify_value(&layout, &[id_of(&layout, "id")]).unwrap();
        insert_units(&registry, &layout, &[(1, 50)]);

        {
            let mut cursor = modify.execute(&[&1u64.to_ne_bytes()[..]]);
            cursor.current_mut().unwrap()[8..12].copy_from_slice(&35i32.to_ne_bytes());
        }
        // Editing an untracked field fires nothing.
        {
            let mut cursor = modify.execute(&[&1u64.to_ne_bytes()[..]]);
            cursor.current_mut().unwrap()[12..16].copy_from_slice(&9u32.to_ne_bytes());
        }

        let events = drain_events(&registry, &event);
        assert_eq!(events, vec![(0, 50, 35)]);
    }

    #[test]
    fn event_registration_after_container_creation_is_rejected() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let event = event_layout();
        let _query = registry.insert_long_term(&layout);

        let result = registry.event_registrar().on_add_event(
            TrivialEventTrigger::new(layout, event, EventRoute::Fixed, &[]).unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn event_containers_live_while_the_tracked_container_does() {
        let registry = Registry::new("test");
        let layout = unit_layout();
        let event = event_layout();
        registry
            .event_registrar()
            .on_add_event(
                TrivialEventTrigger::new(layout.clone(), event.clone(), EventRoute::Fixed, &[])
                    .unwrap(),
            )
            .unwrap();

        let query = registry.insert_long_term(&layout);
        assert_eq!(registry.short_term_container_count(), 1);
        drop(query);
        assert_eq!(registry.short_term_container_count(), 0);
    }
}
