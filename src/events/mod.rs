//! # Change Tracking And Event Triggers
//!
//! Automatic event production for record mutations. Event types are plain
//! record layouts; an event fires by inserting a record of that layout
//! into the event type's own short-term storage, with selected payload
//! fields copied out of the mutated record.
//!
//! ## Routes
//!
//! Every event type is bound to one of six routes that pin down where in
//! the frame loop it is produced, consumed and cleared:
//!
//! | Route              | created in | read in | cleared                    |
//! |--------------------|------------|---------|----------------------------|
//! | Fixed              | fixed      | fixed   | right before next creation |
//! | Normal             | normal     | normal  | right before next creation |
//! | FromFixedToNormal  | fixed      | normal  | end of normal              |
//! | Custom             | custom     | custom  | end of custom              |
//! | FromCustomToFixed  | custom     | fixed   | end of fixed               |
//! | FromCustomToNormal | custom     | normal  | end of normal              |
//!
//! ## Baking
//!
//! Field-to-field copy-out pairs and tracked-field sets are validated and
//! flattened into contiguous byte blocks at registration time, so firing
//! an event is a handful of `copy_from_slice` calls and change detection
//! is at most four `memcmp`-shaped zone comparisons, never a per-field
//! walk.

use std::cell::RefCell;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::layout::{resolve_leaf_fields, FieldArchetype, FieldId, RecordLayout};

/// Most distinct contiguous byte zones one record type's change tracking
/// may watch, across all of its on-change triggers combined.
pub const MAX_TRACKED_ZONES: usize = 4;

/// Most on-change event bindings per record type.
pub const MAX_CHANGE_BINDINGS: usize = 4;

/// Snapshot buffer budget per record type.
pub const MAX_TRACKING_BUFFER: usize = 128;

/// Frame-loop phase a pipeline executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fixed,
    Normal,
    Custom,
}

/// When an event store is emptied, relative to the consuming side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTiming {
    /// Cleared right before the producing phase runs again.
    BeforeNextProduction,
    /// Cleared when the named phase finishes consuming.
    PhaseEnd(Phase),
}

/// Production/consumption route of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    Fixed,
    Normal,
    FromFixedToNormal,
    Custom,
    FromCustomToFixed,
    FromCustomToNormal,
}

impl EventRoute {
    pub fn producing_phase(self) -> Phase {
        match self {
            EventRoute::Fixed | EventRoute::FromFixedToNormal => Phase::Fixed,
            EventRoute::Normal => Phase::Normal,
            EventRoute::Custom | EventRoute::FromCustomToFixed | EventRoute::FromCustomToNormal => {
                Phase::Custom
            }
        }
    }

    pub fn consuming_phase(self) -> Phase {
        match self {
            EventRoute::Fixed | EventRoute::FromCustomToFixed => Phase::Fixed,
            EventRoute::Normal | EventRoute::FromFixedToNormal | EventRoute::FromCustomToNormal => {
                Phase::Normal
            }
            EventRoute::Custom => Phase::Custom,
        }
    }

    pub fn clear_timing(self) -> ClearTiming {
        match self {
            EventRoute::Fixed | EventRoute::Normal => ClearTiming::BeforeNextProduction,
            EventRoute::FromFixedToNormal | EventRoute::FromCustomToNormal => {
                ClearTiming::PhaseEnd(Phase::Normal)
            }
            EventRoute::Custom => ClearTiming::PhaseEnd(Phase::Custom),
            EventRoute::FromCustomToFixed => ClearTiming::PhaseEnd(Phase::Fixed),
        }
    }
}

/// One record-field to event-field payload copy.
#[derive(Debug, Clone, Copy)]
pub struct CopyOut {
    pub source: FieldId,
    pub target: FieldId,
}

/// A baked run of contiguous bytes copied from source to target buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyOutBlock {
    pub source_offset: usize,
    pub target_offset: usize,
    pub length: usize,
}

type Blocks = SmallVec<[CopyOutBlock; 4]>;

/// Validates copy-out pairs and merges adjacent ones into blocks.
fn bake_copy_outs(
    source_layout: &RecordLayout,
    target_layout: &RecordLayout,
    copy_outs: &[CopyOut],
) -> Result<Blocks> {
    let mut blocks: Blocks = SmallVec::new();
    for copy_out in copy_outs {
        let source = match source_layout.field(copy_out.source) {
            Some(field) => field,
            None => bail!(
                "copy-out source {:?} not found in layout '{}'",
                copy_out.source,
                source_layout.name()
            ),
        };
        let target = match target_layout.field(copy_out.target) {
            Some(field) => field,
            None => bail!(
                "copy-out target {:?} not found in layout '{}'",
                copy_out.target,
                target_layout.name()
            ),
        };
        ensure!(
            source.archetype() != FieldArchetype::Bit,
            "copy-out of bit field '{}' is not supported",
            source.name()
        );
        ensure!(
            source.archetype() == target.archetype() && source.size() == target.size(),
            "copy-out '{}' -> '{}' joins mismatched fields",
            source.name(),
            target.name()
        );

        blocks.push(CopyOutBlock {
            source_offset: source.offset(),
            target_offset: target.offset(),
            length: source.size(),
        });
    }

    blocks.sort_by_key(|block| block.source_offset);
    let mut merged: Blocks = SmallVec::new();
    for block in blocks {
        if let Some(last) = merged.last_mut() {
            if last.source_offset + last.length == block.source_offset
                && last.target_offset + last.length == block.target_offset
            {
                last.length += block.length;
                continue;
            }
        }
        merged.push(block);
    }
    Ok(merged)
}

fn apply_blocks(blocks: &[CopyOutBlock], source: &[u8], target: &mut [u8]) {
    for block in blocks {
        target[block.target_offset..block.target_offset + block.length]
            .copy_from_slice(&source[block.source_offset..block.source_offset + block.length]);
    }
}

/// A contiguous byte zone of the tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackedZone {
    pub source_offset: usize,
    pub length: usize,
}

fn bake_tracked_zones(
    layout: &RecordLayout,
    tracked_fields: &[FieldId],
) -> Result<SmallVec<[TrackedZone; MAX_TRACKED_ZONES]>> {
    ensure!(
        !tracked_fields.is_empty(),
        "on-change trigger tracks no fields"
    );
    let leafs = resolve_leaf_fields(layout, tracked_fields)?;

    let mut zones: SmallVec<[TrackedZone; MAX_TRACKED_ZONES]> = SmallVec::new();
    let mut spans: Vec<(usize, usize)> = leafs
        .iter()
        .map(|field| (field.offset(), field.offset() + field.size()))
        .collect();
    spans.sort_unstable();

    for (start, end) in spans {
        if let Some(last) = zones.last_mut() {
            if start <= last.source_offset + last.length {
                let zone_end = (last.source_offset + last.length).max(end);
                last.length = zone_end - last.source_offset;
                continue;
            }
        }
        ensure!(
            zones.len() < MAX_TRACKED_ZONES,
            "layout '{}': tracked fields form more than {} contiguous zones",
            layout.name(),
            MAX_TRACKED_ZONES
        );
        zones.push(TrackedZone {
            source_offset: start,
            length: end - start,
        });
    }
    Ok(zones)
}

/// Immediate trigger firing on record addition or removal.
#[derive(Clone)]
pub struct TrivialEventTrigger {
    tracked: RecordLayout,
    event: RecordLayout,
    route: EventRoute,
    copy_outs: Blocks,
}

impl TrivialEventTrigger {
    pub fn new(
        tracked: RecordLayout,
        event: RecordLayout,
        route: EventRoute,
        copy_outs: &[CopyOut],
    ) -> Result<Self> {
        ensure!(
            !tracked.is_same_type(&event),
            "event type '{}' cannot trigger on itself",
            event.name()
        );
        let copy_outs = bake_copy_outs(&tracked, &event, copy_outs)?;
        Ok(TrivialEventTrigger {
            tracked,
            event,
            route,
            copy_outs,
        })
    }

    pub fn tracked_layout(&self) -> &RecordLayout {
        &self.tracked
    }

    pub fn event_layout(&self) -> &RecordLayout {
        &self.event
    }

    pub fn route(&self) -> EventRoute {
        self.route
    }

    /// Fills a zeroed event record from the tracked record.
    pub(crate) fn apply(&self, record: &[u8], event_out: &mut [u8]) {
        apply_blocks(&self.copy_outs, record, event_out);
    }
}

/// Trigger firing when tracked bytes of a record change during an edition.
#[derive(Clone)]
pub struct OnChangeEventTrigger {
    tracked: RecordLayout,
    event: RecordLayout,
    route: EventRoute,
    tracked_zones: SmallVec<[TrackedZone; MAX_TRACKED_ZONES]>,
    /// Source offsets are record coordinates until a `ChangeTracker`
    /// adopts the trigger and remaps them into its snapshot buffer.
    copy_out_of_initial: Blocks,
    copy_out_of_changed: Blocks,
}

impl OnChangeEventTrigger {
    pub fn new(
        tracked: RecordLayout,
        event: RecordLayout,
        route: EventRoute,
        tracked_fields: &[FieldId],
        copy_out_of_initial: &[CopyOut],
        copy_out_of_changed: &[CopyOut],
    ) -> Result<Self> {
        ensure!(
            !tracked.is_same_type(&event),
            "event type '{}' cannot trigger on itself",
            event.name()
        );
        let tracked_zones = bake_tracked_zones(&tracked, tracked_fields)?;
        let copy_out_of_initial = bake_copy_outs(&tracked, &event, copy_out_of_initial)?;
        let copy_out_of_changed = bake_copy_outs(&tracked, &event, copy_out_of_changed)?;

        // The pre-edit snapshot covers tracked zones only, so an initial
        // copy-out may read nothing outside of them.
        for block in &copy_out_of_initial {
            let covered = tracked_zones.iter().any(|zone| {
                block.source_offset >= zone.source_offset
                    && block.source_offset + block.length <= zone.source_offset + zone.length
            });
            ensure!(
                covered,
                "initial copy-out at offset {} reads untracked bytes of '{}'",
                block.source_offset,
                tracked.name()
            );
        }

        Ok(OnChangeEventTrigger {
            tracked,
            event,
            route,
            tracked_zones,
            copy_out_of_initial,
            copy_out_of_changed,
        })
    }

    pub fn tracked_layout(&self) -> &RecordLayout {
        &self.tracked
    }

    pub fn event_layout(&self) -> &RecordLayout {
        &self.event
    }

    pub fn route(&self) -> EventRoute {
        self.route
    }

    /// Copies pre-edit payload out of the tracker's snapshot buffer.
    /// Valid only after a `ChangeTracker` remapped the block offsets.
    pub(crate) fn apply_initial(&self, tracking_buffer: &[u8], event_out: &mut [u8]) {
        apply_blocks(&self.copy_out_of_initial, tracking_buffer, event_out);
    }

    /// Copies post-edit payload out of the record itself.
    pub(crate) fn apply_changed(&self, record: &[u8], event_out: &mut [u8]) {
        apply_blocks(&self.copy_out_of_changed, record, event_out);
    }
}

struct BufferZone {
    source_offset: usize,
    length: usize,
    buffer_offset: usize,
}

struct Binding {
    trigger: OnChangeEventTrigger,
    zone_mask: u8,
}

/// Per record type change detector: snapshots the union of every
/// on-change trigger's tracked zones before an edit and diffs each zone
/// exactly once afterwards, firing the bindings whose zones changed.
pub struct ChangeTracker {
    zones: SmallVec<[BufferZone; MAX_TRACKED_ZONES]>,
    buffer: RefCell<Box<[u8]>>,
    bindings: SmallVec<[Binding; MAX_CHANGE_BINDINGS]>,
}

impl ChangeTracker {
    pub fn new(triggers: Vec<OnChangeEventTrigger>) -> Result<Self> {
        ensure!(!triggers.is_empty(), "change tracker needs at least one trigger");
        ensure!(
            triggers.len() <= MAX_CHANGE_BINDINGS,
            "record type '{}' has more than {} on-change bindings",
            triggers[0].tracked.name(),
            MAX_CHANGE_BINDINGS
        );
        let tracked = triggers[0].tracked.clone();
        for trigger in &triggers {
            ensure!(
                trigger.tracked.is_same_type(&tracked),
                "change tracker mixes record types '{}' and '{}'",
                tracked.name(),
                trigger.tracked.name()
            );
        }

        // Merge every trigger's zones into the tracker-wide zone set.
        let mut spans: Vec<(usize, usize)> = triggers
            .iter()
            .flat_map(|trigger| trigger.tracked_zones.iter())
            .map(|zone| (zone.source_offset, zone.source_offset + zone.length))
            .collect();
        spans.sort_unstable();

        let mut zones: SmallVec<[BufferZone; MAX_TRACKED_ZONES]> = SmallVec::new();
        for (start, end) in spans {
            if let Some(last) = zones.last_mut() {
                if start <= last.source_offset + last.length {
                    let zone_end = (last.source_offset + last.length).max(end);
                    last.length = zone_end - last.source_offset;
                    continue;
                }
            }
            ensure!(
                zones.len() < MAX_TRACKED_ZONES,
                "record type '{}': tracked zones exceed {}",
                tracked.name(),
                MAX_TRACKED_ZONES
            );
            zones.push(BufferZone {
                source_offset: start,
                length: end - start,
                buffer_offset: 0,
            });
        }
        // Buffer offsets are assigned only once merging settled.
        let mut offset = 0usize;
        for zone in zones.iter_mut() {
            zone.buffer_offset = offset;
            offset += zone.length;
        }
        ensure!(
            offset <= MAX_TRACKING_BUFFER,
            "record type '{}': tracked zones need {} bytes, budget is {}",
            tracked.name(),
            offset,
            MAX_TRACKING_BUFFER
        );

        // Bind each trigger: zone hit mask plus initial copy-outs remapped
        // from record coordinates into snapshot-buffer coordinates.
        let mut bindings: SmallVec<[Binding; MAX_CHANGE_BINDINGS]> = SmallVec::new();
        for mut trigger in triggers {
            let mut zone_mask = 0u8;
            for (bit, zone) in zones.iter().enumerate() {
                let intersects = trigger.tracked_zones.iter().any(|tracked_zone| {
                    tracked_zone.source_offset < zone.source_offset + zone.length
                        && zone.source_offset < tracked_zone.source_offset + tracked_zone.length
                });
                if intersects {
                    zone_mask |= 1 << bit;
                }
            }

            for block in trigger.copy_out_of_initial.iter_mut() {
                let zone = zones
                    .iter()
                    .find(|zone| {
                        block.source_offset >= zone.source_offset
                            && block.source_offset + block.length
                                <= zone.source_offset + zone.length
                    })
                    .expect("initial copy-outs validated against tracked zones");
                block.source_offset = zone.buffer_offset + block.source_offset - zone.source_offset;
            }

            bindings.push(Binding { trigger, zone_mask });
        }

        Ok(ChangeTracker {
            zones,
            buffer: RefCell::new(vec![0u8; offset].into_boxed_slice()),
            bindings,
        })
    }

    /// Snapshots every tracked zone of `record`.
    pub(crate) fn begin_edition(&self, record: &[u8]) {
        let mut buffer = self.buffer.borrow_mut();
        for zone in &self.zones {
            buffer[zone.buffer_offset..zone.buffer_offset + zone.length]
                .copy_from_slice(&record[zone.source_offset..zone.source_offset + zone.length]);
        }
    }

    /// Diffs every tracked zone against the snapshot. Returns the changed
    /// zone bitmask; zero means no binding fires.
    pub(crate) fn end_edition(&self, record: &[u8]) -> u8 {
        let buffer = self.buffer.borrow();
        let mut changed = 0u8;
        for (bit, zone) in self.zones.iter().enumerate() {
            let snapshot = &buffer[zone.buffer_offset..zone.buffer_offset + zone.length];
            let current = &record[zone.source_offset..zone.source_offset + zone.length];
            if snapshot != current {
                changed |= 1 << bit;
            }
        }
        changed
    }

    /// Visits every binding whose zones intersect `changed`, handing it
    /// the snapshot buffer for initial copy-outs.
    pub(crate) fn for_each_hit(
        &self,
        changed: u8,
        visit: &mut dyn FnMut(&OnChangeEventTrigger, &[u8]),
    ) {
        if changed == 0 {
            return;
        }
        let buffer = self.buffer.borrow();
        for binding in &self.bindings {
            if binding.zone_mask & changed != 0 {
                visit(&binding.trigger, &buffer);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}
