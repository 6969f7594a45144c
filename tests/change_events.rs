//! # Change Event Test Suite
//!
//! End-to-end event flow: triggers registered up front, records mutated
//! through prepared queries, event records drained from their short-term
//! containers the way a consuming phase would.
//!
//! ## Test Categories
//!
//! 1. **Lifecycle Tests**: Add and remove events across a full tick
//! 2. **Tracking Tests**: Merged zones, reverted edits, per-trigger firing
//! 3. **Consumption Tests**: Draining and clearing event sequences

use corral::events::{CopyOut, EventRoute, OnChangeEventTrigger, TrivialEventTrigger};
use corral::layout::{FieldId, RecordLayout};
use corral::registry::Registry;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn unit_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("unit", 32);
    builder.register_uint("id", 0, 8).unwrap();
    builder.register_int("health", 8, 4).unwrap();
    builder.register_int("armor", 12, 4).unwrap();
    builder.register_uint("team", 16, 8).unwrap();
    builder.build().unwrap()
}

fn health_event_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("health_changed", 24);
    builder.register_uint("unit_id", 0, 8).unwrap();
    builder.register_int("old_health", 8, 4).unwrap();
    builder.register_int("new_health", 12, 4).unwrap();
    builder.build().unwrap()
}

fn team_event_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("team_changed", 16);
    builder.register_uint("unit_id", 0, 8).unwrap();
    builder.register_uint("new_team", 8, 8).unwrap();
    builder.build().unwrap()
}

fn removal_event_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("unit_removed", 16);
    builder.register_uint("unit_id", 0, 8).unwrap();
    builder.register_uint("team", 8, 8).unwrap();
    builder.build().unwrap()
}

fn field(layout: &RecordLayout, name: &str) -> FieldId {
    layout.field_by_name(name).unwrap().id()
}

fn copy(source_layout: &RecordLayout, source: &str, target_layout: &RecordLayout, target: &str) -> CopyOut {
    CopyOut {
        source: field(source_layout, source),
        target: field(target_layout, target),
    }
}

fn drain_u64s(registry: &Registry, layout: &RecordLayout, offset: usize) -> Vec<u64> {
    let fetch = registry.fetch_sequence(layout);
    let mut cursor = fetch.execute();
    let mut out = Vec::new();
    while let Some(record) = cursor.current() {
        out.push(u64::from_ne_bytes(record[offset..offset + 8].try_into().unwrap()));
        cursor.advance();
    }
    out
}

// ============================================================================
// LIFECYCLE TESTS
// ============================================================================

#[test]
fn removal_events_capture_the_record_before_it_dies() {
    let registry = Registry::new("events");
    let unit = unit_layout();
    let removed = removal_event_layout();

    registry
        .event_registrar()
        .on_remove_event(
            TrivialEventTrigger::new(
                unit.clone(),
                removed.clone(),
                EventRoute::FromFixedToNormal,
                &[
                    copy(&unit, "id", &removed, "unit_id"),
                    copy(&unit, "team", &removed, "team"),
                ],
            )
            .unwrap(),
        )
        .unwrap();

    let by_id = registry.modify_value(&unit, &[field(&unit, "id")]).unwrap();
    {
        let insert = registry.insert_long_term(&unit);
        let mut inserter = insert.execute();
        for (id, team) in [(1u64, 10u64), (2, 20)] {
            let record = inserter.insert();
            record[0..8].copy_from_slice(&id.to_ne_bytes());
            record[16..24].copy_from_slice(&team.to_ne_bytes());
        }
    }

    {
        let mut cursor = by_id.execute(&[&2u64.to_ne_bytes()[..]]);
        cursor.delete_current();
    }

    assert_eq!(drain_u64s(&registry, &removed, 0), vec![2]);
    assert_eq!(drain_u64s(&registry, &removed, 8), vec![20]);
}

// ============================================================================
// TRACKING TESTS
// ============================================================================

#[test]
fn triggers_with_disjoint_zones_fire_independently() {
    let registry = Registry::new("events");
    let unit = unit_layout();
    let health_event = health_event_layout();
    let team_event = team_event_layout();

    let mut registrar = registry.event_registrar();
    registrar
        .on_change_event(
            OnChangeEventTrigger::new(
                unit.clone(),
                health_event.clone(),
                EventRoute::Normal,
                &[field(&unit, "health")],
                &[copy(&unit, "health", &health_event, "old_health")],
                &[
                    copy(&unit, "id", &health_event, "unit_id"),
                    copy(&unit, "health", &health_event, "new_health"),
                ],
            )
            .unwrap(),
        )
        .unwrap();
    registrar
        .on_change_event(
            OnChangeEventTrigger::new(
                unit.clone(),
                team_event.clone(),
                EventRoute::Custom,
                &[field(&unit, "team")],
                &[],
                &[
                    copy(&unit, "id", &team_event, "unit_id"),
                    copy(&unit, "team", &team_event, "new_team"),
                ],
            )
            .unwrap(),
        )
        .unwrap();

    let by_id = registry.modify_value(&unit, &[field(&unit, "id")]).unwrap();
    {
        let insert = registry.insert_long_term(&unit);
        let mut inserter = insert.execute();
        let record = inserter.insert();
        record[0..8].copy_from_slice(&9u64.to_ne_bytes());
        record[8..12].copy_from_slice(&100i32.to_ne_bytes());
        record[12..16].copy_from_slice(&50i32.to_ne_bytes());
    }

    // Health-only edit.
    {
        let mut cursor = by_id.execute(&[&9u64.to_ne_bytes()[..]]);
        cursor.current_mut().unwrap()[8..12].copy_from_slice(&80i32.to_ne_bytes());
    }
    assert_eq!(drain_u64s(&registry, &health_event, 0), vec![9]);
    assert!(drain_u64s(&registry, &team_event, 0).is_empty());

    // Team-only edit fires only the team trigger.
    {
        let mut cursor = by_id.execute(&[&9u64.to_ne_bytes()[..]]);
        cursor.current_mut().unwrap()[16..24].copy_from_slice(&4u64.to_ne_bytes());
    }
    assert_eq!(drain_u64s(&registry, &health_event, 0), vec![9]);
    assert_eq!(drain_u64s(&registry, &team_event, 0), vec![9]);
    assert_eq!(drain_u64s(&registry, &team_event, 8), vec![4]);
}

#[test]
fn old_payload_comes_from_the_pre_edit_snapshot() {
    let registry = Registry::new("events");
    let unit = unit_layout();
    let health_event = health_event_layout();

    registry
        .event_registrar()
        .on_change_event(
            OnChangeEventTrigger::new(
                unit.clone(),
                health_event.clone(),
                EventRoute::Normal,
                &[field(&unit, "health")],
                &[copy(&unit, "health", &health_event, "old_health")],
                &[copy(&unit, "health", &health_event, "new_health")],
            )
            .unwrap(),
        )
        .unwrap();

    let by_id = registry.modify_value(&unit, &[field(&unit, "id")]).unwrap();
    {
        let insert = registry.insert_long_term(&unit);
        let mut inserter = insert.execute();
        let record = inserter.insert();
        record[0..8].copy_from_slice(&1u64.to_ne_bytes());
        record[8..12].copy_from_slice(&100i32.to_ne_bytes());
    }

    // Two edits of the same record in one cursor visit collapse into one
    // event carrying the original value and the final one.
    {
        let mut cursor = by_id.execute(&[&1u64.to_ne_bytes()[..]]);
        cursor.current_mut().unwrap()[8..12].copy_from_slice(&70i32.to_ne_bytes());
        cursor.current_mut().unwrap()[8..12].copy_from_slice(&40i32.to_ne_bytes());
    }

    let fetch = registry.fetch_sequence(&health_event);
    let mut cursor = fetch.execute();
    let record = cursor.current().unwrap();
    assert_eq!(i32::from_ne_bytes(record[8..12].try_into().unwrap()), 100);
    assert_eq!(i32::from_ne_bytes(record[12..16].try_into().unwrap()), 40);
    cursor.advance();
    assert!(cursor.current().is_none());
}

#[test]
fn reverted_edit_fires_nothing() {
    let registry = Registry::new("events");
    let unit = unit_layout();
    let health_event = health_event_layout();

    registry
        .event_registrar()
        .on_change_event(
            OnChangeEventTrigger::new(
                unit.clone(),
                health_event.clone(),
                EventRoute::Normal,
                &[field(&unit, "health")],
                &[],
                &[],
            )
            .unwrap(),
        )
        .unwrap();

    let by_id = registry.modify_value(&unit, &[field(&unit, "id")]).unwrap();
    {
        let insert = registry.insert_long_term(&unit);
        let mut inserter = insert.execute();
        let record = inserter.insert();
        record[0..8].copy_from_slice(&1u64.to_ne_bytes());
        record[8..12].copy_from_slice(&100i32.to_ne_bytes());
    }

    {
        let mut cursor = by_id.execute(&[&1u64.to_ne_bytes()[..]]);
        cursor.current_mut().unwrap()[8..12].copy_from_slice(&55i32.to_ne_bytes());
        cursor.current_mut().unwrap()[8..12].copy_from_slice(&100i32.to_ne_bytes());
    }

    assert!(drain_u64s(&registry, &health_event, 0).is_empty());
}

// ============================================================================
// CONSUMPTION TESTS
// ============================================================================

#[test]
fn consumed_events_are_cleared_between_ticks() {
    let registry = Registry::new("events");
    let unit = unit_layout();
    let added = removal_event_layout();

    registry
        .event_registrar()
        .on_add_event(
            TrivialEventTrigger::new(
                unit.clone(),
                added.clone(),
                EventRoute::Fixed,
                &[copy(&unit, "id", &added, "unit_id")],
            )
            .unwrap(),
        )
        .unwrap();

    let insert = registry.insert_long_term(&unit);
    let clear = registry.modify_sequence(&added);

    // Tick one: two units appear and their events are consumed.
    {
        let mut inserter = insert.execute();
        inserter.insert()[0..8].copy_from_slice(&1u64.to_ne_bytes());
        inserter.insert()[0..8].copy_from_slice(&2u64.to_ne_bytes());
    }
    assert_eq!(drain_u64s(&registry, &added, 0), vec![1, 2]);
    clear.clear();

    // Tick two: only the new unit's event is visible.
    {
        let mut inserter = insert.execute();
        inserter.insert()[0..8].copy_from_slice(&3u64.to_ne_bytes());
    }
    assert_eq!(drain_u64s(&registry, &added, 0), vec![3]);
}
