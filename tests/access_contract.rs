//! # Access Contract Test Suite
//!
//! The reader/writer protocol fails fast: every violation panics at the
//! violating call instead of corrupting records. These tests pin down the
//! panic points a scheduler must design around.

use corral::layout::{FieldId, RecordLayout};
use corral::registry::Registry;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn unit_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("unit", 16);
    builder.register_uint("id", 0, 8).unwrap();
    builder.register_int("health", 8, 4).unwrap();
    builder.build().unwrap()
}

fn field(layout: &RecordLayout, name: &str) -> FieldId {
    layout.field_by_name(name).unwrap().id()
}

// ============================================================================
// SINGLETON ACCESS
// ============================================================================

#[test]
#[should_panic(expected = "access contract violation")]
fn singleton_write_rejected_while_read_access_open() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let fetch = registry.fetch_singleton(&layout);
    let modify = registry.modify_singleton(&layout);

    let _read = fetch.access();
    let _write = modify.access();
}

#[test]
fn sequential_singleton_accesses_are_fine() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let fetch = registry.fetch_singleton(&layout);
    let modify = registry.modify_singleton(&layout);

    modify.access().record_mut()[0] = 1;
    assert_eq!(fetch.access().record()[0], 1);
    modify.access().record_mut()[0] = 2;
    assert_eq!(fetch.access().record()[0], 2);
}

// ============================================================================
// LONG-TERM ACCESS
// ============================================================================

#[test]
#[should_panic(expected = "access contract violation")]
fn edit_cursor_rejected_while_read_cursor_open() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let fetch = registry.fetch_value(&layout, &[field(&layout, "id")]).unwrap();
    let modify = registry.modify_value(&layout, &[field(&layout, "id")]).unwrap();

    let key = 1u64.to_ne_bytes();
    let _reader = fetch.execute(&[&key[..]]);
    let _editor = modify.execute(&[&key[..]]);
}

#[test]
#[should_panic(expected = "access contract violation")]
fn second_writer_rejected() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let insert = registry.insert_long_term(&layout);

    let _first = insert.execute();
    let _second = insert.execute();
}

#[test]
#[should_panic(expected = "requires a quiescent store")]
fn index_creation_rejected_while_cursor_open() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let by_id = registry.fetch_value(&layout, &[field(&layout, "id")]).unwrap();

    let key = 1u64.to_ne_bytes();
    let _reader = by_id.execute(&[&key[..]]);
    let _ = registry.fetch_ascending_range(&layout, field(&layout, "health"));
}

#[test]
fn concurrent_readers_are_fine() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let by_id = registry.fetch_value(&layout, &[field(&layout, "id")]).unwrap();
    {
        let insert = registry.insert_long_term(&layout);
        insert.execute().insert()[0..8].copy_from_slice(&1u64.to_ne_bytes());
    }

    let key = 1u64.to_ne_bytes();
    let first = by_id.execute(&[&key[..]]);
    let second = by_id.execute(&[&key[..]]);
    assert!(first.current().is_some());
    assert!(second.current().is_some());
}

// ============================================================================
// SHORT-TERM ACCESS
// ============================================================================

#[test]
#[should_panic(expected = "access contract violation")]
fn clear_rejected_while_sequence_cursor_open() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let fetch = registry.fetch_sequence(&layout);
    let modify = registry.modify_sequence(&layout);

    let _cursor = fetch.execute();
    modify.clear();
}

#[test]
#[should_panic(expected = "advancing a finished cursor")]
fn advancing_a_finished_sequence_cursor_panics() {
    let registry = Registry::new("contract");
    let layout = unit_layout();
    let fetch = registry.fetch_sequence(&layout);

    let mut cursor = fetch.execute();
    cursor.advance();
}
