//! # Index Plumbing
//!
//! Shared machinery for the four index kinds: the notification interface a
//! store drives, and byte-level field value semantics (equality, ordering,
//! hashing, numeric decoding) used consistently by every index.
//!
//! ## Value Semantics
//!
//! | Archetype | Equality | Ordering |
//! |-----------|----------|----------|
//! | Bit | masked bit | false < true |
//! | Int / Uint | bytes | numeric by decoded value |
//! | Float | bytes | IEEE total order |
//! | String | up to first NUL | bytewise up to first NUL |
//! | Block | full bytes | bytewise lexicographic |
//! | InternedString | handle bytes | by handle value |
//!
//! Content after a string's first NUL is insignificant: two keys that agree
//! up to the terminator are the same key even if the tail bytes differ.

pub mod hash;
pub mod ordered;
pub mod signal;
pub mod volumetric;

use std::cmp::Ordering;
use std::hash::Hasher;

use zerocopy::FromBytes;

use crate::layout::{Field, FieldArchetype};

/// Notifications a store routes to each attached index. `record` always
/// points at a live pool slot; `backup` holds the pre-edit snapshot of
/// every indexed field and is how indices locate a record whose key bytes
/// already changed.
pub(crate) trait StoreIndex {
    fn on_record_inserted(&self, record: *mut u8);
    fn on_record_changed(&self, record: *mut u8, backup: *const u8);
    fn on_record_deleted(&self, record: *mut u8, backup: *const u8);
    fn on_writer_closed(&self);
}

/// Identity token used to skip the index that requested an operation when
/// the store cascades it. Indices live inside `Rc`, so the address is
/// stable for the index lifetime.
pub(crate) fn index_token<T>(index: &T) -> usize {
    index as *const T as *const () as usize
}

/// Field value bytes inside a raw record or backup buffer.
///
/// # Safety
///
/// `record` must point at a live record slot (or the store's backup
/// buffer) covering the field's byte range.
pub(crate) unsafe fn field_value<'a>(field: &Field, record: *const u8) -> &'a [u8] {
    std::slice::from_raw_parts(record.add(field.offset()), field.size())
}

fn decode_uint(bytes: &[u8]) -> u64 {
    match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::read_from(bytes).map(u64::from).expect("size matched"),
        4 => u32::read_from(bytes).map(u64::from).expect("size matched"),
        8 => u64::read_from(bytes).expect("size matched"),
        other => panic!("unsupported integer field size {other}"),
    }
}

fn decode_int(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::read_from(bytes).map(i64::from).expect("size matched"),
        4 => i32::read_from(bytes).map(i64::from).expect("size matched"),
        8 => i64::read_from(bytes).expect("size matched"),
        other => panic!("unsupported integer field size {other}"),
    }
}

/// Decodes any numeric field value to `f64` (volumetric geometry operates
/// in one numeric domain regardless of the stored representation).
pub(crate) fn decode_numeric(field: &Field, value: &[u8]) -> f64 {
    match field.archetype() {
        FieldArchetype::Int => decode_int(value) as f64,
        FieldArchetype::Uint => decode_uint(value) as f64,
        FieldArchetype::Float => match value.len() {
            4 => f32::read_from(value).expect("size matched") as f64,
            8 => f64::read_from(value).expect("size matched"),
            other => panic!("unsupported float field size {other}"),
        },
        other => panic!("field archetype {other:?} is not numeric"),
    }
}

fn string_prefix(value: &[u8]) -> &[u8] {
    match value.iter().position(|byte| *byte == 0) {
        Some(nul) => &value[..nul],
        None => value,
    }
}

/// Whether two field values are equal under the archetype's semantics.
/// Both slices are field-sized value bytes.
pub(crate) fn value_equals(field: &Field, lhs: &[u8], rhs: &[u8]) -> bool {
    match field.archetype() {
        FieldArchetype::Bit => {
            let mask = 1u8 << field.bit_offset();
            (lhs[0] ^ rhs[0]) & mask == 0
        }
        FieldArchetype::String => string_prefix(lhs) == string_prefix(rhs),
        _ => lhs == rhs,
    }
}

/// Total order over two field values under the archetype's semantics.
pub(crate) fn compare_values(field: &Field, lhs: &[u8], rhs: &[u8]) -> Ordering {
    match field.archetype() {
        FieldArchetype::Bit => {
            let mask = 1u8 << field.bit_offset();
            (lhs[0] & mask != 0).cmp(&(rhs[0] & mask != 0))
        }
        FieldArchetype::Int => decode_int(lhs).cmp(&decode_int(rhs)),
        FieldArchetype::Uint | FieldArchetype::InternedString => {
            decode_uint(lhs).cmp(&decode_uint(rhs))
        }
        FieldArchetype::Float => match field.size() {
            4 => f32::read_from(lhs)
                .expect("size matched")
                .total_cmp(&f32::read_from(rhs).expect("size matched")),
            _ => f64::read_from(lhs)
                .expect("size matched")
                .total_cmp(&f64::read_from(rhs).expect("size matched")),
        },
        FieldArchetype::String => string_prefix(lhs).cmp(string_prefix(rhs)),
        _ => lhs.cmp(rhs),
    }
}

/// Feeds a field value into a hasher so that values equal under
/// `value_equals` hash identically.
pub(crate) fn hash_value(field: &Field, value: &[u8], state: &mut impl Hasher) {
    match field.archetype() {
        FieldArchetype::Bit => {
            let mask = 1u8 << field.bit_offset();
            state.write_u8(if value[0] & mask != 0 { 1 } else { 0 });
        }
        FieldArchetype::String => state.write(string_prefix(value)),
        _ => state.write(value),
    }
}
