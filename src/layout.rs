//! # Record Layout Descriptors
//!
//! This module provides the reflection data consumed by every index and
//! cursor: a `RecordLayout` describes one record type as a flat list of
//! fields with byte offsets and sizes, and nothing else. The engine never
//! sees a concrete Rust type for stored records — all access goes through
//! these descriptors.
//!
//! ## Field Archetypes
//!
//! | Archetype | Sizes | Notes |
//! |-----------|-------|-------|
//! | Bit | 1 | single flag inside a byte, `bit_offset` selects it |
//! | Int | 1/2/4/8 | signed, native-endian |
//! | Uint | 1/2/4/8 | unsigned, native-endian |
//! | Float | 4/8 | IEEE 754 |
//! | String | any | fixed capacity, NUL-padded |
//! | Block | any | opaque bytes, compared bytewise |
//! | InternedString | 8 | interner handle, identity semantics |
//! | NestedObject | nested size | projected into leaf fields, not indexable |
//! | Vector | any | inline bounded vector, opaque, not indexable |
//!
//! ## Identity
//!
//! Layouts are reference-counted and identity-compared: two layouts are the
//! same type only if they are clones of one `RecordLayout`. Structural
//! equality is deliberately not offered — the registry keys containers by
//! layout identity, mirroring how a reflection provider hands out one
//! descriptor per registered type.
//!
//! ## Builder
//!
//! `LayoutBuilder` registers fields at explicit offsets and validates
//! bounds and overlap at `build()`. Nested layouts are projected: each leaf
//! field of the nested type is re-registered on the parent under a dotted
//! name with a shifted offset, so indices always work with leaf fields.

use std::rc::Rc;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

/// Classifies how a field's bytes are interpreted for hashing, ordering
/// and change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldArchetype {
    Bit,
    Int,
    Uint,
    Float,
    String,
    Block,
    InternedString,
    NestedObject,
    Vector,
}

impl FieldArchetype {
    /// Whether fields of this archetype may participate in an index.
    pub fn indexable(self) -> bool {
        !matches!(self, FieldArchetype::NestedObject | FieldArchetype::Vector)
    }
}

/// Dense per-layout field identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// One field of a record layout.
#[derive(Debug, Clone)]
pub struct Field {
    pub(crate) id: FieldId,
    pub(crate) name: Rc<str>,
    pub(crate) archetype: FieldArchetype,
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) bit_offset: u8,
    pub(crate) nested: Option<RecordLayout>,
}

impl Field {
    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archetype(&self) -> FieldArchetype {
        self.archetype
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bit position inside the byte, meaningful only for `Bit` fields.
    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    /// Layout of the nested object, present only for `NestedObject` fields.
    pub fn nested_layout(&self) -> Option<&RecordLayout> {
        self.nested.as_ref()
    }

    /// Slice of this field's bytes inside a record buffer.
    pub fn bytes_of<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[self.offset..self.offset + self.size]
    }

    /// Mutable slice of this field's bytes inside a record buffer.
    pub fn bytes_of_mut<'a>(&self, record: &'a mut [u8]) -> &'a mut [u8] {
        &mut record[self.offset..self.offset + self.size]
    }

    /// Whether two fields denote the same byte region interpretation.
    pub fn is_same(&self, other: &Field) -> bool {
        self.offset == other.offset
            && self.size == other.size
            && self.archetype == other.archetype
            && self.bit_offset == other.bit_offset
    }
}

struct LayoutInner {
    name: Rc<str>,
    object_size: usize,
    fields: Vec<Field>,
}

/// Immutable, reference-counted description of one record type.
#[derive(Clone)]
pub struct RecordLayout {
    inner: Rc<LayoutInner>,
}

impl RecordLayout {
    pub fn builder(name: &str, object_size: usize) -> LayoutBuilder {
        LayoutBuilder {
            name: name.into(),
            object_size,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn object_size(&self) -> usize {
        self.inner.object_size
    }

    pub fn field_count(&self) -> usize {
        self.inner.fields.len()
    }

    pub fn field(&self, id: FieldId) -> Option<&Field> {
        self.inner.fields.get(id.0 as usize)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.inner.fields.iter()
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.inner.fields.iter().find(|field| &*field.name == name)
    }

    /// Identity comparison: same registered type, not structural equality.
    pub fn is_same_type(&self, other: &RecordLayout) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable key for identity-based container maps.
    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

impl PartialEq for RecordLayout {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_type(other)
    }
}

impl Eq for RecordLayout {}

impl std::hash::Hash for RecordLayout {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl std::fmt::Debug for RecordLayout {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RecordLayout")
            .field("name", &self.inner.name)
            .field("object_size", &self.inner.object_size)
            .field("fields", &self.inner.fields.len())
            .finish()
    }
}

fn archetype_size_valid(archetype: FieldArchetype, size: usize) -> bool {
    match archetype {
        FieldArchetype::Bit => size == 1,
        FieldArchetype::Int | FieldArchetype::Uint => matches!(size, 1 | 2 | 4 | 8),
        FieldArchetype::Float => matches!(size, 4 | 8),
        FieldArchetype::InternedString => size == 8,
        FieldArchetype::String
        | FieldArchetype::Block
        | FieldArchetype::NestedObject
        | FieldArchetype::Vector => size > 0,
    }
}

/// Builds a `RecordLayout` from explicit field registrations.
pub struct LayoutBuilder {
    name: Rc<str>,
    object_size: usize,
    fields: Vec<Field>,
}

impl LayoutBuilder {
    fn push(
        &mut self,
        name: &str,
        archetype: FieldArchetype,
        offset: usize,
        size: usize,
        bit_offset: u8,
        nested: Option<RecordLayout>,
    ) -> Result<FieldId> {
        ensure!(
            archetype_size_valid(archetype, size),
            "field '{}': size {} is not valid for {:?}",
            name,
            size,
            archetype
        );
        ensure!(
            offset + size <= self.object_size,
            "field '{}': [{}..{}) exceeds object size {}",
            name,
            offset,
            offset + size,
            self.object_size
        );
        ensure!(
            bit_offset < 8,
            "field '{}': bit offset {} out of range",
            name,
            bit_offset
        );

        let id = FieldId(self.fields.len() as u32);
        self.fields.push(Field {
            id,
            name: name.into(),
            archetype,
            offset,
            size,
            bit_offset,
            nested,
        });
        Ok(id)
    }

    pub fn register_bit(&mut self, name: &str, offset: usize, bit_offset: u8) -> Result<FieldId> {
        self.push(name, FieldArchetype::Bit, offset, 1, bit_offset, None)
    }

    pub fn register_int(&mut self, name: &str, offset: usize, size: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::Int, offset, size, 0, None)
    }

    pub fn register_uint(&mut self, name: &str, offset: usize, size: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::Uint, offset, size, 0, None)
    }

    pub fn register_float(&mut self, name: &str, offset: usize, size: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::Float, offset, size, 0, None)
    }

    pub fn register_string(&mut self, name: &str, offset: usize, capacity: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::String, offset, capacity, 0, None)
    }

    pub fn register_block(&mut self, name: &str, offset: usize, size: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::Block, offset, size, 0, None)
    }

    pub fn register_interned_string(&mut self, name: &str, offset: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::InternedString, offset, 8, 0, None)
    }

    pub fn register_vector(&mut self, name: &str, offset: usize, size: usize) -> Result<FieldId> {
        self.push(name, FieldArchetype::Vector, offset, size, 0, None)
    }

    /// Registers a nested object and projects its leaf fields onto the
    /// parent under dotted names, so indices can reference them directly.
    /// Returns the id of the nested-object field itself.
    pub fn register_nested(
        &mut self,
        name: &str,
        offset: usize,
        nested: &RecordLayout,
    ) -> Result<FieldId> {
        let id = self.push(
            name,
            FieldArchetype::NestedObject,
            offset,
            nested.object_size(),
            0,
            Some(nested.clone()),
        )?;

        let projected: Vec<Field> = nested.fields().cloned().collect();
        for field in projected {
            let projected_name = format!("{}.{}", name, field.name);
            self.push(
                &projected_name,
                field.archetype,
                offset + field.offset,
                field.size,
                field.bit_offset,
                field.nested.clone(),
            )?;
        }

        Ok(id)
    }

    pub fn build(self) -> Result<RecordLayout> {
        // Overlap check over leaf fields only: projected leafs legitimately
        // share bytes with their enclosing nested-object field, and several
        // bit flags may share one byte.
        let mut claimed: Vec<(usize, usize, FieldArchetype, u8, &str)> = Vec::new();
        for field in &self.fields {
            if !field.archetype.indexable() {
                continue;
            }

            for (offset, size, archetype, bit, other) in &claimed {
                let disjoint =
                    field.offset + field.size <= *offset || *offset + *size <= field.offset;
                let shared_bit_byte = field.archetype == FieldArchetype::Bit
                    && *archetype == FieldArchetype::Bit
                    && field.offset == *offset
                    && field.bit_offset != *bit;

                if !disjoint && !shared_bit_byte {
                    bail!(
                        "layout '{}': fields '{}' and '{}' overlap",
                        self.name,
                        field.name,
                        other
                    );
                }
            }

            claimed.push((
                field.offset,
                field.size,
                field.archetype,
                field.bit_offset,
                &field.name,
            ));
        }

        Ok(RecordLayout {
            inner: Rc::new(LayoutInner {
                name: self.name,
                object_size: self.object_size,
                fields: self.fields,
            }),
        })
    }
}

/// Leaf fields of a layout that a given field list expands to: nested
/// object ids are replaced by their projected leaf ids.
pub(crate) fn resolve_leaf_fields(
    layout: &RecordLayout,
    ids: &[FieldId],
) -> Result<SmallVec<[Field; 4]>> {
    let mut leafs = SmallVec::new();
    for id in ids {
        let field = match layout.field(*id) {
            Some(field) => field.clone(),
            None => bail!("layout '{}' has no field {:?}", layout.name(), id),
        };

        match field.archetype {
            FieldArchetype::NestedObject => {
                // Projected leafs immediately follow the nested field.
                let nested = field.nested.as_ref().map_or(0, |n| n.field_count());
                for index in 0..nested {
                    let leaf = layout
                        .field(FieldId(field.id.0 + 1 + index as u32))
                        .cloned();
                    match leaf {
                        Some(leaf) if leaf.archetype.indexable() => leafs.push(leaf),
                        Some(leaf) => bail!(
                            "field '{}' of layout '{}' is not indexable",
                            leaf.name,
                            layout.name()
                        ),
                        None => bail!("nested projection of '{}' is incomplete", field.name),
                    }
                }
            }
            FieldArchetype::Vector => bail!(
                "field '{}' of layout '{}' is not indexable",
                field.name,
                layout.name()
            ),
            _ => leafs.push(field),
        }
    }
    Ok(leafs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> RecordLayout {
        let mut builder = RecordLayout::builder("unit", 32);
        builder.register_uint("id", 0, 8).unwrap();
        builder.register_int("health", 8, 4).unwrap();
        builder.register_float("mass", 12, 4).unwrap();
        builder.register_string("tag", 16, 8).unwrap();
        builder.register_bit("alive", 24, 0).unwrap();
        builder.register_bit("visible", 24, 1).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn builder_assigns_dense_field_ids() {
        let layout = sample_layout();
        assert_eq!(layout.field_count(), 6);
        assert_eq!(layout.field(FieldId(0)).unwrap().name(), "id");
        assert_eq!(layout.field(FieldId(4)).unwrap().name(), "alive");
    }

    #[test]
    fn builder_rejects_field_past_object_end() {
        let mut builder = RecordLayout::builder("bad", 8);
        let result = builder.register_uint("wide", 4, 8);
        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_overlapping_fields() {
        let mut builder = RecordLayout::builder("bad", 16);
        builder.register_uint("a", 0, 8).unwrap();
        builder.register_uint("b", 4, 8).unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn bit_fields_may_share_a_byte() {
        let layout = sample_layout();
        let alive = layout.field_by_name("alive").unwrap();
        let visible = layout.field_by_name("visible").unwrap();
        assert_eq!(alive.offset(), visible.offset());
        assert!(!alive.is_same(visible));
    }

    #[test]
    fn nested_registration_projects_leaf_fields() {
        let mut inner = RecordLayout::builder("vec2", 8);
        inner.register_float("x", 0, 4).unwrap();
        inner.register_float("y", 4, 4).unwrap();
        let inner = inner.build().unwrap();

        let mut builder = RecordLayout::builder("body", 24);
        builder.register_uint("id", 0, 8).unwrap();
        builder.register_nested("position", 8, &inner).unwrap();
        let layout = builder.build().unwrap();

        let x = layout.field_by_name("position.x").unwrap();
        assert_eq!(x.offset(), 8);
        assert_eq!(x.archetype(), FieldArchetype::Float);
        let y = layout.field_by_name("position.y").unwrap();
        assert_eq!(y.offset(), 12);
    }

    #[test]
    fn resolve_leaf_fields_expands_nested_objects() {
        let mut inner = RecordLayout::builder("vec2", 8);
        inner.register_float("x", 0, 4).unwrap();
        inner.register_float("y", 4, 4).unwrap();
        let inner = inner.build().unwrap();

        let mut builder = RecordLayout::builder("body", 24);
        builder.register_uint("id", 0, 8).unwrap();
        let position = builder.register_nested("position", 8, &inner).unwrap();
        let layout = builder.build().unwrap();

        let leafs = resolve_leaf_fields(&layout, &[position]).unwrap();
        assert_eq!(leafs.len(), 2);
        assert_eq!(leafs[0].name(), "position.x");
        assert_eq!(leafs[1].name(), "position.y");
    }

    #[test]
    fn layout_identity_is_reference_based() {
        let first = sample_layout();
        let second = sample_layout();
        assert!(first.is_same_type(&first.clone()));
        assert!(!first.is_same_type(&second));
    }
}
