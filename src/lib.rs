//! # Corral - Embedded Multi-Index Record Storage
//!
//! Corral is an in-memory storage engine for fixed-size records, built for
//! simulation loops that hammer the same record types every tick. This
//! implementation prioritizes:
//!
//! - **Stable record addresses**: Chunked pools, records never move
//! - **Zero allocation on the hot path**: Indices reuse their structures
//!   across editions
//! - **Fail-fast access discipline**: Reader/writer counters panic on
//!   protocol violations instead of corrupting data
//!
//! ## Quick Start
//!
//! ```ignore
//! use corral::layout::RecordLayout;
//! use corral::registry::Registry;
//!
//! let mut builder = RecordLayout::builder("unit", 16);
//! let id = builder.register_uint("id", 0, 8)?;
//! builder.register_int("health", 8, 4)?;
//! let layout = builder.build()?;
//!
//! let registry = Registry::new("world");
//! let insert = registry.insert_long_term(&layout);
//! let by_id = registry.fetch_value(&layout, &[id])?;
//!
//! insert.execute().insert()[0..8].copy_from_slice(&7u64.to_ne_bytes());
//!
//! let cursor = by_id.execute(&[&7u64.to_ne_bytes()[..]]);
//! assert!(cursor.current().is_some());
//! ```
//!
//! ## Architecture
//!
//! Corral uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (Registry/Query)     │
//! ├─────────────────────────────────────┤
//! │  Containers │ Event Triggers/Tracker │
//! ├─────────────┼───────────────────────┤
//! │  RecordStore (editions, cascades)    │
//! ├─────────────────────────────────────┤
//! │ Hash │ Ordered │ Volumetric │ Signal │
//! ├─────────────────────────────────────┤
//! │    Record Pools │ Record Layouts     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`layout`]: Record type descriptions, field registration, leaf
//!   projection of nested objects
//! - [`store`]: Record pools, the edition protocol, index lifecycle and
//!   cascading deletion
//! - [`index`]: The four index kinds and their read/edit cursors
//! - [`events`]: Event routes, copy-out baking and change tracking
//! - [`registry`]: Containers, prepared queries and event wiring

pub mod events;
pub mod index;
pub mod layout;
pub mod registry;
pub mod store;
