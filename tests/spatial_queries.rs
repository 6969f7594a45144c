//! # Spatial Query Test Suite
//!
//! Volumetric index behavior on a two-dimensional extent type, checked
//! against brute-force scans over the same data.
//!
//! ## Test Categories
//!
//! 1. **Shape Tests**: Closed-interval overlap, touching edges included
//! 2. **Ray Tests**: Distance budgets, interior origins, axis-parallel rays
//! 3. **Randomized Tests**: Seeded query storms vs an O(n) reference scan
//! 4. **Mutation Tests**: Extent edits and region deletes through cursors

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corral::index::volumetric::Dimension;
use corral::layout::RecordLayout;
use corral::registry::Registry;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const ID: std::ops::Range<usize> = 0..8;

fn extent_layout() -> RecordLayout {
    let mut builder = RecordLayout::builder("extent", 40);
    builder.register_uint("id", 0, 8).unwrap();
    builder.register_float("min_x", 8, 8).unwrap();
    builder.register_float("max_x", 16, 8).unwrap();
    builder.register_float("min_y", 24, 8).unwrap();
    builder.register_float("max_y", 32, 8).unwrap();
    builder.build().unwrap()
}

fn dimensions(layout: &RecordLayout) -> [Dimension; 2] {
    let id_of = |name: &str| layout.field_by_name(name).unwrap().id();
    [
        Dimension {
            min_field: id_of("min_x"),
            max_field: id_of("max_x"),
        },
        Dimension {
            min_field: id_of("min_y"),
            max_field: id_of("max_y"),
        },
    ]
}

#[derive(Clone, Copy)]
struct Box2 {
    id: u64,
    min: [f64; 2],
    max: [f64; 2],
}

fn write_box(record: &mut [u8], value: &Box2) {
    record[ID].copy_from_slice(&value.id.to_ne_bytes());
    record[8..16].copy_from_slice(&value.min[0].to_ne_bytes());
    record[16..24].copy_from_slice(&value.max[0].to_ne_bytes());
    record[24..32].copy_from_slice(&value.min[1].to_ne_bytes());
    record[32..40].copy_from_slice(&value.max[1].to_ne_bytes());
}

fn read_id(record: &[u8]) -> u64 {
    u64::from_ne_bytes(record[ID].try_into().unwrap())
}

fn insert_boxes(registry: &Registry, layout: &RecordLayout, boxes: &[Box2]) {
    let insert = registry.insert_long_term(layout);
    let mut inserter = insert.execute();
    for value in boxes {
        write_box(inserter.insert(), value);
    }
}

fn shape_overlaps(value: &Box2, min: &[f64; 2], max: &[f64; 2]) -> bool {
    (0..2).all(|axis| value.min[axis] <= max[axis] && min[axis] <= value.max[axis])
}

fn ray_hits(value: &Box2, origin: &[f64; 2], direction: &[f64; 2], max_distance: f64) -> bool {
    let mut enter = 0.0f64;
    let mut exit = f64::INFINITY;
    for axis in 0..2 {
        if direction[axis] == 0.0 {
            if origin[axis] < value.min[axis] || origin[axis] > value.max[axis] {
                return false;
            }
            continue;
        }
        let t_near = (value.min[axis] - origin[axis]) / direction[axis];
        let t_far = (value.max[axis] - origin[axis]) / direction[axis];
        let (near, far) = if t_near <= t_far {
            (t_near, t_far)
        } else {
            (t_far, t_near)
        };
        enter = enter.max(near);
        exit = exit.min(far);
    }
    if enter > exit {
        return false;
    }
    let length = (direction[0] * direction[0] + direction[1] * direction[1]).sqrt();
    enter * length <= max_distance
}

fn collect_ids(cursor: &mut corral::index::volumetric::VolumetricReadCursor) -> Vec<u64> {
    let mut ids = Vec::new();
    while let Some(record) = cursor.current() {
        ids.push(read_id(record));
        cursor.advance();
    }
    ids.sort_unstable();
    ids
}

// ============================================================================
// SHAPE TESTS
// ============================================================================

#[test]
fn shape_overlap_includes_touching_edges() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_shape_intersection(&layout, &dimensions(&layout))
        .unwrap();
    insert_boxes(
        &registry,
        &layout,
        &[
            Box2 { id: 1, min: [0.0, 0.0], max: [2.0, 2.0] },
            Box2 { id: 2, min: [2.0, 2.0], max: [4.0, 4.0] },
            Box2 { id: 3, min: [5.0, 5.0], max: [6.0, 6.0] },
        ],
    );

    // The query corner exactly touches box 2 and overlaps box 1.
    let mut cursor = fetch.execute(&[1.0, 1.0], &[2.0, 2.0]);
    assert_eq!(collect_ids(&mut cursor), vec![1, 2]);
}

// ============================================================================
// RAY TESTS
// ============================================================================

#[test]
fn ray_respects_distance_budget() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_ray_intersection(&layout, &dimensions(&layout))
        .unwrap();
    insert_boxes(
        &registry,
        &layout,
        &[
            Box2 { id: 1, min: [2.0, -1.0], max: [3.0, 1.0] },
            Box2 { id: 2, min: [8.0, -1.0], max: [9.0, 1.0] },
        ],
    );

    let mut near = fetch.execute(&[0.0, 0.0], &[1.0, 0.0], 5.0);
    assert_eq!(collect_ids(&mut near), vec![1]);

    let mut far = fetch.execute(&[0.0, 0.0], &[1.0, 0.0], 10.0);
    assert_eq!(collect_ids(&mut far), vec![1, 2]);

    // Scaling the direction scales the travelled distance the same way.
    let mut scaled = fetch.execute(&[0.0, 0.0], &[2.0, 0.0], 5.0);
    assert_eq!(collect_ids(&mut scaled), vec![1]);
}

#[test]
fn ray_from_inside_an_extent_hits_it_at_distance_zero() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_ray_intersection(&layout, &dimensions(&layout))
        .unwrap();
    insert_boxes(
        &registry,
        &layout,
        &[Box2 { id: 1, min: [-1.0, -1.0], max: [1.0, 1.0] }],
    );

    let mut cursor = fetch.execute(&[0.0, 0.0], &[0.0, 1.0], 0.0);
    assert_eq!(collect_ids(&mut cursor), vec![1]);
}

#[test]
fn axis_parallel_ray_requires_containment_on_the_flat_axis() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_ray_intersection(&layout, &dimensions(&layout))
        .unwrap();
    insert_boxes(
        &registry,
        &layout,
        &[
            Box2 { id: 1, min: [3.0, -1.0], max: [4.0, 1.0] },
            Box2 { id: 2, min: [3.0, 2.0], max: [4.0, 3.0] },
        ],
    );

    let mut cursor = fetch.execute(&[0.0, 0.0], &[1.0, 0.0], 100.0);
    assert_eq!(collect_ids(&mut cursor), vec![1]);
}

// ============================================================================
// RANDOMIZED TESTS
// ============================================================================

#[test]
fn random_queries_match_reference_scan() {
    fn random_extent(rng: &mut StdRng) -> ([f64; 2], [f64; 2]) {
        let mut min = [0.0; 2];
        let mut max = [0.0; 2];
        for axis in 0..2 {
            let a: f64 = rng.gen_range(-50.0..50.0);
            let b: f64 = rng.gen_range(-50.0..50.0);
            min[axis] = a.min(b);
            max[axis] = a.max(b);
        }
        (min, max)
    }
    let mut rng = StdRng::seed_from_u64(0x5eed_0002);

    // Five independent datasets, 200 randomized queries each: 1000
    // distinct query configurations against the reference scan.
    for _ in 0..5 {
        let registry = Registry::new("spatial");
        let layout = extent_layout();
        let shapes = registry
            .fetch_shape_intersection(&layout, &dimensions(&layout))
            .unwrap();
        let rays = registry
            .fetch_ray_intersection(&layout, &dimensions(&layout))
            .unwrap();

        let boxes: Vec<Box2> = (0..300)
            .map(|id| {
                let (min, max) = random_extent(&mut rng);
                Box2 { id, min, max }
            })
            .collect();
        insert_boxes(&registry, &layout, &boxes);

        for _ in 0..100 {
            let (min, max) = random_extent(&mut rng);
            let mut expected: Vec<u64> = boxes
                .iter()
                .filter(|value| shape_overlaps(value, &min, &max))
                .map(|value| value.id)
                .collect();
            expected.sort_unstable();
            let mut cursor = shapes.execute(&min, &max);
            assert_eq!(collect_ids(&mut cursor), expected);
        }

        for _ in 0..100 {
            let origin = [rng.gen_range(-60.0..60.0), rng.gen_range(-60.0..60.0)];
            let direction = match rng.gen_range(0..4) {
                0 => [rng.gen_range(0.1..2.0), 0.0],
                1 => [0.0, rng.gen_range(-2.0..-0.1)],
                _ => [rng.gen_range(-2.0..2.0), rng.gen_range(0.1..2.0)],
            };
            let max_distance: f64 = rng.gen_range(1.0..120.0);

            let mut expected: Vec<u64> = boxes
                .iter()
                .filter(|value| ray_hits(value, &origin, &direction, max_distance))
                .map(|value| value.id)
                .collect();
            expected.sort_unstable();
            let mut cursor = rays.execute(&origin, &direction, max_distance);
            assert_eq!(collect_ids(&mut cursor), expected);
        }
    }
}

// ============================================================================
// MUTATION TESTS
// ============================================================================

#[test]
fn extent_edits_take_effect_without_reinsertion() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_shape_intersection(&layout, &dimensions(&layout))
        .unwrap();
    let modify = registry
        .modify_shape_intersection(&layout, &dimensions(&layout))
        .unwrap();
    insert_boxes(
        &registry,
        &layout,
        &[Box2 { id: 1, min: [0.0, 0.0], max: [1.0, 1.0] }],
    );

    {
        let mut cursor = modify.execute(&[0.0, 0.0], &[10.0, 10.0]);
        let record = cursor.current_mut().unwrap();
        record[8..16].copy_from_slice(&20.0f64.to_ne_bytes());
        record[16..24].copy_from_slice(&21.0f64.to_ne_bytes());
    }

    let mut old_region = fetch.execute(&[0.0, 0.0], &[10.0, 10.0]);
    assert!(old_region.current().is_none());
    let mut new_region = fetch.execute(&[20.0, 0.0], &[21.0, 1.0]);
    assert_eq!(collect_ids(&mut new_region), vec![1]);
}

#[test]
fn region_delete_removes_exactly_the_intersecting_extents() {
    let registry = Registry::new("spatial");
    let layout = extent_layout();
    let fetch = registry
        .fetch_shape_intersection(&layout, &dimensions(&layout))
        .unwrap();
    let modify = registry
        .modify_shape_intersection(&layout, &dimensions(&layout))
        .unwrap();

    let boxes: Vec<Box2> = (0..10)
        .map(|id| Box2 {
            id,
            min: [id as f64 * 3.0, 0.0],
            max: [id as f64 * 3.0 + 2.0, 1.0],
        })
        .collect();
    insert_boxes(&registry, &layout, &boxes);

    // Clear everything whose extent reaches into x <= 10.
    {
        let mut cursor = modify.execute(&[0.0, 0.0], &[10.0, 1.0]);
        while cursor.current().is_some() {
            cursor.delete_current();
        }
    }

    let mut survivors = fetch.execute(&[-100.0, -100.0], &[100.0, 100.0]);
    assert_eq!(collect_ids(&mut survivors), vec![4, 5, 6, 7, 8, 9]);
}
