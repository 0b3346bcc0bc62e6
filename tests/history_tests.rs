//! End-to-end copies of object histories between in-memory images.

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{shifted_snap_map, MemoryImages};
use deepcopy_rs::models::{Layout, ObjectState, SNAP_HEAD};
use deepcopy_rs::scenario::{ParentImage, Scenario, ScenarioOp, Step};
use deepcopy_rs::{copy_object, CopyError, ObjectMap, ProgressCounter, ProgressHandler};
use std::sync::Arc;

fn scenario(object_size: u64, steps: Vec<Step>) -> Scenario {
    Scenario {
        object_size,
        stripe_unit: None,
        stripe_count: 1,
        object_number: 0,
        image_size: None,
        flatten: false,
        fast_diff: false,
        object_map: true,
        migrating: false,
        parent: None,
        steps,
    }
}

fn write(offset: u64, data: &[u8]) -> ScenarioOp {
    ScenarioOp::Write {
        offset,
        data: data.to_vec(),
    }
}

fn snapshot(ops: Vec<ScenarioOp>) -> Step {
    Step {
        ops,
        snapshot: true,
        ..Step::default()
    }
}

fn head(ops: Vec<ScenarioOp>) -> Step {
    Step {
        ops,
        ..Step::default()
    }
}

#[tokio::test]
async fn test_copy_matches_every_snapshot() {
    let images = MemoryImages::new(Layout::new(256), 1024);

    images.write(1, 0, &[1; 100]).await;
    images.snapshot(1);
    images.write(1, 50, &[2; 100]).await;
    images.snapshot(2);
    images.write(1, 200, &[3; 56]).await;

    let counter = Arc::new(ProgressCounter::new());
    let handler: Arc<dyn ProgressHandler> = counter.clone();
    let result = copy_object(
        images.src.clone(),
        images.dst.clone(),
        0,
        0,
        shifted_snap_map(&[1, 2]),
        1,
        false,
        Some(handler),
    )
    .await;
    assert!(result.is_ok(), "{:?}", result);

    for (src_snap, dst_snap) in [(1, 101), (2, 102), (SNAP_HEAD, SNAP_HEAD)] {
        assert_eq!(
            images.src_object(1, src_snap),
            images.dst_object(1, dst_snap),
            "snapshot {}",
            src_snap
        );
    }
    // only the changed bytes are read after the first snapshot
    assert_eq!(counter.bytes_read(), 100 + 100 + 56);
    assert_eq!(images.object_map.object_state(101, 1), ObjectState::Exists);
    assert_eq!(images.object_map.object_state(SNAP_HEAD, 1), ObjectState::Exists);
}

#[tokio::test]
async fn test_unchanged_snapshot_is_clean_with_fast_diff() {
    let images = MemoryImages::new(Layout::new(256), 1024);

    images.write(0, 0, &[9; 64]).await;
    images.snapshot(1);
    images.snapshot(2);

    let result = copy_object(
        images.src.clone(),
        images.dst.clone(),
        0,
        0,
        shifted_snap_map(&[1, 2]),
        0,
        false,
        None,
    )
    .await;
    assert!(result.is_ok(), "{:?}", result);

    assert_eq!(images.object_map.object_state(101, 0), ObjectState::Exists);
    assert_eq!(images.object_map.object_state(102, 0), ObjectState::ExistsClean);
    assert_eq!(images.object_map.object_state(SNAP_HEAD, 0), ObjectState::ExistsClean);
    assert_eq!(images.dst_object(0, 102), images.src_object(0, 2));
}

#[tokio::test]
async fn test_incremental_copy_from_snapshot() {
    let images = MemoryImages::new(Layout::new(256), 1024);

    images.write(2, 0, &[4; 128]).await;
    images.snapshot(1);

    let result = copy_object(
        images.src.clone(),
        images.dst.clone(),
        0,
        0,
        common::snap_map(&[(1, &[101])]),
        2,
        false,
        None,
    )
    .await;
    assert!(result.is_ok(), "{:?}", result);

    images.write(2, 64, &[5; 32]).await;
    let result = copy_object(
        images.src.clone(),
        images.dst.clone(),
        1,
        101,
        common::snap_map(&[(SNAP_HEAD, &[SNAP_HEAD, 101])]),
        2,
        false,
        None,
    )
    .await;
    assert!(result.is_ok(), "{:?}", result);

    assert_eq!(images.dst_object(2, 101), images.src_object(2, 1));
    assert_eq!(images.dst_object(2, SNAP_HEAD), images.src_object(2, SNAP_HEAD));
}

#[tokio::test]
async fn test_unwritten_object_has_nothing_to_copy() {
    let images = MemoryImages::new(Layout::new(256), 1024);
    images.write(0, 0, &[1; 8]).await;
    images.snapshot(1);

    let result = copy_object(
        images.src.clone(),
        images.dst.clone(),
        0,
        0,
        shifted_snap_map(&[1]),
        3,
        false,
        None,
    )
    .await;
    assert!(matches!(result, Err(CopyError::NothingToCopy)));
    assert!(images.dst_store.is_empty());
}

#[tokio::test]
async fn test_truncate_and_remove_history() {
    let report = scenario(
        128,
        vec![
            snapshot(vec![write(0, &[1; 128])]),
            snapshot(vec![ScenarioOp::Zero { offset: 16, length: 16 }]),
            snapshot(vec![ScenarioOp::Truncate { offset: 40 }]),
            snapshot(vec![ScenarioOp::Remove]),
            head(vec![write(100, &[2; 4])]),
        ],
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
    assert_eq!(report.snapshots.len(), 5);
    assert_eq!(report.snapshots[3].object_state, Some(ObjectState::Nonexistent));
    assert_eq!(report.snapshots[4].object_state, Some(ObjectState::Exists));
}

#[tokio::test]
async fn test_shrink_below_object_then_grow() {
    let mut steps = vec![snapshot(vec![write(0, &[7; 64])])];
    steps.push(Step {
        image_size: Some(64),
        snapshot: true,
        ..Step::default()
    });
    steps.push(Step {
        image_size: Some(128),
        ops: vec![write(8, &[8; 8])],
        ..Step::default()
    });
    let report = Scenario {
        object_number: 1,
        ..scenario(64, steps)
    }
    .run()
    .await
    .unwrap();

    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
    assert_eq!(report.snapshots[1].object_state, Some(ObjectState::Nonexistent));
}

#[tokio::test]
async fn test_striped_object_history() {
    let report = Scenario {
        stripe_unit: Some(16),
        stripe_count: 4,
        object_number: 2,
        fast_diff: true,
        ..scenario(
            64,
            vec![
                snapshot(vec![write(0, &[1; 40])]),
                snapshot(vec![write(30, &[2; 20]), ScenarioOp::Zero { offset: 4, length: 8 }]),
                head(vec![ScenarioOp::Truncate { offset: 20 }]),
            ],
        )
    }
    .run()
    .await
    .unwrap();

    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
}

#[tokio::test]
async fn test_clone_history_with_and_without_flatten() {
    for flatten in [false, true] {
        let report = Scenario {
            flatten,
            parent: Some(ParentImage {
                data: vec![0x11; 128],
                overlap: None,
            }),
            ..scenario(
                64,
                vec![
                    snapshot(vec![write(8, &[2; 8])]),
                    head(vec![write(40, &[3; 4])]),
                ],
            )
        }
        .run()
        .await
        .unwrap();

        assert_eq!(report.result_code, 0, "flatten={}", flatten);
        assert!(report.matches, "flatten={}: {:#?}", flatten, report);
    }
}

#[tokio::test]
async fn test_flatten_inherited_object() {
    let parent = ParentImage {
        data: (0..128u32).map(|i| (i % 251 + 1) as u8).collect(),
        overlap: Some(100),
    };

    let report = Scenario {
        flatten: true,
        object_number: 1,
        parent: Some(parent.clone()),
        ..scenario(64, vec![snapshot(vec![])])
    }
    .run()
    .await
    .unwrap();
    assert_eq!(report.result_code, 0);
    assert!(report.matches, "{:#?}", report);
    assert!(report.bytes_read > 0);

    let report = Scenario {
        object_number: 1,
        parent: Some(parent),
        ..scenario(64, vec![snapshot(vec![])])
    }
    .run()
    .await
    .unwrap();
    assert_eq!(report.result_code, -2);
    assert!(report.matches, "{:#?}", report);
}

#[tokio::test]
async fn test_migration_copy_is_idempotent() {
    let images = MemoryImages::new(Layout::new(128), 512);
    images.write(0, 0, &[6; 32]).await;
    images.snapshot(1);
    images.write(0, 16, &[7; 32]).await;

    let dst = Arc::new(
        deepcopy_rs::ImageCtxBuilder::new("dst")
            .layout(images.layout)
            .size(512)
            .migrating(true)
            .data_ctx(images.dst_store.clone())
            .build(),
    );
    dst.snap_create(101).unwrap();

    for _ in 0..2 {
        let result = copy_object(
            images.src.clone(),
            dst.clone(),
            0,
            0,
            shifted_snap_map(&[1]),
            0,
            false,
            None,
        )
        .await;
        assert!(result.is_ok(), "{:?}", result);
    }

    assert_eq!(images.dst_object(0, 101), images.src_object(0, 1));
    assert_eq!(images.dst_object(0, SNAP_HEAD), images.src_object(0, SNAP_HEAD));
}

const OBJECT_SIZE: u64 = 64;
const IMAGE_SIZES: [u64; 4] = [64, 100, 128, 160];

/// Object bytes inside an image of `size` bytes, for object 1.
fn visible_len(size: u64) -> u64 {
    size.saturating_sub(OBJECT_SIZE).min(OBJECT_SIZE)
}

fn random_op(rng: &mut StdRng, visible: u64) -> ScenarioOp {
    match rng.gen_range(0..10) {
        0..=4 => {
            let offset = rng.gen_range(0..visible);
            let length = rng.gen_range(1..=visible - offset);
            let data = (0..length).map(|_| rng.gen_range(1..=255u8)).collect();
            ScenarioOp::Write { offset, data }
        }
        5 | 6 => {
            let offset = rng.gen_range(0..visible);
            let length = rng.gen_range(1..=visible - offset);
            ScenarioOp::Zero { offset, length }
        }
        7 | 8 => ScenarioOp::Truncate {
            offset: rng.gen_range(0..=visible),
        },
        _ => ScenarioOp::Remove,
    }
}

fn random_scenario(seed: u64) -> Scenario {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut size = 128;
    let mut steps = Vec::new();
    for _ in 0..rng.gen_range(2..7) {
        let mut step = Step {
            snapshot: rng.gen_bool(0.7),
            ..Step::default()
        };
        if rng.gen_bool(0.2) {
            size = IMAGE_SIZES[rng.gen_range(0..IMAGE_SIZES.len())];
            step.image_size = Some(size);
        }
        let visible = visible_len(size);
        if visible > 0 {
            for _ in 0..rng.gen_range(0..4) {
                step.ops.push(random_op(&mut rng, visible));
            }
        }
        steps.push(step);
    }

    Scenario {
        object_number: 1,
        fast_diff: rng.gen_bool(0.5),
        ..scenario(OBJECT_SIZE, steps)
    }
}

#[tokio::test]
async fn test_random_histories() {
    for seed in 0..64 {
        let scenario = random_scenario(seed);
        let report = scenario.run().await.unwrap();
        assert!(
            report.is_success(),
            "seed {}: result {} for {:#?}",
            seed,
            report.result_code,
            scenario
        );
        assert!(
            report.matches,
            "seed {}: {:#?}\n{:#?}",
            seed,
            report,
            scenario
        );
    }
}
