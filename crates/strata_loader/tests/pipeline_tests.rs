//! Integration tests for the streaming pipeline

mod common;

use std::fs;
use std::sync::Arc;

use common::*;
use strata_loader::{
    FileSource, LoadError, LoadEvent, LoadOptions, LoadSession, LoadStage, MemorySource,
    MeshTopology, PipelineConfig, RootState, TextureConfig, TextureThrottler, TopologyTransfer,
};
use strata_scene::{BoundsTransfer, FragmentFlags, FragmentId, MeshKey, PackTransfer};

fn config(pool_capacity: usize) -> PipelineConfig {
    PipelineConfig {
        pool_capacity,
        ..PipelineConfig::default()
    }
}

fn throttler() -> Arc<TextureThrottler> {
    TextureThrottler::new(TextureConfig {
        ceiling: 2,
        memory_budget_bytes: 64 * 1024 * 1024,
    })
}

/// Three packs on a two-worker pool: two jobs go out initially, the
/// third is pulled by whichever worker frees up first.
#[test]
fn three_packs_on_two_workers_all_succeed() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(
            vec![
                PackTransfer { id: 0, uri: "pack0.bin".into() },
                PackTransfer { id: 1, uri: "pack1.bin".into() },
                PackTransfer { id: 2, uri: "pack2.bin".into() },
            ],
            vec![fragment(1, 10), fragment(2, 20), fragment(3, 30)],
        )),
    );
    source.insert("pack0.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));
    source.insert("pack1.bin", pack_bytes(vec![triangle_mesh(20, 2.0)]));
    source.insert("pack2.bin", pack_bytes(vec![triangle_mesh(30, 4.0)]));

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    // The pool never grew past the two initial dispatches.
    assert_eq!(session.worker_count(), 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, LoadEvent::GeometryLoaded { succeeded: 3, failed: 0 })));

    // Root-ready precedes geometry-complete.
    let root_at = events
        .iter()
        .position(|e| matches!(e, LoadEvent::RootLoaded { .. }))
        .unwrap();
    let geometry_at = events
        .iter()
        .position(|e| matches!(e, LoadEvent::GeometryLoaded { .. }))
        .unwrap();
    assert!(root_at < geometry_at);

    // All three fragments were activated and the index was installed.
    let state = sink.lock().unwrap();
    assert_eq!(state.activations.len(), 3);
    assert_eq!(state.index_sets, 1);
    assert_eq!(session.progress_percent(), 100.0);
    assert!(session.is_complete());
}

/// A descriptor with zero packs completes geometry immediately after
/// root-ready with zero pack jobs dispatched.
#[test]
fn zero_pack_scene_completes_after_root() {
    let mut base = manifest(vec![], vec![fragment(1, 10)]);
    base.embedded = vec![triangle_mesh(10, 0.0)];
    let mut source = MemorySource::new();
    source.insert("scene.json", manifest_bytes(&base));

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(4),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    assert!(events
        .iter()
        .any(|e| matches!(e, LoadEvent::GeometryLoaded { succeeded: 0, failed: 0 })));
    // Only the root worker ever existed.
    assert_eq!(session.worker_count(), 1);
    // The embedded mesh still activated its fragment.
    assert_eq!(sink.lock().unwrap().activations.len(), 1);
    assert_eq!(session.progress_percent(), 100.0);
}

/// One failing pack does not halt the rest: the load finishes visible,
/// with a single aggregated warning.
#[test]
fn partial_pack_failure_is_non_fatal() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(
            vec![
                PackTransfer { id: 0, uri: "good.bin".into() },
                PackTransfer { id: 1, uri: "missing.bin".into() },
            ],
            vec![fragment(1, 10), fragment(2, 20)],
        )),
    );
    source.insert("good.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    assert!(events
        .iter()
        .any(|e| matches!(e, LoadEvent::GeometryLoaded { succeeded: 1, failed: 1 })));
    let warnings: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, LoadEvent::PackWarning { .. }))
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(!session.is_failed());
    // Only the good pack's fragment activated.
    let state = sink.lock().unwrap();
    assert_eq!(state.activations.len(), 1);
    assert_eq!(state.activations[0].fragment, FragmentId::new(1));
}

/// A missing manifest is fatal: the load rejects and no partial model
/// remains.
#[test]
fn missing_manifest_fails_the_load() {
    let (collab, _) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(MemorySource::new()),
        throttler(),
        collab,
    )
    .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    let error = loop {
        match session.pump_blocking(std::time::Duration::from_millis(20)) {
            Ok(()) => assert!(std::time::Instant::now() < deadline, "no failure surfaced"),
            Err(e) => break e,
        }
    };
    assert!(matches!(error, LoadError::RootLoad(_)));
    assert!(session.is_failed());
    assert!(session.model().is_none());
    assert!(session.progress_percent() < 100.0);
}

#[test]
fn cancel_is_idempotent() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(vec![], vec![fragment(1, 10)])),
    );
    let (collab, _) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    session.cancel();
    session.cancel();
    assert!(session.is_cancelled());
    // Pumping after cancellation is a no-op, not an error.
    session.pump().unwrap();
    assert!(session.model().is_none());
}

/// Two fragments instancing the same mesh share one geometry record.
#[test]
fn instances_deduplicate_geometry() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(
            vec![PackTransfer { id: 0, uri: "pack0.bin".into() }],
            vec![fragment(1, 10), fragment(2, 10), fragment(3, 10)],
        )),
    );
    source.insert("pack0.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    assert_eq!(sink.lock().unwrap().activations.len(), 3);
    let model = session.model().unwrap();
    assert_eq!(model.geometry.len(), 1);
    assert_eq!(model.geometry.instance_count(MeshKey::new(10)), 3);
    assert!(model.fragments.is_active(FragmentId::new(2)));
}

#[test]
fn hidden_fragments_can_be_skipped() {
    let mut hidden = fragment(2, 10);
    hidden.flags = FragmentFlags::HIDDEN;
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(
            vec![PackTransfer { id: 0, uri: "pack0.bin".into() }],
            vec![fragment(1, 10), hidden],
        )),
    );
    source.insert("pack0.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        PipelineConfig {
            pool_capacity: 2,
            skip_hidden_fragments: true,
            ..PipelineConfig::default()
        },
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    let state = sink.lock().unwrap();
    assert_eq!(state.activations.len(), 1);
    assert_eq!(state.activations[0].fragment, FragmentId::new(1));
    let model = session.model().unwrap();
    assert!(!model.fragments.is_active(FragmentId::new(2)));
}

/// Progress is non-decreasing within each stage and only reaches 100 on
/// success.
#[test]
fn progress_is_monotonic_per_stage() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(
            vec![
                PackTransfer { id: 0, uri: "pack0.bin".into() },
                PackTransfer { id: 1, uri: "pack1.bin".into() },
            ],
            vec![fragment(1, 10), fragment(2, 20)],
        )),
    );
    source.insert("pack0.bin", pack_bytes(vec![triangle_mesh(10, 0.0)]));
    source.insert("pack1.bin", pack_bytes(vec![triangle_mesh(20, 2.0)]));

    let (collab, _) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    let mut last_overall = 0.0f32;
    for event in &events {
        if let LoadEvent::Progress { percent, stage } = event {
            match stage {
                LoadStage::Root | LoadStage::Geometry => {
                    assert!(*percent >= last_overall, "overall progress regressed");
                    last_overall = *percent;
                }
                LoadStage::Texture => {}
            }
        }
    }
    assert_eq!(last_overall, 100.0);
}

/// The worker-built spatial index is accepted without a consumer-side
/// rebuild.
#[test]
fn worker_supplied_index_is_adopted() {
    let mut base = manifest(
        vec![PackTransfer { id: 0, uri: "pack0.bin".into() }],
        vec![fragment(1, 10), fragment(2, 20)],
    );
    for f in &mut base.fragments {
        f.bounds = Some(BoundsTransfer {
            min: [0.0; 3],
            max: [1.0; 3],
        });
    }
    let mut source = MemorySource::new();
    source.insert("scene.json", manifest_bytes(&base));
    source.insert(
        "pack0.bin",
        pack_bytes(vec![triangle_mesh(10, 0.0), triangle_mesh(20, 2.0)]),
    );

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions {
            build_index_in_worker: true,
            ..LoadOptions::default()
        },
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    let model = session.model().unwrap();
    let index = model.spatial_index().unwrap();
    assert_eq!(index.primitive_count(), 2);
    assert_eq!(sink.lock().unwrap().index_sets, 1);
    // Authored bounds mean no renderer-side bounds recompute.
    assert!(sink
        .lock()
        .unwrap()
        .activations
        .iter()
        .all(|a| !a.recompute_bounds));
}

#[test]
fn topology_fetch_arrives_as_event() {
    let mut source = MemorySource::new();
    source.insert(
        "scene.json",
        manifest_bytes(&manifest(vec![], vec![fragment(1, 10)])),
    );
    source.insert(
        "topology.json",
        serde_json::to_vec(&TopologyTransfer {
            meshes: vec![MeshTopology {
                mesh_key: 10,
                edges: vec![0, 1, 1, 2],
            }],
        })
        .unwrap(),
    );

    let (collab, _) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "",
        LoadOptions::default(),
        config(2),
        Arc::new(source),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::RootLoaded { .. })
    });
    session.fetch_topology("topology.json").unwrap();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::Topology(_))
    });

    let topology = events
        .iter()
        .find_map(|e| match e {
            LoadEvent::Topology(t) => Some(t),
            _ => None,
        })
        .unwrap();
    assert_eq!(topology.meshes[0].mesh_key, 10);
    assert_eq!(session.root_state(), RootState::Ready);
}

/// End-to-end through the filesystem source, with pack uris resolved
/// against the package base path.
#[test]
fn file_source_loads_a_package_from_disk() {
    let dir = std::env::temp_dir().join(format!("strata_pkg_{}", std::process::id()));
    let geometry_dir = dir.join("geometry");
    fs::create_dir_all(&geometry_dir).unwrap();
    fs::write(
        dir.join("scene.json"),
        manifest_bytes(&manifest(
            vec![PackTransfer { id: 0, uri: "pack0.bin".into() }],
            vec![fragment(1, 10)],
        )),
    )
    .unwrap();
    fs::write(
        geometry_dir.join("pack0.bin"),
        pack_bytes(vec![triangle_mesh(10, 0.0)]),
    )
    .unwrap();

    let (collab, sink) = collaborators();
    let mut session = LoadSession::begin(
        "scene.json",
        "geometry",
        LoadOptions::default(),
        config(2),
        Arc::new(FileSource::with_query(&dir, "session=test")),
        throttler(),
        collab,
    )
    .unwrap();

    let mut events = Vec::new();
    drive_until(&mut session, &mut events, |e| {
        matches!(e, LoadEvent::GeometryLoaded { .. })
    });

    assert!(events
        .iter()
        .any(|e| matches!(e, LoadEvent::GeometryLoaded { succeeded: 1, failed: 0 })));
    assert_eq!(sink.lock().unwrap().activations.len(), 1);

    fs::remove_dir_all(&dir).ok();
}
