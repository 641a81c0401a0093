//! Shared fixtures for the pipeline integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use glam::Vec3;

use strata_loader::{
    Collaborators, LoadEvent, LoadSession, Manifest, MeshSink, NoopPropertySink, PackFile,
    PassthroughConverter,
};
use strata_scene::{
    Aabb, Bvh, BoundsTransfer, FragmentId, FragmentTransfer, GeometryRecord, IndexOptions,
    MatrixTransfer, MaterialTransfer, MeshTransfer, PackTransfer,
};

/// One recorded fragment activation
#[derive(Clone, Debug)]
pub struct ActivationRecord {
    pub fragment: FragmentId,
    pub mesh_key: u64,
    pub recompute_bounds: bool,
}

#[derive(Default)]
pub struct SinkState {
    pub activations: Vec<ActivationRecord>,
    pub index_sets: usize,
    pub repaints: usize,
}

/// Mesh sink that records everything the pipeline forwards
pub struct RecordingSink {
    pub state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<SinkState>>) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl MeshSink for RecordingSink {
    fn activate_fragment(
        &mut self,
        fragment: FragmentId,
        mesh: &Arc<GeometryRecord>,
        _world_transform: &glam::Mat4,
        recompute_bounds: bool,
    ) {
        self.state.lock().unwrap().activations.push(ActivationRecord {
            fragment,
            mesh_key: mesh.mesh_key.raw(),
            recompute_bounds,
        });
    }

    fn set_spatial_index(&mut self, _index: &Bvh, _options: &IndexOptions) {
        self.state.lock().unwrap().index_sets += 1;
    }

    fn invalidate_view(&mut self) {
        self.state.lock().unwrap().repaints += 1;
    }
}

pub fn collaborators() -> (Collaborators, Arc<Mutex<SinkState>>) {
    let (sink, state) = RecordingSink::new();
    (
        Collaborators {
            sink: Box::new(sink),
            converter: Arc::new(PassthroughConverter),
            properties: Arc::new(NoopPropertySink),
        },
        state,
    )
}

/// A unit triangle shifted along x so meshes are distinguishable
pub fn triangle_mesh(key: u64, offset: f32) -> MeshTransfer {
    let vertices = [
        offset, 0.0, 0.0, //
        offset + 1.0, 0.0, 0.0, //
        offset, 1.0, 0.0,
    ];
    let indices = [0u32, 1, 2];
    let bounds = Aabb::new(
        Vec3::new(offset, 0.0, 0.0),
        Vec3::new(offset + 1.0, 1.0, 0.0),
    );
    MeshTransfer::from_buffers(key, 3, &vertices, &indices, &bounds)
}

pub fn fragment(id: u32, mesh_key: u64) -> FragmentTransfer {
    FragmentTransfer {
        id,
        mesh_key,
        material: 0,
        transform: MatrixTransfer::identity(),
        flags: 0,
        bounds: None,
    }
}

pub fn pack_bytes(meshes: Vec<MeshTransfer>) -> Vec<u8> {
    PackFile { meshes }.encode().unwrap()
}

pub fn manifest(packs: Vec<PackTransfer>, fragments: Vec<FragmentTransfer>) -> Manifest {
    Manifest {
        bounds: BoundsTransfer {
            min: [0.0; 3],
            max: [10.0, 10.0, 1.0],
        },
        refpoint: None,
        unit_scale: 1.0,
        packs,
        fragments,
        materials: vec![MaterialTransfer {
            id: 0,
            name: "default".into(),
            base_color: [1.0; 4],
            transparent: false,
            texture_uri: None,
        }],
        cameras: vec![],
        embedded: vec![],
    }
}

pub fn manifest_bytes(manifest: &Manifest) -> Vec<u8> {
    serde_json::to_vec(manifest).unwrap()
}

/// Pump the session until the predicate matches an accumulated event,
/// collecting every event seen along the way
pub fn drive_until(
    session: &mut LoadSession,
    events: &mut Vec<LoadEvent>,
    predicate: impl Fn(&LoadEvent) -> bool,
) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        session
            .pump_blocking(std::time::Duration::from_millis(20))
            .expect("pump failed");
        let drained = session.poll_events();
        let hit = drained.iter().any(&predicate);
        events.extend(drained);
        if hit {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for event; saw {events:?}"
        );
    }
}
