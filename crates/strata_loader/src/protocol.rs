//! Decode wire protocol between the consumer and its workers
//!
//! Requests and responses are plain serializable data; nothing richer
//! crosses the boundary. The root decode is a strict two-round exchange:
//! the worker first returns the parsed manifest, the consumer echoes it
//! back to the same worker, and only then does the full scene decode
//! proceed. No geometry job is dispatched before the continuation round
//! completes.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use strata_scene::{
    Bvh, BvhPrimitive, BoundsTransfer, CameraTransfer, FragmentTransfer, IndexOptions,
    IndexTransfer, MatrixTransfer, MaterialTransfer, MeshTransfer, PackTransfer, SceneTransfer,
};

use crate::error::WireError;
use crate::source::ResourceSource;

/// Parsed top-level manifest of a scene package
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub bounds: BoundsTransfer,
    #[serde(default)]
    pub refpoint: Option<[f32; 3]>,
    #[serde(default = "default_unit_scale")]
    pub unit_scale: f32,
    #[serde(default)]
    pub packs: Vec<PackTransfer>,
    pub fragments: Vec<FragmentTransfer>,
    #[serde(default)]
    pub materials: Vec<MaterialTransfer>,
    #[serde(default)]
    pub cameras: Vec<CameraTransfer>,
    #[serde(default)]
    pub embedded: Vec<MeshTransfer>,
}

fn default_unit_scale() -> f32 {
    1.0
}

/// Root decode request parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootRequest {
    pub url: String,
    pub base_path: String,
    pub id_filter: Option<Vec<u32>>,
    pub global_offset: Option<[f32; 3]>,
    pub apply_refpoint: bool,
    pub unit_scale: Option<f32>,
    pub placement: Option<MatrixTransfer>,
    pub build_index_in_worker: bool,
    pub index_options: IndexOptions,
}

/// Operations a decode worker accepts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DecodeRequest {
    /// First root round: fetch and parse the manifest
    LoadRoot(RootRequest),
    /// Continuation round: resume the root decode with the echoed
    /// manifest
    ResumeRoot { manifest: Manifest },
    /// Stream one geometry pack
    LoadPack { pack: PackTransfer },
    /// Auxiliary topology fetch
    FetchTopology { uri: String },
    Shutdown,
}

/// Payloads a decode worker sends back
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DecodeResponse {
    Manifest(Manifest),
    Scene(Box<SceneTransfer>),
    SpatialIndex(IndexTransfer),
    Mesh {
        pack: u32,
        mesh: MeshTransfer,
    },
    PackDone {
        pack: u32,
        mesh_count: u32,
    },
    Progress(f32),
    Debug(String),
    Topology(TopologyTransfer),
    Error(WireError),
}

impl DecodeResponse {
    /// Whether this response settles the job that produced it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_)
                | Self::Scene(_)
                | Self::PackDone { .. }
                | Self::Topology(_)
                | Self::Error(_)
        )
    }
}

/// Geometry pack container: a bincode frame of transferred meshes
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackFile {
    pub meshes: Vec<MeshTransfer>,
}

impl PackFile {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::pack(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::pack(e.to_string()))
    }
}

/// Edge topology for a set of meshes, fetched on demand
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyTransfer {
    pub meshes: Vec<MeshTopology>,
}

/// Edge index pairs for one mesh
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshTopology {
    pub mesh_key: u64,
    pub edges: Vec<u32>,
}

/// First root round: fetch the package root and parse its manifest
pub fn decode_root(
    source: &dyn ResourceSource,
    request: &RootRequest,
) -> Result<Manifest, WireError> {
    let bytes = source.fetch(&source.resolve(&request.url))?;
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|e| WireError::manifest(e.to_string()))?;
    if manifest.fragments.is_empty() && manifest.packs.is_empty() && manifest.embedded.is_empty() {
        return Err(WireError::manifest("package describes no geometry"));
    }
    Ok(manifest)
}

/// Continuation round: finish the root decode into a scene transfer,
/// applying the id filter, global offset, refpoint and unit scaling
pub fn resume_root(
    request: &RootRequest,
    manifest: Manifest,
) -> (SceneTransfer, Option<IndexTransfer>) {
    let offset = request
        .global_offset
        .or(if request.apply_refpoint {
            manifest.refpoint
        } else {
            None
        })
        .unwrap_or([0.0; 3]);
    let offset_vec = Vec3::from_array(offset);
    let scale = request.unit_scale.unwrap_or(manifest.unit_scale);
    let adjust = Mat4::from_scale(Vec3::splat(scale)) * Mat4::from_translation(-offset_vec);

    let mut fragments = manifest.fragments;
    if let Some(filter) = &request.id_filter {
        fragments.retain(|f| filter.contains(&f.id));
    }
    for fragment in &mut fragments {
        fragment.transform = MatrixTransfer::from_matrix(&(adjust * fragment.transform.restore()));
        if let Some(bounds) = fragment.bounds {
            let adjusted = bounds.restore().translated(-offset_vec).scaled(scale);
            fragment.bounds = Some(BoundsTransfer::from_bounds(&adjusted));
        }
    }

    let bounds = manifest.bounds.restore().translated(-offset_vec).scaled(scale);

    let packs: Vec<PackTransfer> = manifest
        .packs
        .into_iter()
        .map(|mut pack| {
            if !request.base_path.is_empty() {
                pack.uri = format!("{}/{}", request.base_path.trim_end_matches('/'), pack.uri);
            }
            pack
        })
        .collect();

    let index = if request.build_index_in_worker {
        build_worker_index(&fragments, &manifest.materials, &request.index_options)
    } else {
        None
    };

    let scene = SceneTransfer {
        bounds: BoundsTransfer::from_bounds(&bounds),
        global_offset: offset,
        unit_scale: scale,
        placement: request.placement,
        fragments,
        packs,
        materials: manifest.materials,
        cameras: manifest.cameras,
        embedded: manifest.embedded,
    };
    (scene, index)
}

/// Build the spatial index on the worker side when every fragment
/// carries authored bounds; otherwise the consumer builds it later from
/// decoded geometry
fn build_worker_index(
    fragments: &[FragmentTransfer],
    materials: &[MaterialTransfer],
    options: &IndexOptions,
) -> Option<IndexTransfer> {
    if fragments.is_empty() || fragments.iter().any(|f| f.bounds.is_none()) {
        return None;
    }
    let primitives: Vec<BvhPrimitive> = fragments
        .iter()
        .filter_map(|f| {
            Some(BvhPrimitive {
                fragment: strata_scene::FragmentId::new(f.id),
                bounds: f.bounds.as_ref()?.restore(),
                transparent: materials
                    .iter()
                    .find(|m| m.id == f.material)
                    .map(|m| m.transparent)
                    .unwrap_or(false),
            })
        })
        .collect();
    Some(Bvh::build(&primitives, options).to_transfer())
}

/// Fetch and decode one geometry pack
pub fn decode_pack(
    source: &dyn ResourceSource,
    pack: &PackTransfer,
) -> Result<PackFile, WireError> {
    let bytes = source.fetch(&source.resolve(&pack.uri))?;
    PackFile::decode(&bytes)
}

/// Fetch and decode a topology sidecar
pub fn decode_topology(
    source: &dyn ResourceSource,
    uri: &str,
) -> Result<TopologyTransfer, WireError> {
    let bytes = source.fetch(&source.resolve(uri))?;
    serde_json::from_slice(&bytes).map_err(|e| WireError::new(WireError::TOPOLOGY, e.to_string()))
}
