//! Plain-data structs that cross the decode-worker boundary
//!
//! Everything a worker sends back is serialized, so rich value types
//! (boxes, matrices, cameras) arrive as raw arrays and must be restored
//! on receipt. The `restore` methods here are the only place that
//! reconstruction happens.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bounds::Aabb;
use crate::descriptor::{Camera, Material, MaterialId, PackId, PackRef};
use crate::fragment::{Fragment, FragmentFlags, FragmentId};
use crate::geometry::MeshKey;

/// Errors raised while restoring transferred payloads
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("vertex buffer of {len} bytes is not a whole number of {stride}-float vertices")]
    BadVertexBuffer { len: usize, stride: u32 },

    #[error("index buffer of {0} bytes is not a whole number of u32 indices")]
    BadIndexBuffer(usize),

    #[error("index {index} out of range for {vertices} vertices")]
    IndexOutOfRange { index: u32, vertices: usize },

    #[error("mesh {0:?} carries an empty vertex buffer")]
    EmptyMesh(MeshKey),
}

/// Bounding box as raw corners
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BoundsTransfer {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundsTransfer {
    pub fn from_bounds(bounds: &Aabb) -> Self {
        Self {
            min: bounds.min.to_array(),
            max: bounds.max.to_array(),
        }
    }

    pub fn restore(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
    }
}

/// Column-major 4x4 matrix as raw columns
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MatrixTransfer(pub [[f32; 4]; 4]);

impl MatrixTransfer {
    pub fn identity() -> Self {
        Self::from_matrix(&Mat4::IDENTITY)
    }

    pub fn from_matrix(matrix: &Mat4) -> Self {
        Self(matrix.to_cols_array_2d())
    }

    pub fn restore(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.0)
    }
}

impl Default for MatrixTransfer {
    fn default() -> Self {
        Self::identity()
    }
}

/// Camera as raw vectors; restored with repair against the scene bounds
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraTransfer {
    pub position: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    pub fov_y_deg: f32,
}

impl CameraTransfer {
    fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.target.iter().all(|v| v.is_finite())
            && self.up.iter().all(|v| v.is_finite())
            && self.fov_y_deg.is_finite()
    }

    /// Restore the camera, replacing any non-finite camera with one
    /// framing the scene bounds
    pub fn restore(&self, scene_bounds: &Aabb) -> Camera {
        if !self.is_finite() {
            return Camera::framing(scene_bounds);
        }
        Camera {
            position: Vec3::from_array(self.position),
            target: Vec3::from_array(self.target),
            up: Vec3::from_array(self.up),
            fov_y_deg: self.fov_y_deg,
        }
    }
}

/// One placed instance as raw data
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FragmentTransfer {
    pub id: u32,
    pub mesh_key: u64,
    pub material: u32,
    pub transform: MatrixTransfer,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub bounds: Option<BoundsTransfer>,
}

impl FragmentTransfer {
    pub fn restore(&self) -> Fragment {
        Fragment {
            id: FragmentId::new(self.id),
            mesh_key: MeshKey::new(self.mesh_key),
            material: MaterialId::new(self.material),
            transform: self.transform.restore(),
            flags: FragmentFlags(self.flags),
            bounds: self.bounds.as_ref().map(BoundsTransfer::restore),
        }
    }
}

/// One geometry-pack entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackTransfer {
    pub id: u32,
    pub uri: String,
}

impl PackTransfer {
    pub fn restore(&self) -> PackRef {
        PackRef {
            id: PackId::new(self.id),
            uri: self.uri.clone(),
            loading: false,
        }
    }
}

/// One material description
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterialTransfer {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_base_color")]
    pub base_color: [f32; 4],
    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub texture_uri: Option<String>,
}

fn default_base_color() -> [f32; 4] {
    [1.0, 1.0, 1.0, 1.0]
}

impl MaterialTransfer {
    pub fn restore(&self) -> Material {
        Material {
            id: MaterialId::new(self.id),
            name: self.name.clone(),
            base_color: self.base_color,
            transparent: self.transparent,
            texture_uri: self.texture_uri.clone(),
        }
    }
}

/// One decoded mesh: raw little-endian buffers plus bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshTransfer {
    pub mesh_key: u64,
    pub polygon_count: u32,
    pub bounds: BoundsTransfer,
    /// Floats per vertex (position-only meshes use 3)
    pub vertex_stride: u32,
    pub vertex_data: Vec<u8>,
    pub index_data: Vec<u8>,
}

impl MeshTransfer {
    /// Build a transfer from typed buffers
    pub fn from_buffers(
        mesh_key: u64,
        vertex_stride: u32,
        vertices: &[f32],
        indices: &[u32],
        bounds: &Aabb,
    ) -> Self {
        Self {
            mesh_key,
            polygon_count: (indices.len() / 3) as u32,
            bounds: BoundsTransfer::from_bounds(bounds),
            vertex_stride,
            vertex_data: bytemuck::cast_slice(vertices).to_vec(),
            index_data: bytemuck::cast_slice(indices).to_vec(),
        }
    }
}

/// Flattened spatial-index node as raw data
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NodeTransfer {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub left: u32,
    pub right: u32,
    pub flags: u32,
}

/// A spatial index built on the worker side
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexTransfer {
    pub nodes: Vec<NodeTransfer>,
    pub primitives: Vec<u32>,
}

/// The fully decoded scene as raw data
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneTransfer {
    pub bounds: BoundsTransfer,
    pub global_offset: [f32; 3],
    pub unit_scale: f32,
    pub placement: Option<MatrixTransfer>,
    pub fragments: Vec<FragmentTransfer>,
    pub packs: Vec<PackTransfer>,
    pub materials: Vec<MaterialTransfer>,
    pub cameras: Vec<CameraTransfer>,
    /// Meshes delivered inline with the scene (packless packages)
    #[serde(default)]
    pub embedded: Vec<MeshTransfer>,
}
