//! Scene descriptor: the decoded root structure of a scene package
//!
//! Produced once per model by the root loader and treated as immutable
//! afterwards, with one exception: the placement transform may be
//! replaced late, which invalidates any derived spatial index.

use std::collections::HashMap;

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::fragment::{Fragment, FragmentId};
use crate::geometry::MeshKey;
use crate::transfer::SceneTransfer;

/// Identifier of a geometry pack within a package
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackId(pub u32);

impl PackId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Identifier of a material within the materials block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub u32);

impl MaterialId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// One geometry pack reference; `loading` flips as dispatch proceeds,
/// the list order never changes
#[derive(Clone, Debug)]
pub struct PackRef {
    pub id: PackId,
    pub uri: String,
    pub loading: bool,
}

/// A restored scene camera
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_deg: f32,
}

impl Camera {
    /// Camera positioned on the bounds diagonal, looking at the center.
    /// Used when a transferred camera arrives with non-finite values.
    pub fn framing(bounds: &Aabb) -> Self {
        let center = if bounds.is_valid() {
            bounds.center()
        } else {
            Vec3::ZERO
        };
        let radius = if bounds.is_valid() {
            (bounds.diagonal() * 0.5).max(1.0)
        } else {
            1.0
        };
        let direction = Vec3::new(1.0, -1.0, 1.0).normalize();
        Self {
            position: center + direction * radius * 2.0,
            target: center,
            up: Vec3::Z,
            fov_y_deg: 45.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.target.is_finite()
            && self.up.is_finite()
            && self.fov_y_deg.is_finite()
    }
}

/// A restored material description
#[derive(Clone, Debug)]
pub struct Material {
    pub id: MaterialId,
    pub name: String,
    pub base_color: [f32; 4],
    pub transparent: bool,
    pub texture_uri: Option<String>,
}

/// The materials block, indexed by material id
#[derive(Clone, Debug, Default)]
pub struct MaterialBlock {
    materials: Vec<Material>,
    by_id: HashMap<MaterialId, usize>,
}

impl MaterialBlock {
    pub fn new(materials: Vec<Material>) -> Self {
        let by_id = materials
            .iter()
            .enumerate()
            .map(|(index, material)| (material.id, index))
            .collect();
        Self { materials, by_id }
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.by_id.get(&id).map(|&index| &self.materials[index])
    }

    /// Transparency classification used for spatial-index bucketing.
    /// Unknown materials classify as opaque.
    pub fn is_transparent(&self, id: MaterialId) -> bool {
        self.get(id).map(|m| m.transparent).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Material> {
        self.materials.iter()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

/// The decoded root structure of a scene package
#[derive(Clone, Debug)]
pub struct SceneDescriptor {
    pub fragments: Vec<Fragment>,
    pub packs: Vec<PackRef>,
    pub materials: MaterialBlock,
    pub cameras: Vec<Camera>,
    pub bounds: Aabb,
    pub placement: Option<Mat4>,
    pub global_offset: Vec3,
    pub unit_scale: f32,
}

impl SceneDescriptor {
    /// Restore a descriptor from transferred data. Embedded meshes are
    /// not part of the descriptor and must be taken out beforehand.
    pub fn from_transfer(transfer: &SceneTransfer) -> Self {
        let bounds = transfer.bounds.restore();
        let fragments: Vec<Fragment> = transfer.fragments.iter().map(|f| f.restore()).collect();
        let packs = transfer.packs.iter().map(|p| p.restore()).collect();
        let materials = MaterialBlock::new(transfer.materials.iter().map(|m| m.restore()).collect());
        let cameras = transfer
            .cameras
            .iter()
            .map(|c| c.restore(&bounds))
            .collect();
        Self {
            fragments,
            packs,
            materials,
            cameras,
            bounds,
            placement: transfer.placement.as_ref().map(|m| m.restore()),
            global_offset: Vec3::from_array(transfer.global_offset),
            unit_scale: transfer.unit_scale,
        }
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.id == id)
    }

    /// Precompute the mesh-to-fragment map the pack streamer resolves
    /// instances through
    pub fn mesh_fragments(&self) -> HashMap<MeshKey, Vec<FragmentId>> {
        let mut map: HashMap<MeshKey, Vec<FragmentId>> = HashMap::new();
        for fragment in &self.fragments {
            map.entry(fragment.mesh_key).or_default().push(fragment.id);
        }
        map
    }
}
