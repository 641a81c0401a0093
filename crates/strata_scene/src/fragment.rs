//! Fragments: placed mesh instances and their activation bookkeeping

use std::collections::HashMap;

use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::descriptor::MaterialId;
use crate::geometry::MeshKey;

/// Identifier of a placed instance within a scene
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub u32);

impl FragmentId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Per-fragment visibility flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentFlags(pub u32);

impl FragmentFlags {
    pub const HIDDEN: u32 = 1 << 0;
    pub const GHOSTED: u32 = 1 << 1;

    pub const fn none() -> Self {
        Self(0)
    }

    pub fn hidden(&self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    pub fn ghosted(&self) -> bool {
        self.0 & Self::GHOSTED != 0
    }
}

/// A placed instance of a mesh
#[derive(Clone, Debug)]
pub struct Fragment {
    pub id: FragmentId,
    pub mesh_key: MeshKey,
    pub material: MaterialId,
    pub transform: Mat4,
    pub flags: FragmentFlags,
    /// Authoring-time world bounds when the package carries them;
    /// fragments without bounds have theirs recomputed from geometry
    pub bounds: Option<Aabb>,
}

/// Outcome of activating a fragment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Fresh,
    Overwritten,
}

/// Tracks which fragments have had their mesh arrive.
/// Activation is idempotent; re-activating an id overwrites.
#[derive(Debug, Default)]
pub struct FragmentTable {
    active: HashMap<FragmentId, MeshKey>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, id: FragmentId, mesh_key: MeshKey) -> Activation {
        match self.active.insert(id, mesh_key) {
            None => Activation::Fresh,
            Some(previous) => {
                log::debug!(
                    "fragment {} re-activated: mesh {} replaces {}",
                    id.raw(),
                    mesh_key.raw(),
                    previous.raw()
                );
                Activation::Overwritten
            }
        }
    }

    pub fn deactivate(&mut self, id: FragmentId) -> Option<MeshKey> {
        self.active.remove(&id)
    }

    pub fn is_active(&self, id: FragmentId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_mesh(&self, id: FragmentId) -> Option<MeshKey> {
        self.active.get(&id).copied()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
