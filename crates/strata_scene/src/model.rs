//! The in-memory model: descriptor plus mutable load-time state

use glam::Mat4;

use crate::bounds::Aabb;
use crate::bvh::{Bvh, BvhPrimitive, IndexOptions};
use crate::descriptor::SceneDescriptor;
use crate::fragment::{Fragment, FragmentTable};
use crate::geometry::GeometryTable;

/// A loaded (or loading) model. The fragment and geometry tables are
/// owned here and only ever mutated by the single consumer thread.
pub struct Model {
    pub descriptor: SceneDescriptor,
    pub fragments: FragmentTable,
    pub geometry: GeometryTable,
    spatial_index: Option<Bvh>,
    index_options: IndexOptions,
}

impl Model {
    pub fn new(descriptor: SceneDescriptor, index_options: IndexOptions) -> Self {
        Self {
            descriptor,
            fragments: FragmentTable::new(),
            geometry: GeometryTable::new(),
            spatial_index: None,
            index_options,
        }
    }

    pub fn spatial_index(&self) -> Option<&Bvh> {
        self.spatial_index.as_ref()
    }

    /// Adopt an index built elsewhere (typically by the decode worker)
    pub fn set_spatial_index(&mut self, index: Bvh) {
        self.spatial_index = Some(index);
    }

    /// Replace the placement transform. Every primitive box may shift
    /// non-uniformly, so the existing index is dropped and the next
    /// `ensure_spatial_index` call rebuilds from scratch.
    pub fn set_placement(&mut self, placement: Mat4) {
        self.descriptor.placement = Some(placement);
        if self.spatial_index.take().is_some() {
            log::info!("placement changed, spatial index invalidated");
        }
    }

    /// Combined placement and fragment transform
    pub fn fragment_world_transform(&self, fragment: &Fragment) -> Mat4 {
        match self.descriptor.placement {
            Some(placement) => placement * fragment.transform,
            None => fragment.transform,
        }
    }

    /// World-space box for a fragment, if one can be derived. Fragments
    /// without authored bounds fall back to their geometry's box.
    pub fn fragment_world_bounds(&self, fragment: &Fragment) -> Option<Aabb> {
        let local = match fragment.bounds {
            Some(bounds) => bounds,
            None => self
                .geometry
                .get(fragment.mesh_key)?
                .bounds
                .transformed(&fragment.transform),
        };
        let bounds = match self.descriptor.placement {
            Some(placement) => local.transformed(&placement),
            None => local,
        };
        bounds.is_valid().then_some(bounds)
    }

    /// Build (or return) the spatial index over the current fragment
    /// placements
    pub fn ensure_spatial_index(&mut self) -> &Bvh {
        if self.spatial_index.is_none() {
            let primitives: Vec<BvhPrimitive> = self
                .descriptor
                .fragments
                .iter()
                .filter_map(|fragment| {
                    let bounds = self.fragment_world_bounds(fragment)?;
                    Some(BvhPrimitive {
                        fragment: fragment.id,
                        bounds,
                        transparent: self.descriptor.materials.is_transparent(fragment.material),
                    })
                })
                .collect();
            log::debug!(
                "building spatial index over {} fragment boxes",
                primitives.len()
            );
            self.spatial_index = Some(Bvh::build(&primitives, &self.index_options));
        }
        let options = self.index_options;
        self.spatial_index
            .get_or_insert_with(|| Bvh::build(&[], &options))
    }

    /// Drop all load-time state; the model is unusable afterwards
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.geometry.clear();
        self.spatial_index = None;
    }
}
