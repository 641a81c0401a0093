//! # strata_scene - Scene Data Model
//!
//! The in-memory model of a streamed scene package:
//! - Scene descriptor (fragments, packs, materials, cameras, bounds)
//! - Deduplicated, instance-counted geometry records
//! - Transfer structs for payloads crossing the decode-worker boundary
//! - Bounding-volume hierarchy for view-frustum culling

pub mod bounds;
pub mod bvh;
pub mod descriptor;
pub mod fragment;
pub mod geometry;
pub mod model;
pub mod transfer;

pub use bounds::Aabb;
pub use bvh::{Bvh, BvhNode, BvhPrimitive, IndexOptions};
pub use descriptor::{
    Camera, Material, MaterialBlock, MaterialId, PackId, PackRef, SceneDescriptor,
};
pub use fragment::{Activation, Fragment, FragmentFlags, FragmentId, FragmentTable};
pub use geometry::{GeometryRecord, GeometryTable, MeshKey, Released};
pub use model::Model;
pub use transfer::{
    BoundsTransfer, CameraTransfer, FragmentTransfer, IndexTransfer, MaterialTransfer,
    MatrixTransfer, MeshTransfer, NodeTransfer, PackTransfer, SceneTransfer, TransferError,
};
