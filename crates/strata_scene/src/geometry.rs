//! Geometry records: decoded mesh buffers shared across instances
//!
//! Records are deduplicated by mesh key so that N fragments referencing
//! the same mesh share one set of buffers. Instance counts are explicit;
//! a record is freed when the last referencing fragment releases it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::transfer::{MeshTransfer, TransferError};

/// Key identifying a mesh inside a package, shared by all its instances
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeshKey(pub u64);

impl MeshKey {
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Decoded vertex and index buffers for one mesh
#[derive(Clone, Debug)]
pub struct GeometryRecord {
    pub mesh_key: MeshKey,
    pub vertex_stride: u32,
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub polygon_count: u32,
    pub bounds: Aabb,
}

impl GeometryRecord {
    /// Decode a transferred mesh, validating buffer shapes before any
    /// reinterpretation
    pub fn from_transfer(transfer: &MeshTransfer) -> Result<Self, TransferError> {
        let mesh_key = MeshKey::new(transfer.mesh_key);
        let stride = transfer.vertex_stride.max(1);
        let vertex_bytes = stride as usize * 4;
        if transfer.vertex_data.is_empty() {
            return Err(TransferError::EmptyMesh(mesh_key));
        }
        if transfer.vertex_data.len() % vertex_bytes != 0 {
            return Err(TransferError::BadVertexBuffer {
                len: transfer.vertex_data.len(),
                stride,
            });
        }
        if transfer.index_data.len() % 4 != 0 {
            return Err(TransferError::BadIndexBuffer(transfer.index_data.len()));
        }

        // The transferred byte buffers have no alignment guarantee, so
        // collect into owned, aligned vectors rather than casting in place.
        let vertices: Vec<f32> = bytemuck::pod_collect_to_vec(&transfer.vertex_data);
        let indices: Vec<u32> = bytemuck::pod_collect_to_vec(&transfer.index_data);

        let vertex_count = vertices.len() / stride as usize;
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(TransferError::IndexOutOfRange {
                index: bad,
                vertices: vertex_count,
            });
        }

        Ok(Self {
            mesh_key,
            vertex_stride: stride,
            vertices,
            indices,
            polygon_count: transfer.polygon_count,
            bounds: transfer.bounds.restore(),
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / self.vertex_stride as usize
    }
}

/// Outcome of releasing an instance reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// Other instances still reference the record
    Remaining(usize),
    /// The last instance released; buffers were freed
    Freed,
    NotPresent,
}

struct GeometryEntry {
    record: Arc<GeometryRecord>,
    instances: usize,
}

/// Deduplicating store of geometry records, keyed by mesh key
#[derive(Default)]
pub struct GeometryTable {
    entries: HashMap<MeshKey, GeometryEntry>,
    total_polygons: u64,
}

impl GeometryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: MeshKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Decode and store a record. A record already present for the key is
    /// kept as-is (packs may redundantly carry shared meshes).
    pub fn insert(&mut self, transfer: &MeshTransfer) -> Result<Arc<GeometryRecord>, TransferError> {
        let key = MeshKey::new(transfer.mesh_key);
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.record.clone());
        }
        let record = Arc::new(GeometryRecord::from_transfer(transfer)?);
        self.total_polygons += u64::from(record.polygon_count);
        let shared = record.clone();
        self.entries.insert(
            key,
            GeometryEntry {
                record,
                instances: 0,
            },
        );
        Ok(shared)
    }

    /// Count one more instance referencing the record
    pub fn add_instance(&mut self, key: MeshKey) -> Option<Arc<GeometryRecord>> {
        let entry = self.entries.get_mut(&key)?;
        entry.instances += 1;
        Some(entry.record.clone())
    }

    /// Release one instance reference; frees the record at zero
    pub fn release_instance(&mut self, key: MeshKey) -> Released {
        let Some(entry) = self.entries.get_mut(&key) else {
            return Released::NotPresent;
        };
        entry.instances = entry.instances.saturating_sub(1);
        if entry.instances > 0 {
            return Released::Remaining(entry.instances);
        }
        if let Some(entry) = self.entries.remove(&key) {
            self.total_polygons -= u64::from(entry.record.polygon_count);
        }
        log::debug!("geometry {} freed", key.raw());
        Released::Freed
    }

    pub fn get(&self, key: MeshKey) -> Option<&Arc<GeometryRecord>> {
        self.entries.get(&key).map(|entry| &entry.record)
    }

    pub fn instance_count(&self, key: MeshKey) -> usize {
        self.entries.get(&key).map(|e| e.instances).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_polygons(&self) -> u64 {
        self.total_polygons
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_polygons = 0;
    }
}
