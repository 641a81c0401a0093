//! Collaborator seams the pipeline consumes but does not implement
//!
//! The renderer, the material-appearance service and the property
//! pipeline are all external. They plug in through these traits; the
//! pipeline only schedules them and reacts to their completions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use glam::Mat4;

use strata_scene::{
    Bvh, FragmentId, GeometryRecord, IndexOptions, Material, MaterialId, Model,
};

use crate::error::{LoadError, WireError};

/// Mesh-registration collaborator: the rendering layer receiving
/// activated instances and the finished spatial index
pub trait MeshSink: Send {
    /// Hand one placed instance to the renderer. `recompute_bounds` is
    /// set when the package carried no authored box for the fragment and
    /// the renderer must derive one from the geometry.
    fn activate_fragment(
        &mut self,
        fragment: FragmentId,
        mesh: &Arc<GeometryRecord>,
        world_transform: &Mat4,
        recompute_bounds: bool,
    );

    /// Install the spatial index once fragment placements are settled
    fn set_spatial_index(&mut self, index: &Bvh, options: &IndexOptions);

    /// Progressive-repaint hint; fired on a growing polygon threshold
    /// rather than per mesh
    fn invalidate_view(&mut self) {}
}

/// A render-ready material produced by the conversion service
#[derive(Clone, Debug)]
pub struct ConvertedMaterial {
    pub id: MaterialId,
    pub transparent: bool,
}

/// Material-appearance conversion collaborator. Conversion may load a
/// conversion module of its own, so it runs off-thread and the root
/// stage awaits its completion.
pub trait MaterialConverter: Send + Sync {
    fn convert(&self, material: &Material, unit_scale: f32)
        -> Result<ConvertedMaterial, WireError>;
}

/// Pass-through conversion for hosts without an appearance service
pub struct PassthroughConverter;

impl MaterialConverter for PassthroughConverter {
    fn convert(
        &self,
        material: &Material,
        _unit_scale: f32,
    ) -> Result<ConvertedMaterial, WireError> {
        Ok(ConvertedMaterial {
            id: material.id,
            transparent: material.transparent,
        })
    }
}

/// Look a material up in a loaded model
pub fn find_material(model: &Model, id: MaterialId) -> Option<&Material> {
    model.descriptor.materials.get(id)
}

/// Property/metadata pipeline collaborator; runs as an independent
/// fire-and-forget task
pub trait PropertySink: Send + Sync {
    fn load_properties(&self, model_key: &str, cancel: &AtomicBool) -> Result<(), WireError>;
}

/// Property sink for hosts without a metadata pipeline
pub struct NoopPropertySink;

impl PropertySink for NoopPropertySink {
    fn load_properties(&self, _model_key: &str, _cancel: &AtomicBool) -> Result<(), WireError> {
        Ok(())
    }
}

/// Result of converting a model's materials block
#[derive(Debug, Default)]
pub(crate) struct ConversionOutcome {
    pub converted: Vec<ConvertedMaterial>,
    pub failed: usize,
    pub first_error: Option<WireError>,
}

/// Off-thread conversion of the whole materials block; completion is
/// observed from the consumer's pump
pub(crate) struct ConversionTask {
    rx: Receiver<ConversionOutcome>,
    join: Option<JoinHandle<()>>,
}

impl ConversionTask {
    pub fn start(
        materials: Vec<Material>,
        unit_scale: f32,
        converter: Arc<dyn MaterialConverter>,
    ) -> Result<Self, LoadError> {
        let (tx, rx) = bounded(1);
        let join = thread::Builder::new()
            .name("strata-materials".into())
            .spawn(move || {
                let mut outcome = ConversionOutcome::default();
                for material in &materials {
                    match converter.convert(material, unit_scale) {
                        Ok(converted) => outcome.converted.push(converted),
                        Err(e) => {
                            log::warn!("material {:?} failed to convert: {e}", material.id);
                            outcome.failed += 1;
                            if outcome.first_error.is_none() {
                                outcome.first_error = Some(e);
                            }
                        }
                    }
                }
                let _ = tx.send(outcome);
            })
            .map_err(LoadError::WorkerInit)?;
        Ok(Self {
            rx,
            join: Some(join),
        })
    }

    pub fn try_finish(&mut self) -> Option<ConversionOutcome> {
        let outcome = self.rx.try_recv().ok()?;
        drop(self.join.take());
        Some(outcome)
    }
}

impl Drop for ConversionTask {
    fn drop(&mut self) {
        // Detached; the conversion thread ends on its own.
        drop(self.join.take());
    }
}

/// The independent property-loading task
pub(crate) struct PropertyTask {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PropertyTask {
    pub fn start(sink: Arc<dyn PropertySink>, model_key: String) -> Result<Self, LoadError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let join = thread::Builder::new()
            .name("strata-properties".into())
            .spawn(move || {
                if let Err(e) = sink.load_properties(&model_key, &flag) {
                    log::warn!("property load failed for {model_key}: {e}");
                }
            })
            .map_err(LoadError::WorkerInit)?;
        Ok(Self {
            cancel,
            join: Some(join),
        })
    }

    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        drop(self.join.take());
    }
}
