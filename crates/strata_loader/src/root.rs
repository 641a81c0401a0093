//! Model root loader
//!
//! Drives the two-round manifest handshake against one pool worker and
//! turns the resulting scene transfer into the in-memory model. Root
//! failures are fatal for the whole load. Material conversion is
//! awaited before the root stage is declared complete; property loading
//! is kicked off fire-and-forget.

use std::sync::Arc;

use strata_scene::{
    Bvh, IndexOptions, IndexTransfer, Material, MeshTransfer, Model, SceneDescriptor,
    SceneTransfer,
};

use crate::collab::{
    ConversionTask, ConvertedMaterial, MaterialConverter, PropertySink, PropertyTask,
};
use crate::error::{LoadError, WireError};
use crate::pool::{WorkerId, WorkerPool};
use crate::protocol::{DecodeRequest, Manifest, RootRequest};

/// Root-loader states. The manifest continuation round sits between
/// `AwaitingManifest` and `AwaitingScene`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootState {
    Idle,
    AwaitingManifest,
    AwaitingScene,
    ConvertingMaterials,
    Ready,
    Failed,
}

/// Everything the session receives when the root stage completes
pub(crate) struct RootOutcome {
    pub model: Model,
    pub embedded: Vec<MeshTransfer>,
    pub converted: Vec<ConvertedMaterial>,
    pub conversion_failures: usize,
    pub property_task: PropertyTask,
}

struct Staging {
    model: Model,
    embedded: Vec<MeshTransfer>,
    property_task: PropertyTask,
}

pub(crate) struct RootLoader {
    request: Option<RootRequest>,
    model_key: String,
    state: RootState,
    worker: Option<WorkerId>,
    pending_index: Option<IndexTransfer>,
    conversion: Option<ConversionTask>,
    staging: Option<Staging>,
}

impl RootLoader {
    pub fn new(request: RootRequest, model_key: String) -> Self {
        Self {
            request: Some(request),
            model_key,
            state: RootState::Idle,
            worker: None,
            pending_index: None,
            conversion: None,
            staging: None,
        }
    }

    pub fn state(&self) -> RootState {
        self.state
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    /// Whether a worker error in this stage is fatal
    pub fn is_decoding(&self) -> bool {
        matches!(
            self.state,
            RootState::AwaitingManifest | RootState::AwaitingScene
        )
    }

    /// Dispatch the first root round
    pub fn begin(&mut self, pool: &mut WorkerPool) -> Result<(), LoadError> {
        let request = self
            .request
            .take()
            .ok_or_else(|| LoadError::RootLoad(WireError::protocol("root load already begun")))?;
        log::info!("loading scene package {}", request.url);
        let worker = pool.dispatch(DecodeRequest::LoadRoot(request))?;
        self.worker = Some(worker);
        self.state = RootState::AwaitingManifest;
        Ok(())
    }

    /// First round done: echo the manifest to the same worker so it can
    /// resume the decode. Strictly ordered; no geometry job is
    /// dispatched before this continuation completes.
    pub fn on_manifest(&mut self, manifest: Manifest, pool: &mut WorkerPool) -> Result<(), LoadError> {
        if self.state != RootState::AwaitingManifest {
            return Err(LoadError::RootLoad(WireError::protocol(
                "manifest received outside the first root round",
            )));
        }
        let worker = self
            .worker
            .ok_or_else(|| LoadError::RootLoad(WireError::protocol("root worker missing")))?;
        pool.dispatch_to(worker, DecodeRequest::ResumeRoot { manifest })?;
        self.state = RootState::AwaitingScene;
        Ok(())
    }

    /// A worker-built spatial index may precede the scene payload
    pub fn on_spatial_index(&mut self, index: IndexTransfer) {
        self.pending_index = Some(index);
    }

    /// Continuation round done: restore rich types, construct the
    /// model, start property loading, and hold the stage open until
    /// material conversion completes
    pub fn on_scene(
        &mut self,
        mut transfer: SceneTransfer,
        index_options: IndexOptions,
        converter: Arc<dyn MaterialConverter>,
        properties: Arc<dyn PropertySink>,
    ) -> Result<(), LoadError> {
        if self.state != RootState::AwaitingScene {
            return Err(LoadError::RootLoad(WireError::protocol(
                "scene received outside the continuation round",
            )));
        }
        let embedded = std::mem::take(&mut transfer.embedded);
        let descriptor = SceneDescriptor::from_transfer(&transfer);
        log::info!(
            "scene decoded: {} fragments, {} packs, {} embedded meshes",
            descriptor.fragments.len(),
            descriptor.packs.len(),
            embedded.len()
        );
        let mut model = Model::new(descriptor, index_options);
        if let Some(index) = self.pending_index.take() {
            model.set_spatial_index(Bvh::from_transfer(&index));
        }

        let property_task = PropertyTask::start(properties, self.model_key.clone())?;
        let materials: Vec<Material> = model.descriptor.materials.iter().cloned().collect();
        self.conversion = Some(ConversionTask::start(
            materials,
            model.descriptor.unit_scale,
            converter,
        )?);
        self.staging = Some(Staging {
            model,
            embedded,
            property_task,
        });
        self.state = RootState::ConvertingMaterials;
        Ok(())
    }

    /// Poll for conversion completion; yields the root outcome once
    pub fn poll(&mut self) -> Option<RootOutcome> {
        if self.state != RootState::ConvertingMaterials {
            return None;
        }
        let outcome = self.conversion.as_mut()?.try_finish()?;
        self.conversion = None;
        let staging = self.staging.take()?;
        self.state = RootState::Ready;
        Some(RootOutcome {
            model: staging.model,
            embedded: staging.embedded,
            converted: outcome.converted,
            conversion_failures: outcome.failed,
            property_task: staging.property_task,
        })
    }

    /// Abandon the stage; in-progress staging and conversion are dropped
    pub fn abort(&mut self) {
        self.conversion = None;
        if let Some(mut staging) = self.staging.take() {
            staging.property_task.cancel();
        }
        self.pending_index = None;
        if self.state != RootState::Ready {
            self.state = RootState::Failed;
        }
    }
}
