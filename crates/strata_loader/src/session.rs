//! Load session: the single-threaded cooperative consumer
//!
//! One session drives one package load: it owns the worker pool, the
//! root loader, the pack streamer and the model tables, reacting to
//! inbound worker messages one at a time. Nothing here is touched from
//! another thread; workers communicate only through the pool's result
//! channel, and the texture throttler keeps its own locks.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use strata_scene::{MeshKey, MeshTransfer, Model, PackId};

use crate::collab::{
    ConvertedMaterial, MaterialConverter, MeshSink, PropertySink, PropertyTask,
};
use crate::config::{LoadOptions, PipelineConfig};
use crate::error::{LoadError, WireError};
use crate::pool::{WorkerId, WorkerMessage, WorkerPool};
use crate::progress::{LoadStage, ProgressTracker};
use crate::protocol::{DecodeRequest, DecodeResponse, TopologyTransfer};
use crate::root::{RootLoader, RootOutcome, RootState};
use crate::source::ResourceSource;
use crate::streamer::PackStreamer;
use crate::texture::{TextureOptions, TextureThrottler, TextureTicket};

/// Events drained by the embedding application
#[derive(Clone, Debug)]
pub enum LoadEvent {
    /// The scene descriptor is decoded and the model object exists
    RootLoaded { fragments: usize, packs: usize },
    /// Every pack has settled; fired exactly once
    GeometryLoaded { succeeded: usize, failed: usize },
    /// All requested textures have resolved; fired exactly once
    TextureLoadComplete { resolved: usize, failed: usize },
    Progress { percent: f32, stage: LoadStage },
    /// One or more packs failed while the rest loaded; aggregated and
    /// surfaced once
    PackWarning { failed: usize, first: WireError },
    Topology(TopologyTransfer),
}

/// The external services a session forwards work to
pub struct Collaborators {
    pub sink: Box<dyn MeshSink>,
    pub converter: Arc<dyn MaterialConverter>,
    pub properties: Arc<dyn PropertySink>,
}

/// One streaming package load
pub struct LoadSession {
    config: PipelineConfig,
    source: Arc<dyn ResourceSource>,
    throttler: Arc<TextureThrottler>,
    sink: Box<dyn MeshSink>,
    converter: Arc<dyn MaterialConverter>,
    properties: Arc<dyn PropertySink>,

    pool: WorkerPool,
    root: RootLoader,
    streamer: Option<PackStreamer>,
    model: Option<Model>,
    mesh_fragments: HashMap<MeshKey, Vec<strata_scene::FragmentId>>,
    fragment_index: HashMap<strata_scene::FragmentId, usize>,
    assignments: HashMap<WorkerId, PackId>,
    converted: Vec<ConvertedMaterial>,
    property_task: Option<PropertyTask>,
    progress: ProgressTracker,
    events: Vec<LoadEvent>,

    texture_tickets: Vec<TextureTicket>,
    texture_uris: Vec<String>,
    textures_done: usize,
    textures_failed: usize,
    textures_complete_fired: bool,

    index_installed: bool,
    cancelled: bool,
    failed: bool,
}

impl LoadSession {
    /// Start loading a package. The root decode request is dispatched
    /// before this returns.
    pub fn begin(
        url: impl Into<String>,
        base_path: impl Into<String>,
        options: LoadOptions,
        config: PipelineConfig,
        source: Arc<dyn ResourceSource>,
        throttler: Arc<TextureThrottler>,
        collaborators: Collaborators,
    ) -> Result<Self, LoadError> {
        let url = url.into();
        let request = options.into_request(url.clone(), base_path.into(), config.index_options);
        let mut pool = WorkerPool::new(config.pool_capacity, source.clone());
        let mut root = RootLoader::new(request, url);
        root.begin(&mut pool)?;
        Ok(Self {
            config,
            source,
            throttler,
            sink: collaborators.sink,
            converter: collaborators.converter,
            properties: collaborators.properties,
            pool,
            root,
            streamer: None,
            model: None,
            mesh_fragments: HashMap::new(),
            fragment_index: HashMap::new(),
            assignments: HashMap::new(),
            converted: Vec::new(),
            property_task: None,
            progress: ProgressTracker::new(),
            events: Vec::new(),
            texture_tickets: Vec::new(),
            texture_uris: Vec::new(),
            textures_done: 0,
            textures_failed: 0,
            textures_complete_fired: false,
            index_installed: false,
            cancelled: false,
            failed: false,
        })
    }

    /// Process available worker messages and task completions without
    /// blocking
    pub fn pump(&mut self) -> Result<(), LoadError> {
        if self.cancelled || self.failed {
            return Ok(());
        }
        while let Some(message) = self.pool.try_recv() {
            self.handle_message(message)?;
        }
        self.poll_root()?;
        self.poll_textures();
        Ok(())
    }

    /// Like `pump`, but waits up to `timeout` for the first message
    pub fn pump_blocking(&mut self, timeout: Duration) -> Result<(), LoadError> {
        if self.cancelled || self.failed {
            return Ok(());
        }
        if let Some(message) = self.pool.recv_timeout(timeout) {
            self.handle_message(message)?;
        }
        self.pump()
    }

    /// Drain accumulated events
    pub fn poll_events(&mut self) -> Vec<LoadEvent> {
        mem::take(&mut self.events)
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut Model> {
        self.model.as_mut()
    }

    /// Take ownership of the loaded model, detaching it from session
    /// teardown
    pub fn take_model(&mut self) -> Option<Model> {
        self.model.take()
    }

    pub fn converted_materials(&self) -> &[ConvertedMaterial] {
        &self.converted
    }

    pub fn root_state(&self) -> RootState {
        self.root.state()
    }

    pub fn is_geometry_complete(&self) -> bool {
        self.streamer.as_ref().map(|s| s.is_complete()).unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.root.state() == RootState::Ready && self.is_geometry_complete()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn progress_percent(&self) -> f32 {
        self.progress.overall()
    }

    /// Number of decode workers the pool has actually spawned
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Request the auxiliary topology sidecar; the result arrives as a
    /// `Topology` event
    pub fn fetch_topology(&mut self, uri: impl Into<String>) -> Result<(), LoadError> {
        self.pool
            .dispatch(DecodeRequest::FetchTopology { uri: uri.into() })?;
        Ok(())
    }

    /// Cancel the load and release every resource. Idempotent; no
    /// in-flight handler can observe session state afterwards.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        log::info!("load cancelled");
        self.teardown_pipeline();
    }

    fn handle_message(&mut self, message: WorkerMessage) -> Result<(), LoadError> {
        if message.response.is_terminal() {
            self.pool.note_settled(message.worker);
        }
        match message.response {
            DecodeResponse::Manifest(manifest) => {
                match self.root.on_manifest(manifest, &mut self.pool) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.fatalize(e)),
                }
            }
            DecodeResponse::SpatialIndex(index) => {
                self.root.on_spatial_index(index);
                Ok(())
            }
            DecodeResponse::Scene(scene) => {
                let result = self.root.on_scene(
                    *scene,
                    self.config.index_options,
                    self.converter.clone(),
                    self.properties.clone(),
                );
                match result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.fatalize(e)),
                }
            }
            DecodeResponse::Mesh { mesh, .. } => {
                self.handle_mesh(&mesh);
                Ok(())
            }
            DecodeResponse::PackDone { pack, mesh_count } => {
                log::debug!("pack {pack} done with {mesh_count} meshes");
                self.handle_pack_settled(message.worker, PackId::new(pack), None)
            }
            DecodeResponse::Progress(fraction) => {
                log::debug!(
                    "worker {} progress {:.0}%",
                    message.worker.raw(),
                    fraction * 100.0
                );
                Ok(())
            }
            DecodeResponse::Debug(text) => {
                log::debug!("worker {}: {text}", message.worker.raw());
                Ok(())
            }
            DecodeResponse::Topology(topology) => {
                self.events.push(LoadEvent::Topology(topology));
                Ok(())
            }
            DecodeResponse::Error(error) => self.handle_error(message.worker, error),
        }
    }

    /// Classify a worker error by stage: root failures are fatal, pack
    /// failures accumulate, anything else is logged
    fn handle_error(&mut self, worker: WorkerId, error: WireError) -> Result<(), LoadError> {
        if let Some(pack) = self.assignments.get(&worker).copied() {
            return self.handle_pack_settled(worker, pack, Some(error));
        }
        if self.root.worker() == Some(worker) && self.root.is_decoding() {
            log::error!("root decode failed: {error}");
            return Err(self.fatalize(LoadError::RootLoad(error)));
        }
        log::warn!("auxiliary fetch failed: {error}");
        Ok(())
    }

    fn handle_pack_settled(
        &mut self,
        worker: WorkerId,
        pack: PackId,
        error: Option<WireError>,
    ) -> Result<(), LoadError> {
        self.assignments.remove(&worker);
        let (Some(streamer), Some(model)) = (self.streamer.as_mut(), self.model.as_mut()) else {
            return Ok(());
        };
        let result = streamer.on_settled(
            worker,
            pack,
            error,
            &mut self.pool,
            &mut model.descriptor.packs,
            &mut self.assignments,
            &mut self.progress,
            &mut self.events,
        );
        if let Err(e) = result {
            return Err(self.fatalize(e));
        }
        if self.is_geometry_complete() {
            self.finish_geometry();
        }
        Ok(())
    }

    /// Activate every fragment instancing a freshly decoded mesh
    fn handle_mesh(&mut self, mesh: &MeshTransfer) {
        let Some(model) = self.model.as_mut() else {
            return;
        };
        let key = MeshKey::new(mesh.mesh_key);
        let record = match model.geometry.insert(mesh) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("mesh {} dropped: {e}", mesh.mesh_key);
                return;
            }
        };

        if let Some(streamer) = self.streamer.as_mut() {
            if streamer.note_polygons(record.polygon_count) {
                self.sink.invalidate_view();
            }
        }

        let Some(fragment_ids) = self.mesh_fragments.get(&key) else {
            return;
        };
        for fragment_id in fragment_ids {
            let Some(&index) = self.fragment_index.get(fragment_id) else {
                continue;
            };
            let fragment = model.descriptor.fragments[index].clone();
            if self.config.skip_hidden_fragments && fragment.flags.hidden() {
                continue;
            }
            let Some(record) = model.geometry.add_instance(key) else {
                continue;
            };
            model.fragments.activate(fragment.id, key);
            let world = model.fragment_world_transform(&fragment);
            self.sink
                .activate_fragment(fragment.id, &record, &world, fragment.bounds.is_none());
        }
    }

    /// React to the root stage completing: emit the 5% tick, construct
    /// session state from the model, activate embedded meshes and start
    /// the pack streamer
    fn poll_root(&mut self) -> Result<(), LoadError> {
        let Some(outcome) = self.root.poll() else {
            return Ok(());
        };
        let RootOutcome {
            model,
            embedded,
            converted,
            conversion_failures,
            property_task,
        } = outcome;

        if conversion_failures > 0 {
            log::warn!("{conversion_failures} materials failed conversion");
        }
        let percent = self.progress.on_root_ready();
        self.events.push(LoadEvent::Progress {
            percent,
            stage: LoadStage::Root,
        });
        self.events.push(LoadEvent::RootLoaded {
            fragments: model.descriptor.fragments.len(),
            packs: model.descriptor.packs.len(),
        });

        self.mesh_fragments = model.descriptor.mesh_fragments();
        self.fragment_index = model
            .descriptor
            .fragments
            .iter()
            .enumerate()
            .map(|(index, fragment)| (fragment.id, index))
            .collect();
        let pack_count = model.descriptor.packs.len();
        self.converted = converted;
        self.property_task = Some(property_task);
        self.model = Some(model);
        self.streamer = Some(PackStreamer::new(
            pack_count,
            self.config.repaint_polygon_threshold,
        ));

        self.request_model_textures();

        for mesh in &embedded {
            self.handle_mesh(mesh);
        }

        let started = match (self.streamer.as_mut(), self.model.as_mut()) {
            (Some(streamer), Some(model)) => {
                let result = streamer.start(
                    &mut self.pool,
                    &mut model.descriptor.packs,
                    &mut self.assignments,
                );
                if result.is_ok() {
                    streamer.check_complete(&mut self.progress, &mut self.events);
                }
                result
            }
            _ => Ok(()),
        };
        if let Err(e) = started {
            return Err(self.fatalize(e));
        }

        if self.is_geometry_complete() {
            self.finish_geometry();
        }
        Ok(())
    }

    /// Install the spatial index once all fragment placements are
    /// settled; a worker-supplied index is used as-is
    fn finish_geometry(&mut self) {
        if self.index_installed {
            return;
        }
        let Some(model) = self.model.as_mut() else {
            return;
        };
        self.index_installed = true;
        let index = model.ensure_spatial_index();
        self.sink.set_spatial_index(index, &self.config.index_options);
    }

    /// Ask the throttler to process this model's materials
    fn request_model_textures(&mut self) {
        let Some(model) = self.model.as_ref() else {
            return;
        };
        let mut uris: Vec<String> = Vec::new();
        for material in model.descriptor.materials.iter() {
            if let Some(uri) = &material.texture_uri {
                if !uris.contains(uri) {
                    uris.push(uri.clone());
                }
            }
        }
        if uris.is_empty() {
            return;
        }
        log::debug!("requesting {} textures", uris.len());
        self.throttler.add_estimated(uris.len());
        for uri in &uris {
            let ticket =
                self.throttler
                    .request(uri.clone(), TextureOptions::default(), self.source.clone());
            self.texture_tickets.push(ticket);
        }
        self.texture_uris = uris;
    }

    /// Track ticket resolutions and fire the one-shot texture-complete
    /// signal when the process-wide in-flight count reaches zero and
    /// geometry decode is done
    fn poll_textures(&mut self) {
        let total = self.texture_tickets.len();
        if total > 0 {
            let mut done = 0;
            let mut failed = 0;
            for ticket in &mut self.texture_tickets {
                if let Some(resolved) = ticket.try_resolve() {
                    done += 1;
                    if resolved.is_none() {
                        failed += 1;
                    }
                }
            }
            self.textures_done = done;
            self.textures_failed = failed;
            if let Some(percent) = self.progress.on_texture_fraction(done as f32 / total as f32)
            {
                self.events.push(LoadEvent::Progress {
                    percent,
                    stage: LoadStage::Texture,
                });
            }
        }

        if !self.textures_complete_fired
            && self.is_geometry_complete()
            && self.throttler.in_flight() == 0
        {
            self.textures_complete_fired = true;
            self.events.push(LoadEvent::TextureLoadComplete {
                resolved: self.textures_done - self.textures_failed,
                failed: self.textures_failed,
            });
        }
    }

    fn fatalize(&mut self, error: LoadError) -> LoadError {
        log::error!("load failed: {error}");
        self.failed = true;
        self.teardown_pipeline();
        error
    }

    /// Ordered teardown. The pool detaches its result listener before
    /// terminating any worker (which also covers the pending lazy
    /// worker spawn), then the independent property task is cancelled,
    /// then buffers are dropped for reclamation.
    fn teardown_pipeline(&mut self) {
        self.pool.cancel_all();
        if let Some(task) = self.property_task.as_mut() {
            task.cancel();
        }
        self.root.abort();
        if let Some(model) = self.model.as_mut() {
            model.clear();
        }
        self.model = None;
        self.streamer = None;
        self.texture_tickets.clear();
        self.throttler.dispose_slots(&self.texture_uris);
        self.throttler.remove_estimated(self.texture_uris.len());
        self.texture_uris.clear();
        self.mesh_fragments.clear();
        self.fragment_index.clear();
        self.assignments.clear();
    }
}

impl Drop for LoadSession {
    fn drop(&mut self) {
        self.cancel();
    }
}
