//! Decode worker pool
//!
//! A bounded set of decode threads, each with its own bounded job queue
//! and a shared result channel back to the consumer. The pool grows
//! lazily: a new worker is spawned only when every existing worker
//! already has work in flight. Job placement picks the worker with the
//! fewest in-flight jobs, ties broken by lowest index, which keeps
//! scheduling deterministic. In-flight counts are exact: incremented on
//! dispatch, decremented when the consumer settles a terminal response.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{LoadError, WireError};
use crate::protocol::{
    decode_pack, decode_root, decode_topology, resume_root, DecodeRequest, DecodeResponse,
    RootRequest,
};
use crate::source::ResourceSource;

/// Jobs that may queue on one worker before dispatch blocks
const JOB_QUEUE_DEPTH: usize = 8;

/// Index of a worker within its pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub const fn raw(&self) -> usize {
        self.0
    }
}

/// A worker response tagged with its origin
#[derive(Debug)]
pub struct WorkerMessage {
    pub worker: WorkerId,
    pub response: DecodeResponse,
}

struct Worker {
    tx: Sender<DecodeRequest>,
    join: Option<JoinHandle<()>>,
    in_flight: usize,
}

/// Bounded pool of decode workers
pub struct WorkerPool {
    capacity: usize,
    source: Arc<dyn ResourceSource>,
    workers: Vec<Worker>,
    results_tx: Sender<WorkerMessage>,
    results_rx: Option<Receiver<WorkerMessage>>,
    cancelled: bool,
    init_failed: bool,
}

impl WorkerPool {
    pub fn new(capacity: usize, source: Arc<dyn ResourceSource>) -> Self {
        let (results_tx, results_rx) = unbounded();
        Self {
            capacity: capacity.max(1),
            source,
            workers: Vec::new(),
            results_tx,
            results_rx: Some(results_rx),
            cancelled: false,
            init_failed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers actually spawned so far
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn in_flight(&self, id: WorkerId) -> usize {
        self.workers.get(id.raw()).map(|w| w.in_flight).unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> usize {
        self.workers.iter().map(|w| w.in_flight).sum()
    }

    /// Queue a job on the least-busy worker, growing the pool if every
    /// existing worker is already occupied
    pub fn dispatch(&mut self, request: DecodeRequest) -> Result<WorkerId, LoadError> {
        let index = self.select_worker()?;
        self.dispatch_to(WorkerId(index), request)?;
        Ok(WorkerId(index))
    }

    /// Queue a job on a specific worker (continuation rounds and pack
    /// pulling must target the worker that holds the state)
    pub fn dispatch_to(&mut self, id: WorkerId, request: DecodeRequest) -> Result<(), LoadError> {
        self.check_usable()?;
        let worker = self
            .workers
            .get_mut(id.raw())
            .ok_or(LoadError::Cancelled)?;
        worker
            .tx
            .send(request)
            .map_err(|_| LoadError::Cancelled)?;
        worker.in_flight += 1;
        Ok(())
    }

    fn check_usable(&self) -> Result<(), LoadError> {
        if self.cancelled {
            return Err(LoadError::Cancelled);
        }
        if self.init_failed {
            return Err(LoadError::WorkerInit(std::io::Error::other(
                "worker pool initialization previously failed",
            )));
        }
        Ok(())
    }

    fn select_worker(&mut self) -> Result<usize, LoadError> {
        self.check_usable()?;
        let least = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|entry| (entry.1.in_flight, entry.0))
            .map(|(index, worker)| (index, worker.in_flight));
        match least {
            // Grow only when every existing worker has work in flight.
            Some((index, in_flight)) => {
                if in_flight > 0 && self.workers.len() < self.capacity {
                    self.spawn_worker()
                } else {
                    Ok(index)
                }
            }
            None => self.spawn_worker(),
        }
    }

    fn spawn_worker(&mut self) -> Result<usize, LoadError> {
        let index = self.workers.len();
        let (tx, jobs) = bounded(JOB_QUEUE_DEPTH);
        let results = self.results_tx.clone();
        let source = self.source.clone();
        let spawned = thread::Builder::new()
            .name(format!("strata-decode-{index}"))
            .spawn(move || run_worker(WorkerId(index), jobs, results, source));
        let join = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // Fatal: the pool never retries initialization.
                self.init_failed = true;
                log::error!("failed to spawn decode worker {index}: {e}");
                return Err(LoadError::WorkerInit(e));
            }
        };
        log::debug!("spawned decode worker {index}");
        self.workers.push(Worker {
            tx,
            join: Some(join),
            in_flight: 0,
        });
        Ok(index)
    }

    /// Receive the next worker message without blocking
    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.results_rx.as_ref()?.try_recv().ok()
    }

    /// Receive the next worker message, waiting up to `timeout`
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<WorkerMessage> {
        self.results_rx.as_ref()?.recv_timeout(timeout).ok()
    }

    /// Record that a terminal response for this worker was processed
    pub fn note_settled(&mut self, id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(id.raw()) {
            worker.in_flight = worker.in_flight.saturating_sub(1);
        }
    }

    /// Tear the pool down. The result receiver is detached before any
    /// worker is terminated, so no late message can be observed after
    /// this returns. Idempotent.
    pub fn cancel_all(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.results_rx = None;
        for worker in &mut self.workers {
            let _ = worker.tx.try_send(DecodeRequest::Shutdown);
        }
        for mut worker in self.workers.drain(..) {
            // Dropping the sender ends the worker loop after its current
            // job; a worker mid-decode finishes detached.
            drop(worker.tx);
            drop(worker.join.take());
        }
        log::debug!("worker pool cancelled");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn run_worker(
    id: WorkerId,
    jobs: Receiver<DecodeRequest>,
    results: Sender<WorkerMessage>,
    source: Arc<dyn ResourceSource>,
) {
    let post = |response: DecodeResponse| {
        results
            .send(WorkerMessage {
                worker: id,
                response,
            })
            .is_ok()
    };
    // One root decode may be pending between its two rounds.
    let mut pending_root: Option<RootRequest> = None;

    while let Ok(job) = jobs.recv() {
        let delivered = match job {
            DecodeRequest::Shutdown => break,
            DecodeRequest::LoadRoot(request) => match decode_root(&*source, &request) {
                Ok(manifest) => {
                    let summary = format!(
                        "manifest: {} fragments, {} packs, {} materials",
                        manifest.fragments.len(),
                        manifest.packs.len(),
                        manifest.materials.len()
                    );
                    pending_root = Some(request);
                    post(DecodeResponse::Debug(summary))
                        && post(DecodeResponse::Manifest(manifest))
                }
                Err(e) => post(DecodeResponse::Error(e)),
            },
            DecodeRequest::ResumeRoot { manifest } => match pending_root.take() {
                Some(request) => {
                    let (scene, index) = resume_root(&request, manifest);
                    let mut delivered = true;
                    if let Some(index) = index {
                        delivered = post(DecodeResponse::SpatialIndex(index));
                    }
                    delivered && post(DecodeResponse::Scene(Box::new(scene)))
                }
                None => post(DecodeResponse::Error(WireError::protocol(
                    "continuation without a pending root decode",
                ))),
            },
            DecodeRequest::LoadPack { pack } => match decode_pack(&*source, &pack) {
                Ok(file) => {
                    let total = file.meshes.len();
                    let mut delivered = true;
                    for (i, mesh) in file.meshes.into_iter().enumerate() {
                        delivered = post(DecodeResponse::Mesh {
                            pack: pack.id,
                            mesh,
                        }) && post(DecodeResponse::Progress(
                            (i + 1) as f32 / total.max(1) as f32,
                        ));
                        if !delivered {
                            break;
                        }
                    }
                    delivered
                        && post(DecodeResponse::PackDone {
                            pack: pack.id,
                            mesh_count: total as u32,
                        })
                }
                Err(e) => post(DecodeResponse::Error(e)),
            },
            DecodeRequest::FetchTopology { uri } => match decode_topology(&*source, &uri) {
                Ok(topology) => post(DecodeResponse::Topology(topology)),
                Err(e) => post(DecodeResponse::Error(e)),
            },
        };
        if !delivered {
            // Consumer detached; nothing left to report to.
            break;
        }
    }
}
