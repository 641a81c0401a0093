//! Geometry pack streamer
//!
//! Dispatches `min(pack_count, pool_capacity)` jobs up front; after
//! that, each worker that finishes a pack pulls the next undispatched
//! one itself, which balances uneven pack sizes without a static
//! partition. Pack failures are counted and surfaced once as a warning,
//! never halting the remaining packs.

use std::collections::HashMap;

use strata_scene::{PackId, PackRef, PackTransfer};

use crate::error::{LoadError, WireError};
use crate::pool::{WorkerId, WorkerPool};
use crate::progress::{LoadStage, ProgressTracker};
use crate::protocol::DecodeRequest;
use crate::session::LoadEvent;

pub(crate) struct PackStreamer {
    total: usize,
    /// Index of the next undispatched pack
    next: usize,
    succeeded: usize,
    failed: usize,
    first_error: Option<WireError>,
    warned: bool,
    complete: bool,
    polygons: u64,
    repaint_at: u64,
}

impl PackStreamer {
    pub fn new(total: usize, repaint_threshold: u64) -> Self {
        Self {
            total,
            next: 0,
            succeeded: 0,
            failed: 0,
            first_error: None,
            warned: false,
            complete: false,
            polygons: 0,
            repaint_at: repaint_threshold.max(1),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.succeeded + self.failed) as f32 / self.total as f32
        }
    }

    /// Dispatch the initial batch of pack jobs
    pub fn start(
        &mut self,
        pool: &mut WorkerPool,
        packs: &mut [PackRef],
        assignments: &mut HashMap<WorkerId, PackId>,
    ) -> Result<(), LoadError> {
        let initial = self.total.min(pool.capacity());
        for _ in 0..initial {
            self.dispatch_next(None, pool, packs, assignments)?;
        }
        Ok(())
    }

    /// Record a settled pack, surface warnings, pull the next pack with
    /// the freed worker, and emit progress/completion events
    #[allow(clippy::too_many_arguments)]
    pub fn on_settled(
        &mut self,
        worker: WorkerId,
        pack: PackId,
        error: Option<WireError>,
        pool: &mut WorkerPool,
        packs: &mut [PackRef],
        assignments: &mut HashMap<WorkerId, PackId>,
        progress: &mut ProgressTracker,
        events: &mut Vec<LoadEvent>,
    ) -> Result<(), LoadError> {
        if let Some(entry) = packs.iter_mut().find(|p| p.id == pack) {
            entry.loading = false;
        }
        match error {
            None => {
                self.succeeded += 1;
                // The aggregated warning rides along with the next
                // successful completion.
                if let Some(first) = self.first_error.clone() {
                    if !self.warned {
                        self.warned = true;
                        events.push(LoadEvent::PackWarning {
                            failed: self.failed,
                            first,
                        });
                    }
                }
            }
            Some(err) => {
                log::warn!("pack {} failed: {err}", pack.raw());
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }

        // Pull model: the finishing worker takes the next pack itself.
        self.dispatch_next(Some(worker), pool, packs, assignments)?;

        if let Some(percent) = progress.on_geometry_fraction(self.fraction()) {
            events.push(LoadEvent::Progress {
                percent,
                stage: LoadStage::Geometry,
            });
        }
        self.check_complete(progress, events);
        Ok(())
    }

    /// Fire the one-shot completion once every pack has settled. Also
    /// covers the zero-pack case right after start.
    pub fn check_complete(&mut self, progress: &mut ProgressTracker, events: &mut Vec<LoadEvent>) {
        if self.complete || self.succeeded + self.failed < self.total {
            return;
        }
        self.complete = true;
        if self.total == 0 {
            if let Some(percent) = progress.on_geometry_fraction(1.0) {
                events.push(LoadEvent::Progress {
                    percent,
                    stage: LoadStage::Geometry,
                });
            }
        }
        // A trailing failure would otherwise never be surfaced.
        if let Some(first) = self.first_error.clone() {
            if !self.warned {
                self.warned = true;
                events.push(LoadEvent::PackWarning {
                    failed: self.failed,
                    first,
                });
            }
        }
        log::info!(
            "geometry complete: {} succeeded, {} failed of {}",
            self.succeeded,
            self.failed,
            self.total
        );
        events.push(LoadEvent::GeometryLoaded {
            succeeded: self.succeeded,
            failed: self.failed,
        });
    }

    /// Accumulate decoded polygons; true when the repaint threshold was
    /// crossed (the threshold then grows by half)
    pub fn note_polygons(&mut self, count: u32) -> bool {
        self.polygons += u64::from(count);
        if self.polygons >= self.repaint_at {
            self.repaint_at += self.repaint_at / 2;
            true
        } else {
            false
        }
    }

    fn dispatch_next(
        &mut self,
        worker: Option<WorkerId>,
        pool: &mut WorkerPool,
        packs: &mut [PackRef],
        assignments: &mut HashMap<WorkerId, PackId>,
    ) -> Result<(), LoadError> {
        if self.next >= self.total {
            return Ok(());
        }
        let entry = &mut packs[self.next];
        entry.loading = true;
        self.next += 1;
        let request = DecodeRequest::LoadPack {
            pack: PackTransfer {
                id: entry.id.raw(),
                uri: entry.uri.clone(),
            },
        };
        let assigned = match worker {
            Some(id) => {
                pool.dispatch_to(id, request)?;
                id
            }
            None => pool.dispatch(request)?,
        };
        assignments.insert(assigned, entry.id);
        log::debug!("pack {} -> worker {}", entry.id.raw(), assigned.raw());
        Ok(())
    }
}
