//! Pipeline configuration
//!
//! No hidden globals: every tuning knob lives in an explicit config
//! struct injected at construction, so independent loads are
//! deterministically testable.

use std::num::NonZeroUsize;
use std::thread;

use strata_scene::IndexOptions;

use crate::protocol::RootRequest;

/// Fewest decode workers a pool will use
pub const MIN_POOL_WORKERS: usize = 2;
/// Most decode workers a pool will use
pub const MAX_POOL_WORKERS: usize = 6;

/// Default pool capacity for this machine: one worker per core, clamped
/// to the supported range (constrained devices land on the minimum)
pub fn default_pool_capacity() -> usize {
    let cores = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(MIN_POOL_WORKERS);
    cores.clamp(MIN_POOL_WORKERS, MAX_POOL_WORKERS)
}

/// Per-load pipeline knobs
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Decode worker cap for this load
    pub pool_capacity: usize,
    /// Skip activating fragments flagged hidden
    pub skip_hidden_fragments: bool,
    /// Decoded polygons accumulated before the first repaint hint;
    /// the threshold grows by 1.5x after each hint
    pub repaint_polygon_threshold: u64,
    /// Spatial-index build options
    pub index_options: IndexOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            skip_hidden_fragments: false,
            repaint_polygon_threshold: 100_000,
            index_options: IndexOptions::default(),
        }
    }
}

/// Options for one root load, carried in the decode request
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// Load only these fragment ids when set
    pub id_filter: Option<Vec<u32>>,
    /// Override the package's global offset
    pub global_offset: Option<[f32; 3]>,
    /// Apply the package refpoint as the global offset when no explicit
    /// offset is given
    pub apply_refpoint: bool,
    /// Override the package's unit scale
    pub unit_scale: Option<f32>,
    /// Initial placement transform
    pub placement: Option<strata_scene::MatrixTransfer>,
    /// Ask the decode worker to build the spatial index
    pub build_index_in_worker: bool,
}

impl LoadOptions {
    pub(crate) fn into_request(
        self,
        url: String,
        base_path: String,
        index_options: IndexOptions,
    ) -> RootRequest {
        RootRequest {
            url,
            base_path,
            id_filter: self.id_filter,
            global_offset: self.global_offset,
            apply_refpoint: self.apply_refpoint,
            unit_scale: self.unit_scale,
            placement: self.placement,
            build_index_in_worker: self.build_index_in_worker,
            index_options,
        }
    }
}

/// Process-wide texture admission settings shared by all loads
#[derive(Clone, Debug)]
pub struct TextureConfig {
    /// Concurrent fetch/decode ceiling
    pub ceiling: usize,
    /// Total texture memory budget in bytes, divided across the
    /// estimated texture count
    pub memory_budget_bytes: u64,
}

impl Default for TextureConfig {
    fn default() -> Self {
        // Constrained devices get a smaller admission window.
        let ceiling = if default_pool_capacity() <= MIN_POOL_WORKERS {
            2
        } else {
            6
        };
        Self {
            ceiling,
            memory_budget_bytes: 256 * 1024 * 1024,
        }
    }
}
