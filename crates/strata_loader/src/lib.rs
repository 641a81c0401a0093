//! # strata_loader - Streaming Scene-Package Pipeline
//!
//! Streams a binary-encoded scene package from a source, decodes it on
//! parallel worker threads and incrementally hands mesh instances, a
//! spatial index and textures to the rendering layer while bounding
//! memory and concurrency.
//!
//! - **Worker pool**: lazily grown decode threads with deterministic
//!   least-busy job placement
//! - **Root loader**: two-round manifest handshake producing the scene
//!   descriptor and model object
//! - **Pack streamer**: pull-based geometry streaming with partial
//!   failure tolerance
//! - **Texture throttler**: process-wide admission ceiling and memory
//!   budget shared across loads
//! - **Progress tracker**: one monotonic percentage across all stages
//!
//! ## Example
//!
//! ```ignore
//! use strata_loader::{
//!     Collaborators, FileSource, LoadOptions, LoadSession, PipelineConfig,
//!     TextureConfig, TextureThrottler,
//! };
//!
//! let source = std::sync::Arc::new(FileSource::new("scenes/plant"));
//! let throttler = TextureThrottler::new(TextureConfig::default());
//! let mut session = LoadSession::begin(
//!     "scene.json",
//!     "geometry",
//!     LoadOptions::default(),
//!     PipelineConfig::default(),
//!     source,
//!     throttler,
//!     Collaborators { sink, converter, properties },
//! )?;
//!
//! // In the application loop:
//! session.pump()?;
//! for event in session.poll_events() {
//!     // react to RootLoaded / GeometryLoaded / Progress ...
//! }
//! ```

pub mod collab;
pub mod config;
pub mod error;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod source;
pub mod texture;

mod root;
mod streamer;

pub use collab::{
    find_material, ConvertedMaterial, MaterialConverter, MeshSink, NoopPropertySink,
    PassthroughConverter, PropertySink,
};
pub use config::{
    default_pool_capacity, LoadOptions, PipelineConfig, TextureConfig, MAX_POOL_WORKERS,
    MIN_POOL_WORKERS,
};
pub use error::{LoadError, WireError};
pub use pool::{WorkerId, WorkerMessage, WorkerPool};
pub use progress::{LoadStage, ProgressTracker, ROOT_TICK};
pub use protocol::{
    DecodeRequest, DecodeResponse, Manifest, MeshTopology, PackFile, RootRequest,
    TopologyTransfer,
};
pub use root::RootState;
pub use session::{Collaborators, LoadEvent, LoadSession};
pub use source::{FileSource, MemorySource, ResourceSource};
pub use texture::{TextureAsset, TextureOptions, TextureThrottler, TextureTicket};
