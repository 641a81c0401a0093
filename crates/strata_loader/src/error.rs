//! Error taxonomy for the loading pipeline
//!
//! Worker-local failures cross the boundary as serialized `WireError`
//! data and are reclassified by stage on the consumer side: root and
//! worker-initialization failures are fatal, pack and texture failures
//! are accumulated and surfaced without halting the load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error serialized across the decode-worker boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

impl WireError {
    pub const FETCH: i32 = 10;
    pub const MANIFEST: i32 = 20;
    pub const PACK: i32 = 30;
    pub const MESH: i32 = 31;
    pub const PROTOCOL: i32 = 40;
    pub const TOPOLOGY: i32 = 50;
    pub const MATERIAL: i32 = 60;
    pub const TEXTURE: i32 = 70;
    pub const PROPERTIES: i32 = 80;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(Self::FETCH, message)
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::new(Self::MANIFEST, message)
    }

    pub fn pack(message: impl Into<String>) -> Self {
        Self::new(Self::PACK, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL, message)
    }
}

/// Fatal pipeline errors surfaced to the caller
#[derive(Debug, Error)]
pub enum LoadError {
    /// The manifest or initial scene decode failed; the whole load is
    /// aborted and no partial model remains
    #[error("root load failed: {0}")]
    RootLoad(WireError),

    /// A pipeline thread could not be started; never retried
    #[error("worker initialization failed: {0}")]
    WorkerInit(#[from] std::io::Error),

    /// The load was cancelled by the caller
    #[error("load cancelled")]
    Cancelled,
}
