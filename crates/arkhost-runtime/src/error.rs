//! Error types for arkhost-runtime
//!
//! Wraps loader errors and adds engine lifecycle errors.

use thiserror::Error;

pub use arkhost_loader::{LoadError, LoadResult};

/// Errors that can occur while hosting an engine
#[derive(Error, Debug)]
pub enum HostError {
    /// Native module resolution failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The VM factory returned no VM
    #[error("Failed to create VM: {0}")]
    VmCreation(String),

    /// The native environment adapter could not be set up
    #[error("Failed to initialize native environment: {0}")]
    AdapterInit(String),

    /// The VM refused to bind to the run loop
    #[error("Failed to attach VM to the run loop")]
    LoopAttach,

    /// Creation on a dedicated thread did not finish in time
    #[error("Engine creation timed out after {0}ms")]
    CreateTimeout(u64),

    /// A dedicated or timer thread could not be started
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// The engine was already torn down or its thread is gone
    #[error("Engine is no longer available")]
    EngineGone,

    /// The run loop no longer accepts tasks
    #[error("Run loop is closed")]
    LoopClosed,

    /// An engine-bound operation was called off the engine's thread
    #[error("Engine {0} can only be used from its own thread")]
    WrongThread(u64),

    /// Script code threw
    #[error("Script exception: {0}")]
    Exception(String),

    /// Invalid host configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The process-wide host context was already installed
    #[error("Host context is already installed")]
    AlreadyInstalled,
}

impl HostError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for host operations
pub type HostResult<T> = Result<T, HostError>;
