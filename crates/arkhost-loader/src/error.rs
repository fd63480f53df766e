//! Error types for native module resolution.

use thiserror::Error;

/// Errors that can occur while resolving or loading a native module.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The request carried no module name
    #[error("Module name must not be empty")]
    EmptyName,

    /// The module name cannot be turned into a library path
    #[error("Invalid module name: {0}")]
    InvalidName(String),

    /// No candidate library provided the module
    #[error("Module not found: {0}")]
    NotFound(String),

    /// The module is already loaded from a different file
    #[error("Module '{name}' is already loaded from '{existing}', cannot shadow it with '{requested}'")]
    ShadowConflict {
        name: String,
        existing: String,
        requested: String,
    },

    /// A constructed path does not fit the platform limit
    #[error("Path exceeds the maximum length of {max} bytes")]
    PathTooLong { max: usize },

    /// The dynamic linker refused to open a library
    #[error("Failed to open library '{path}': {message}")]
    Open { path: String, message: String },

    /// The embedded-code symbol name could not be formed
    #[error("Cannot build symbol name for module '{0}'")]
    InvalidSymbolName(String),

    /// The module asked to load itself while it is being loaded
    #[error("Module '{0}' is already being loaded")]
    Reentrant(String),

    /// App-scoped load requested without a configured search path
    #[error("No application library path configured for '{0}'")]
    NoAppLibPath(String),

    /// Creating an isolated linker namespace failed
    #[error("Linker namespace error: {0}")]
    Namespace(String),
}

impl LoadError {
    /// Whether this error should surface to scripts as "module not found".
    ///
    /// Shadow conflicts are reported the same way, the caller only sees that
    /// the name did not resolve.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EmptyName
                | Self::InvalidName(_)
                | Self::NotFound(_)
                | Self::ShadowConflict { .. }
                | Self::NoAppLibPath(_)
        )
    }
}

/// Result type alias for loader operations
pub type LoadResult<T> = Result<T, LoadError>;
