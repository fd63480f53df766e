//! Module manager configuration.

use crate::path::{LIBRARY_EXTENSION, LibraryNaming, NAPI_PATH_MAX};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// System libraries an isolated app namespace may link against.
pub const DEFAULT_NAMESPACE_ALLOW_LIST: &[&str] = &[
    "libc.so",
    "libm.so",
    "libdl.so",
    "libpthread.so",
    "libc++.so",
    "libarkhost_runtime.so",
];

/// Where and how native modules are looked up on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleManagerConfig {
    /// Directory holding system native modules.
    /// Default: `/system/lib/module`
    pub system_module_dir: PathBuf,

    /// Insert the `.z` marker before the library extension.
    /// Default: false
    pub zip_marker: bool,

    /// Upper bound for constructed paths and joined search paths.
    /// Default: 4096
    pub max_path_len: usize,

    /// Libraries visible to app namespaces from the default namespace.
    pub namespace_allow_list: Vec<String>,
}

impl Default for ModuleManagerConfig {
    fn default() -> Self {
        Self {
            system_module_dir: PathBuf::from("/system/lib/module"),
            zip_marker: false,
            max_path_len: NAPI_PATH_MAX,
            namespace_allow_list: DEFAULT_NAMESPACE_ALLOW_LIST
                .iter()
                .map(|lib| lib.to_string())
                .collect(),
        }
    }
}

impl ModuleManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the system module directory.
    pub fn system_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_module_dir = dir.into();
        self
    }

    /// Enable or disable the `.z` marker.
    pub fn zip_marker(mut self, enabled: bool) -> Self {
        self.zip_marker = enabled;
        self
    }

    /// Set the maximum path length.
    pub fn max_path_len(mut self, max: usize) -> Self {
        self.max_path_len = max;
        self
    }

    pub(crate) fn naming(&self) -> LibraryNaming {
        LibraryNaming {
            extension: LIBRARY_EXTENSION.to_string(),
            zip_marker: self.zip_marker,
            max_path_len: self.max_path_len,
        }
    }
}
