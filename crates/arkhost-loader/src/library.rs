//! Dynamic library loading.
//!
//! The module manager only talks to the dynamic linker through the
//! [`LibraryLoader`] trait so that hosts (and tests) can substitute their own
//! loader. [`SystemLoader`] is the default, backed by `libloading`.
//!
//! # Platform-specific behavior
//!
//! - **Unix**: `dlopen(RTLD_NOW | RTLD_LOCAL)`
//! - **Windows**: `LoadLibraryExW` through `libloading`
//!
//! Linker namespaces are only meaningful where the platform linker supports
//! them. On every other platform [`LibraryLoader::create_namespace`] returns
//! `Ok(None)` and app libraries load into the default namespace.

use crate::error::{LoadError, LoadResult};
use libc::c_void;
use std::ffi::CStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Identifies an isolated linker namespace created for app libraries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A library mapped into the process.
pub trait LoadedLibrary: Send + Sync {
    /// Path the library was opened from.
    fn path(&self) -> &Path;

    /// Address of an exported symbol, `None` if the library does not export it.
    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>>;
}

/// Platform abstraction over the dynamic linker.
pub trait LibraryLoader: Send + Sync {
    /// Open the library at `path`, inside `namespace` when one is given.
    fn open(
        &self,
        path: &Path,
        namespace: Option<&NamespaceId>,
    ) -> LoadResult<Arc<dyn LoadedLibrary>>;

    /// Create an isolated namespace that searches `search_path` and may only
    /// link against the libraries named in `allow_list` from the default
    /// namespace.
    ///
    /// Returns `Ok(None)` when the platform has no namespace support.
    fn create_namespace(
        &self,
        name: &str,
        search_path: &str,
        allow_list: &[String],
    ) -> LoadResult<Option<NamespaceId>> {
        debug!(
            namespace = name,
            search_path,
            allowed = allow_list.len(),
            "Linker namespaces unsupported, using default namespace"
        );
        Ok(None)
    }
}

/// Loader backed by the platform dynamic linker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl SystemLoader {
    pub fn new() -> Self {
        Self
    }
}

impl LibraryLoader for SystemLoader {
    fn open(
        &self,
        path: &Path,
        namespace: Option<&NamespaceId>,
    ) -> LoadResult<Arc<dyn LoadedLibrary>> {
        if let Some(ns) = namespace {
            debug!(namespace = %ns, path = %path.display(), "Opening library in namespace");
        }

        let library = open_library(path).map_err(|e| LoadError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(Arc::new(SystemLibrary {
            path: path.to_path_buf(),
            library,
        }))
    }
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};

    // SAFETY: running a library's initializers is the point of loading it; the
    // caller chose the path.
    unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Into::into)
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    // SAFETY: see the unix variant.
    unsafe { libloading::Library::new(path) }
}

struct SystemLibrary {
    path: PathBuf,
    library: libloading::Library,
}

impl LoadedLibrary for SystemLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: the symbol is read as an untyped address; callers cast it to
        // the signature they expect.
        let symbol = unsafe { self.library.get::<*mut c_void>(name.to_bytes_with_nul()) }.ok()?;
        NonNull::new(*symbol)
    }
}
