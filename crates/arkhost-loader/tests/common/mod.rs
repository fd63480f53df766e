#![allow(dead_code)]

use arkhost_loader::{LibraryLoader, LoadError, LoadResult, LoadedLibrary, NamespaceId};
use libc::c_void;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

type Init = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct FakeLibrary {
    init: Option<Init>,
    symbols: HashMap<CString, usize>,
}

/// A loader over an in-memory set of libraries.
///
/// Opening a library runs its initializer, which plays the part of the
/// library's static constructors.
#[derive(Default)]
pub struct MockLoader {
    libraries: Mutex<HashMap<PathBuf, FakeLibrary>>,
    opened: Mutex<Vec<(PathBuf, Option<NamespaceId>)>>,
    attempts: Mutex<Vec<PathBuf>>,
    namespaces: Mutex<Vec<(String, String, Vec<String>)>>,
    namespace_support: bool,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_namespaces() -> Arc<Self> {
        Arc::new(Self {
            namespace_support: true,
            ..Default::default()
        })
    }

    /// Add a library whose initializer runs `init`.
    pub fn add_library(&self, path: impl Into<PathBuf>, init: impl Fn() + Send + Sync + 'static) {
        self.libraries.lock().entry(path.into()).or_default().init = Some(Arc::new(init));
    }

    /// Add a library with no initializer.
    pub fn add_empty_library(&self, path: impl Into<PathBuf>) {
        self.libraries.lock().entry(path.into()).or_default();
    }

    pub fn add_symbol(&self, path: impl Into<PathBuf>, name: &CStr, address: usize) {
        self.libraries
            .lock()
            .entry(path.into())
            .or_default()
            .symbols
            .insert(name.to_owned(), address);
    }

    /// Libraries successfully opened, in order.
    pub fn opened(&self) -> Vec<(PathBuf, Option<NamespaceId>)> {
        self.opened.lock().clone()
    }

    /// Every path passed to `open`, in order.
    pub fn attempts(&self) -> Vec<PathBuf> {
        self.attempts.lock().clone()
    }

    pub fn namespaces(&self) -> Vec<(String, String, Vec<String>)> {
        self.namespaces.lock().clone()
    }
}

impl LibraryLoader for MockLoader {
    fn open(
        &self,
        path: &Path,
        namespace: Option<&NamespaceId>,
    ) -> LoadResult<Arc<dyn LoadedLibrary>> {
        self.attempts.lock().push(path.to_path_buf());
        let Some(library) = self.libraries.lock().get(path).cloned() else {
            return Err(LoadError::Open {
                path: path.display().to_string(),
                message: "no such file".to_string(),
            });
        };

        // The initializer may resolve other modules, so no lock is held here.
        if let Some(init) = &library.init {
            init();
        }
        self.opened
            .lock()
            .push((path.to_path_buf(), namespace.cloned()));

        Ok(Arc::new(MockLibrary {
            path: path.to_path_buf(),
            symbols: library.symbols,
        }))
    }

    fn create_namespace(
        &self,
        name: &str,
        search_path: &str,
        allow_list: &[String],
    ) -> LoadResult<Option<NamespaceId>> {
        if !self.namespace_support {
            return Ok(None);
        }
        self.namespaces.lock().push((
            name.to_string(),
            search_path.to_string(),
            allow_list.to_vec(),
        ));
        Ok(Some(NamespaceId::new(format!("ns:{name}"))))
    }
}

struct MockLibrary {
    path: PathBuf,
    symbols: HashMap<CString, usize>,
}

impl LoadedLibrary for MockLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        self.symbols
            .get(name)
            .and_then(|address| NonNull::new(*address as *mut c_void))
    }
}
