//! Native module manager
//!
//! Resolves a module name to a [`NativeModule`], consulting the registry first
//! and falling back to opening a library from disk.
//!
//! # Resolution
//!
//! 1. Build the candidate paths for the request (system directory, the
//!    configured app library path, or an explicit directory).
//! 2. Look the name up in the registry. A loaded record is returned as-is,
//!    unless the caller named a directory that would resolve to a different
//!    file, in which case the request is rejected rather than shadowed.
//! 3. Otherwise open the primary candidate, then the `_napi` candidate. The
//!    first library that opens is inspected for the registrations its
//!    initializers made and, for Ark bytecode modules, for embedded code.
//!
//! Resolutions are serialized per manager. A library initializer may resolve
//! other modules (the lock is re-entrant) but not the module being loaded.

use crate::config::ModuleManagerConfig;
use crate::error::{LoadError, LoadResult};
use crate::library::{LibraryLoader, LoadedLibrary, NamespaceId};
use crate::module::{EmbeddedCode, ModuleDescriptor, NativeModule};
use crate::path::{CandidatePaths, candidate_paths};
use crate::register::{RegistrationScope, take_pending};
use crate::registry::{CacheLookup, ModuleRegistry};
use libc::{c_int, c_void};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Key used for app modules that do not name their library path.
pub const DEFAULT_APP_KEY: &str = "default";

/// Signature of the exported function that hands out embedded bytecode.
pub type GetCodeFn = unsafe extern "C" fn(buf: *mut *const u8, len: *mut c_int);

/// A request to resolve a native module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleRequest {
    pub name: String,
    /// Directory to resolve against instead of the configured one
    pub path: Option<PathBuf>,
    /// Resolve against the app library path inside its namespace
    pub app_module: bool,
    /// App library path key, [`DEFAULT_APP_KEY`] when unset
    pub app_key: Option<String>,
    /// Requested by the host framework itself
    pub internal: bool,
    /// Look for embedded Ark bytecode in the library
    pub ark_module: bool,
}

impl ModuleRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path = Some(dir.into());
        self
    }

    pub fn app(mut self) -> Self {
        self.app_module = true;
        self
    }

    pub fn app_key(mut self, key: impl Into<String>) -> Self {
        self.app_module = true;
        self.app_key = Some(key.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn ark(mut self) -> Self {
        self.ark_module = true;
        self
    }
}

struct AppLibPath {
    primary: PathBuf,
    search_path: String,
    namespace: Option<NamespaceId>,
}

struct SearchPrefix {
    dir: String,
    namespace: Option<NamespaceId>,
}

/// Process-wide native module manager.
pub struct NativeModuleManager {
    config: ModuleManagerConfig,
    loader: Arc<dyn LibraryLoader>,
    registry: Mutex<ModuleRegistry>,
    // Names whose resolution is in progress under the held lock.
    loading: ReentrantMutex<RefCell<HashSet<String>>>,
    app_paths: RwLock<HashMap<String, AppLibPath>>,
    libraries_opened: AtomicU64,
}

impl NativeModuleManager {
    /// Create a manager, claiming any statically registered modules.
    pub fn new(config: ModuleManagerConfig, loader: Arc<dyn LibraryLoader>) -> Self {
        let mut registry = ModuleRegistry::new();
        for descriptor in take_pending() {
            registry.register(descriptor);
        }
        if !registry.is_empty() {
            debug!(count = registry.len(), "Claimed static module registrations");
        }

        Self {
            config,
            loader,
            registry: Mutex::new(registry),
            loading: ReentrantMutex::new(RefCell::new(HashSet::new())),
            app_paths: RwLock::new(HashMap::new()),
            libraries_opened: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ModuleManagerConfig {
        &self.config
    }

    /// Add an unloaded module record; it is bound to a library on first resolve.
    pub fn register(&self, descriptor: ModuleDescriptor) {
        self.registry.lock().register(descriptor);
    }

    /// Add a module built into the host. It resolves without touching disk.
    pub fn register_builtin(&self, descriptor: ModuleDescriptor) -> Arc<NativeModule> {
        self.registry.lock().register_loaded(descriptor)
    }

    /// Configure the library search path for app modules under `key`.
    ///
    /// Candidates are built against the first directory; the full
    /// colon-joined path is given to the isolated namespace.
    pub fn set_app_lib_path(&self, key: &str, paths: &[PathBuf]) -> LoadResult<()> {
        let Some(primary) = paths.first() else {
            return Err(LoadError::NoAppLibPath(key.to_string()));
        };

        let search_path = paths
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":");
        if search_path.len() >= self.config.max_path_len {
            return Err(LoadError::PathTooLong {
                max: self.config.max_path_len,
            });
        }

        let namespace = self.loader.create_namespace(
            key,
            &search_path,
            &self.config.namespace_allow_list,
        )?;
        info!(key, search_path = %search_path, isolated = namespace.is_some(), "App library path set");

        self.app_paths.write().insert(
            key.to_string(),
            AppLibPath {
                primary: primary.clone(),
                search_path,
                namespace,
            },
        );
        Ok(())
    }

    /// The colon-joined search path configured under `key`.
    pub fn app_search_path(&self, key: &str) -> Option<String> {
        self.app_paths
            .read()
            .get(key)
            .map(|app| app.search_path.clone())
    }

    /// Candidate library paths for a request, without loading anything.
    pub fn candidate_paths(&self, request: &ModuleRequest) -> LoadResult<CandidatePaths> {
        let prefix = self.search_prefix(request)?;
        candidate_paths(&prefix.dir, &request.name, &self.config.naming())
    }

    /// Resolve a module, loading it from disk when it is not cached.
    pub fn resolve(&self, request: &ModuleRequest) -> LoadResult<Arc<NativeModule>> {
        let name = request.name.as_str();
        if name.is_empty() {
            error!("Cannot resolve a native module without a name");
            return Err(LoadError::EmptyName);
        }

        let loading = self.loading.lock();
        let key = name.to_ascii_lowercase();
        if !loading.borrow_mut().insert(key.clone()) {
            warn!(module = name, "Module requested itself while loading");
            return Err(LoadError::Reentrant(name.to_string()));
        }
        let _in_flight = scopeguard::guard(key, |key| {
            loading.borrow_mut().remove(&key);
        });

        let result = self.resolve_locked(request);
        if let Err(e) = &result {
            if request.internal {
                debug!(module = name, error = %e, "Internal module not resolved");
            } else {
                error!(module = name, error = %e, "Failed to resolve native module");
            }
        }
        result
    }

    fn resolve_locked(&self, request: &ModuleRequest) -> LoadResult<Arc<NativeModule>> {
        let prefix = self.search_prefix(request)?;
        let candidates = candidate_paths(&prefix.dir, &request.name, &self.config.naming())?;

        let lookup = self.registry.lock().lookup(&request.name);
        match lookup {
            CacheLookup::Hit(module) => return self.check_shadow(module, request, &candidates),
            CacheLookup::Promoted => {
                trace!(module = %request.name, "Registered module not yet loaded");
            }
            CacheLookup::Miss => {}
        }

        self.load_from_disk(request, &candidates, prefix.namespace.as_ref())
    }

    fn check_shadow(
        &self,
        module: Arc<NativeModule>,
        request: &ModuleRequest,
        candidates: &CandidatePaths,
    ) -> LoadResult<Arc<NativeModule>> {
        if request.path.is_none() {
            return Ok(module);
        }
        match module.file_path() {
            Some(existing) if !candidates.contains(existing) => Err(LoadError::ShadowConflict {
                name: request.name.clone(),
                existing: existing.display().to_string(),
                requested: candidates.primary().display().to_string(),
            }),
            _ => Ok(module),
        }
    }

    fn load_from_disk(
        &self,
        request: &ModuleRequest,
        candidates: &CandidatePaths,
        namespace: Option<&NamespaceId>,
    ) -> LoadResult<Arc<NativeModule>> {
        let name = request.name.as_str();
        let code_symbol = if request.ark_module {
            Some(bytecode_symbol_name(name)?)
        } else {
            None
        };
        let scope = RegistrationScope::enter();
        let mut opened = None;
        for path in candidates.iter() {
            match self.loader.open(path, namespace) {
                Ok(library) => {
                    opened = Some(library);
                    break;
                }
                Err(e) => debug!(module = name, path = %path.display(), error = %e, "Candidate did not open"),
            }
        }
        let captured = scope.finish();

        let Some(library) = opened else {
            self.keep_unclaimed(captured);
            return Err(LoadError::NotFound(name.to_string()));
        };
        self.libraries_opened.fetch_add(1, Ordering::Relaxed);

        let code = code_symbol
            .as_deref()
            .and_then(|symbol| embedded_code(library.as_ref(), name, symbol));

        let mut own = None;
        let mut others = Vec::new();
        for descriptor in captured {
            if own.is_none() && descriptor.name.eq_ignore_ascii_case(name) {
                if descriptor.name != name {
                    warn!(
                        requested = name,
                        registered = %descriptor.name,
                        "Module name does not match the registered name's case"
                    );
                }
                own = Some(descriptor);
            } else {
                others.push(descriptor);
            }
        }

        let file_path = library.path().to_path_buf();
        let mut registry = self.registry.lock();
        for descriptor in others {
            registry.register(descriptor);
        }
        match registry.bind(name, own, Some(file_path.clone()), Some(library), code) {
            Some(module) => {
                debug!(module = name, path = %file_path.display(), "Loaded native module");
                Ok(module)
            }
            None => {
                error!(module = name, path = %file_path.display(), "Library did not register the module");
                Err(LoadError::NotFound(name.to_string()))
            }
        }
    }

    fn keep_unclaimed(&self, captured: Vec<ModuleDescriptor>) {
        if captured.is_empty() {
            return;
        }
        let mut registry = self.registry.lock();
        for descriptor in captured {
            registry.register(descriptor);
        }
    }

    fn search_prefix(&self, request: &ModuleRequest) -> LoadResult<SearchPrefix> {
        let system_dir = || self.config.system_module_dir.to_string_lossy().into_owned();

        if request.internal {
            return Ok(SearchPrefix {
                dir: system_dir(),
                namespace: None,
            });
        }

        if request.app_module {
            let key = request.app_key.as_deref().unwrap_or(DEFAULT_APP_KEY);
            let app_paths = self.app_paths.read();
            let app = match app_paths.get(key) {
                Some(app) => app,
                None if request.path.is_some() => {
                    return Ok(SearchPrefix {
                        dir: path_string(request.path.as_deref()),
                        namespace: None,
                    });
                }
                None => return Err(LoadError::NoAppLibPath(key.to_string())),
            };
            let dir = match &request.path {
                Some(path) => path_string(Some(path)),
                None => app.primary.to_string_lossy().into_owned(),
            };
            return Ok(SearchPrefix {
                dir,
                namespace: app.namespace.clone(),
            });
        }

        Ok(SearchPrefix {
            dir: match &request.path {
                Some(path) => path_string(Some(path)),
                None => system_dir(),
            },
            namespace: None,
        })
    }

    /// Every loaded module, in registry order.
    pub fn loaded_modules(&self) -> Vec<Arc<NativeModule>> {
        self.registry.lock().loaded()
    }

    /// Registered module names, in registry order.
    pub fn registered_names(&self) -> Vec<String> {
        self.registry.lock().names()
    }

    /// Loaded state of `name`, `None` when it is not registered.
    pub fn is_loaded(&self, name: &str) -> Option<bool> {
        self.registry.lock().is_loaded(name)
    }

    /// Number of libraries successfully opened by this manager.
    pub fn libraries_opened(&self) -> u64 {
        self.libraries_opened.load(Ordering::Relaxed)
    }
}

/// Symbol exporting a module's embedded bytecode.
pub fn bytecode_symbol_name(name: &str) -> LoadResult<CString> {
    let sanitized = name.replace(['.', '/'], "_");
    CString::new(format!("NAPI_{sanitized}_GetABCCode"))
        .map_err(|_| LoadError::InvalidSymbolName(name.to_string()))
}

fn embedded_code(library: &dyn LoadedLibrary, name: &str, symbol: &CStr) -> Option<EmbeddedCode> {
    let Some(address) = library.symbol(symbol) else {
        debug!(module = name, "No embedded bytecode, using the native callback only");
        return None;
    };

    // SAFETY: the exported symbol has the GetCodeFn signature by convention.
    let get_code = unsafe { std::mem::transmute::<*mut c_void, GetCodeFn>(address.as_ptr()) };
    let mut buf: *const u8 = std::ptr::null();
    let mut len: c_int = 0;
    unsafe { get_code(&mut buf, &mut len) };

    if buf.is_null() || len <= 0 {
        debug!(module = name, "Embedded bytecode symbol returned no data");
        return None;
    }
    // SAFETY: the library owns `len` readable bytes at `buf` while it is mapped.
    let bytes = unsafe { std::slice::from_raw_parts(buf, len as usize) };
    Some(EmbeddedCode::from(bytes))
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}
