//! Native module loading for the arkhost embedding layer.
//!
//! Maps module names requested by scripts to native libraries on disk, keeps
//! an ordered cache of everything that registered itself, and gives app
//! libraries their own linker namespace where the platform supports one.
//!
//! ```ignore
//! use arkhost_loader::{ModuleManagerConfig, ModuleRequest, NativeModuleManager, SystemLoader};
//! use std::sync::Arc;
//!
//! let manager = NativeModuleManager::new(ModuleManagerConfig::default(), Arc::new(SystemLoader));
//! let module = manager.resolve(&ModuleRequest::new("net.http"))?;
//! ```

pub mod config;
pub mod error;
pub mod ffi;
pub mod library;
pub mod manager;
pub mod module;
pub mod path;
pub mod register;
pub mod registry;

pub use config::ModuleManagerConfig;
pub use error::{LoadError, LoadResult};
pub use library::{LibraryLoader, LoadedLibrary, NamespaceId, SystemLoader};
pub use manager::{DEFAULT_APP_KEY, GetCodeFn, ModuleRequest, NativeModuleManager, bytecode_symbol_name};
pub use module::{EmbeddedCode, EnvHandle, ModuleDescriptor, NativeModule, RegisterCallback, ValueHandle};
pub use path::{CandidatePaths, LibraryNaming, candidate_paths};
pub use register::register_module;
pub use registry::{CacheLookup, ModuleRegistry};
