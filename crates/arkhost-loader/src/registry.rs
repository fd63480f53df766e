//! Ordered registry of native modules.
//!
//! The registry mixes modules that registered themselves before the manager
//! resolved them (unloaded) with modules already bound to a library (loaded).
//! Lookups walk front to back and take the first case-insensitive name match.
//! An unloaded match is moved to the tail and reported as a miss so the caller
//! resolves it from disk; loaded entries never move.

use crate::library::LoadedLibrary;
use crate::module::{EmbeddedCode, ModuleDescriptor, NativeModule};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{trace, warn};

struct ModuleEntry {
    descriptor: ModuleDescriptor,
    resolved: Option<Arc<NativeModule>>,
}

impl ModuleEntry {
    fn matches(&self, name: &str) -> bool {
        self.descriptor.name.eq_ignore_ascii_case(name)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// A loaded record; returned as-is
    Hit(Arc<NativeModule>),
    /// An unloaded record matched and was moved to the tail
    Promoted,
    /// Nothing registered under the name
    Miss,
}

/// Owned list of module records.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an unloaded record.
    pub fn register(&mut self, descriptor: ModuleDescriptor) {
        trace!(module = %descriptor.name, "Registering native module");
        self.entries.push(ModuleEntry {
            descriptor,
            resolved: None,
        });
    }

    /// Append a record that is loaded from the start and never resolved from disk.
    pub fn register_loaded(&mut self, descriptor: ModuleDescriptor) -> Arc<NativeModule> {
        let module = Arc::new(NativeModule::resolve(&descriptor, None, None, None));
        self.entries.push(ModuleEntry {
            descriptor,
            resolved: Some(module.clone()),
        });
        module
    }

    /// Find `name`, promoting an unloaded match to the tail.
    pub fn lookup(&mut self, name: &str) -> CacheLookup {
        let Some(index) = self.entries.iter().position(|entry| entry.matches(name)) else {
            return CacheLookup::Miss;
        };

        let registered = &self.entries[index].descriptor.name;
        if registered != name {
            warn!(
                requested = name,
                registered = %registered,
                "Module name does not match the registered name's case"
            );
        }

        if let Some(module) = &self.entries[index].resolved {
            return CacheLookup::Hit(module.clone());
        }

        let entry = self.entries.remove(index);
        self.entries.push(entry);
        trace!(module = name, "Promoted unloaded module to the tail");
        CacheLookup::Promoted
    }

    /// Bind a record for `name` to the library it was loaded from.
    ///
    /// `descriptor` replaces the first unloaded match (or is appended when
    /// there is none). Without a descriptor the first unloaded match is bound;
    /// failing that, a code-only record is created when `code` is present.
    /// Returns `None` when there is nothing to bind.
    pub fn bind(
        &mut self,
        name: &str,
        descriptor: Option<ModuleDescriptor>,
        file_path: Option<PathBuf>,
        library: Option<Arc<dyn LoadedLibrary>>,
        code: Option<EmbeddedCode>,
    ) -> Option<Arc<NativeModule>> {
        if let Some(module) = self.get(name) {
            return Some(module);
        }

        let index = match (
            self.entries
                .iter()
                .position(|entry| entry.resolved.is_none() && entry.matches(name)),
            descriptor,
        ) {
            (Some(index), Some(descriptor)) => {
                self.entries[index].descriptor = descriptor;
                index
            }
            (Some(index), None) => index,
            (None, Some(descriptor)) => {
                self.register(descriptor);
                self.entries.len() - 1
            }
            (None, None) if code.is_some() => {
                self.register(ModuleDescriptor::new(name));
                self.entries.len() - 1
            }
            (None, None) => return None,
        };

        let entry = &mut self.entries[index];
        let module = Arc::new(NativeModule::resolve(
            &entry.descriptor,
            file_path,
            library,
            code,
        ));
        entry.resolved = Some(module.clone());
        Some(module)
    }

    /// The loaded record for `name`, without promotion.
    pub fn get(&self, name: &str) -> Option<Arc<NativeModule>> {
        self.entries
            .iter()
            .find(|entry| entry.matches(name))
            .and_then(|entry| entry.resolved.clone())
    }

    /// Loaded state of the first record matching `name`.
    pub fn is_loaded(&self, name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| entry.matches(name))
            .map(|entry| entry.resolved.is_some())
    }

    /// Registered names in list order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.name.clone())
            .collect()
    }

    /// Every loaded record in list order.
    pub fn loaded(&self) -> Vec<Arc<NativeModule>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.resolved.clone())
            .collect()
    }
}
