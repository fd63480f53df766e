//! Native environment handed to module registration callbacks.

use crate::error::{HostError, HostResult};
use crate::vm::Vm;
use arkhost_loader::{EnvHandle, ValueHandle};
use std::fmt;
use tracing::{debug, trace};

/// Identifies a cleanup hook for [`NativeEnv::remove_cleanup_hook`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CleanupHookId(u64);

type CleanupHook = Box<dyn FnOnce() + Send + 'static>;

/// Per-engine adapter between native modules and the VM.
///
/// Cleanup hooks run in reverse registration order when the environment is
/// destroyed, which is the first step of engine teardown.
pub struct NativeEnv {
    handle: EnvHandle,
    global: ValueHandle,
    hooks: Vec<(CleanupHookId, CleanupHook)>,
    next_hook: u64,
    destroyed: bool,
}

impl fmt::Debug for NativeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEnv")
            .field("handle", &self.handle)
            .field("global", &self.global)
            .field("hooks", &self.hooks.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl NativeEnv {
    /// Create the environment for engine `engine_id`, allocating its root
    /// object in `vm`.
    pub(crate) fn new(engine_id: u64, vm: &mut dyn Vm) -> HostResult<Self> {
        let global = vm.new_object().ok_or_else(|| {
            HostError::AdapterInit(format!("engine {engine_id}: VM could not allocate the root object"))
        })?;
        Ok(Self {
            handle: EnvHandle(engine_id),
            global,
            hooks: Vec::new(),
            next_hook: 1,
            destroyed: false,
        })
    }

    pub fn handle(&self) -> EnvHandle {
        self.handle
    }

    /// Root object owned by the environment.
    pub fn global(&self) -> ValueHandle {
        self.global
    }

    pub fn add_cleanup_hook<F>(&mut self, hook: F) -> CleanupHookId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = CleanupHookId(self.next_hook);
        self.next_hook += 1;
        self.hooks.push((id, Box::new(hook)));
        id
    }

    /// Returns false if the hook already ran or was never added.
    pub fn remove_cleanup_hook(&mut self, id: CleanupHookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hook, _)| *hook != id);
        self.hooks.len() != before
    }

    pub fn cleanup_hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Run the cleanup hooks, newest first.
    pub(crate) fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if !self.hooks.is_empty() {
            debug!(env = self.handle.0, hooks = self.hooks.len(), "Running env cleanup hooks");
        }
        while let Some((id, hook)) = self.hooks.pop() {
            trace!(hook = id.0, "Cleanup hook");
            hook();
        }
    }
}

impl Drop for NativeEnv {
    fn drop(&mut self) {
        self.destroy();
    }
}
