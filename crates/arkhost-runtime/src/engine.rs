//! Engine lifecycle
//!
//! An [`Engine`] owns one VM, its native environment and the table of native
//! modules required through it. It is bound to the run loop of the thread that
//! created it and must only be touched from that thread; other threads go
//! through [`Engine::post`].
//!
//! Engines are created either inline on the calling thread
//! ([`Engine::create_inline`]) or on a dedicated thread
//! ([`Engine::create_on_dedicated_thread`]), where the caller waits for the
//! result with a timeout. A creation that times out is cleaned up on the
//! dedicated thread once it finishes, and the thread is stopped.
//!
//! Teardown runs on the owning thread in a fixed order: the environment's
//! cleanup hooks, then the module table and loop listeners, then the VM.
//! Destroying an engine from inside its own running loop is a programming
//! error and panics.

use crate::context::HostContext;
use crate::env::NativeEnv;
use crate::error::{HostError, HostResult};
use crate::event_loop::{EventLoop, ListenerId, LoopObserver};
use crate::idle::GcTrigger;
use crate::runner::LoopRunner;
use crate::vm::{GcKind, ScriptSource, Vm, VmFactory, VmOptions};
use arkhost_loader::{EnvHandle, LoadError, ModuleRequest, NativeModuleManager, ValueHandle};
use crossbeam_channel::{RecvTimeoutError, bounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Statistics about engine lifecycles
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    /// Engines that finished creation
    pub engines_created: AtomicU64,
    /// Engines torn down, including ones cleaned up after a timeout
    pub engines_destroyed: AtomicU64,
    /// Creations that failed before the engine was usable
    pub creation_failures: AtomicU64,
    /// Dedicated-thread creations the caller stopped waiting for
    pub creation_timeouts: AtomicU64,
    /// Dedicated engine threads currently alive
    pub dedicated_threads_live: AtomicU64,
}

impl LifecycleStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> LifecycleStatsSnapshot {
        LifecycleStatsSnapshot {
            engines_created: self.engines_created.load(Ordering::Relaxed),
            engines_destroyed: self.engines_destroyed.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            creation_timeouts: self.creation_timeouts.load(Ordering::Relaxed),
            dedicated_threads_live: self.dedicated_threads_live.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of lifecycle statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleStatsSnapshot {
    pub engines_created: u64,
    pub engines_destroyed: u64,
    pub creation_failures: u64,
    pub creation_timeouts: u64,
    pub dedicated_threads_live: u64,
}

impl LifecycleStatsSnapshot {
    /// Engines created and not yet destroyed
    pub fn live_engines(&self) -> u64 {
        self.engines_created.saturating_sub(self.engines_destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Creating,
    Running,
    Destroying,
    Destroyed,
}

/// State that only exists between a successful creation and teardown.
struct EngineCore {
    vm: Box<dyn Vm>,
    env: NativeEnv,
    /// Lowercased module name to export object
    modules: HashMap<String, ValueHandle>,
    /// Observers this engine added to its own loop
    listeners: Vec<ListenerId>,
}

struct EngineShared {
    id: u64,
    owner: ThreadId,
    event_loop: EventLoop,
    state: Mutex<EngineState>,
    core: Mutex<Option<EngineCore>>,
    factory: Arc<dyn VmFactory>,
    modules: Arc<NativeModuleManager>,
    stats: Arc<LifecycleStats>,
}

impl EngineShared {
    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Tear the engine down in place. A no-op once the core is gone.
    fn teardown(&self) {
        let Some(core) = self.core.lock().take() else {
            return;
        };
        self.set_state(EngineState::Destroying);
        debug!(engine = self.id, "Tearing down engine");

        let EngineCore {
            vm,
            mut env,
            mut modules,
            listeners,
        } = core;

        env.destroy();
        drop(env);
        modules.clear();
        for listener in listeners {
            self.event_loop.remove_observer(listener);
        }
        self.factory.destroy_vm(vm);

        self.set_state(EngineState::Destroyed);
        self.stats.engines_destroyed.fetch_add(1, Ordering::Relaxed);
        info!(engine = self.id, "Engine destroyed");
    }

    fn with_vm(&self, f: impl FnOnce(&mut dyn Vm)) {
        if let Some(core) = self.core.lock().as_mut() {
            f(&mut *core.vm);
        }
    }
}

/// A scripting engine bound to one thread's run loop.
pub struct Engine {
    shared: Arc<EngineShared>,
    runner: Option<LoopRunner>,
    host_listeners: Vec<(EventLoop, ListenerId)>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("dedicated", &self.runner.is_some())
            .finish()
    }
}

impl Engine {
    /// Create an engine on the calling thread, bound to this thread's loop.
    pub fn create_inline(ctx: &HostContext) -> HostResult<Self> {
        let shared = create_here(ctx, ctx.next_engine_id())?;
        Ok(Self {
            shared,
            runner: None,
            host_listeners: Vec::new(),
        })
    }

    /// Create an engine on a new dedicated thread, waiting up to `timeout`.
    pub fn create_on_dedicated_thread(ctx: &HostContext, timeout: Duration) -> HostResult<Self> {
        let id = ctx.next_engine_id();
        let stats = ctx.stats().clone();
        let engine_config = &ctx.config().engine;
        let name = format!("{}-{}", engine_config.thread_name_prefix, id);
        let runner = LoopRunner::spawn(name, engine_config.loop_wait_slice(), stats.clone())
            .inspect_err(|_| {
                stats.creation_failures.fetch_add(1, Ordering::Relaxed);
            })?;

        let (tx, rx) = bounded::<HostResult<Arc<EngineShared>>>(1);
        let create_ctx = ctx.clone();
        let posted = runner.event_loop().post(move || {
            let _ = tx.send(create_here(&create_ctx, id));
        });
        if let Err(e) = posted {
            stats.creation_failures.fetch_add(1, Ordering::Relaxed);
            runner.stop_and_join();
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(shared)) => Ok(Self {
                shared,
                runner: Some(runner),
                host_listeners: Vec::new(),
            }),
            Ok(Err(e)) => {
                runner.stop_and_join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout_ms = timeout.as_millis() as u64;
                stats.creation_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(engine = id, timeout_ms, "Engine creation timed out");

                // Queued behind the creation task, so the result is ready when
                // this runs.
                let cleanup = runner.event_loop().post(move || {
                    if let Ok(Ok(shared)) = rx.try_recv() {
                        debug!(engine = shared.id, "Destroying engine created after timeout");
                        shared.teardown();
                    }
                });
                if let Err(e) = cleanup {
                    error!(engine = id, error = %e, "Failed to post creation cleanup");
                }
                runner.detach();
                Err(HostError::CreateTimeout(timeout_ms))
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!(engine = id, "Engine thread exited during creation");
                stats.creation_failures.fetch_add(1, Ordering::Relaxed);
                runner.stop_and_join();
                Err(HostError::EngineGone)
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Whether the engine runs on its own thread.
    pub fn is_dedicated(&self) -> bool {
        self.runner.is_some()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    /// Handle of the engine's native environment.
    pub fn env_handle(&self) -> HostResult<EnvHandle> {
        self.shared
            .core
            .lock()
            .as_ref()
            .map(|core| core.env.handle())
            .ok_or(HostError::EngineGone)
    }

    /// Run `f` against the engine. Must be called on the owning thread and is
    /// not re-entrant.
    pub fn with_scope<R>(&self, f: impl FnOnce(&mut EngineScope<'_>) -> R) -> HostResult<R> {
        with_scope(&self.shared, f)
    }

    /// Run `f` against the engine on its owning thread.
    pub fn post<F>(&self, f: F) -> HostResult<()>
    where
        F: FnOnce(&mut EngineScope<'_>) + Send + 'static,
    {
        let shared = Arc::downgrade(&self.shared);
        self.shared.event_loop.post(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Err(e) = with_scope(&shared, f) {
                debug!(engine = shared.id, error = %e, "Posted engine task skipped");
            }
        })
    }

    /// Observe `host_loop` on behalf of this engine. The observer is removed
    /// when the engine is destroyed.
    pub fn add_host_listener(
        &mut self,
        host_loop: &EventLoop,
        observer: Arc<dyn LoopObserver>,
    ) -> ListenerId {
        let id = host_loop.add_observer(observer);
        self.host_listeners.push((host_loop.clone(), id));
        id
    }

    /// A GC target that forwards requests to this engine's VM.
    pub fn gc_trigger(&self) -> Arc<dyn GcTrigger> {
        Arc::new(EngineGcTrigger {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Destroy the engine.
    ///
    /// # Panics
    ///
    /// When called from a task running on the engine's own loop.
    pub fn destroy(mut self) {
        assert!(
            !self.shared.event_loop.is_running_on_current_thread(),
            "engine {} destroyed from the thread running its loop",
            self.shared.id
        );
        self.shutdown();
    }

    fn shutdown(&mut self) {
        match self.runner.take() {
            Some(runner) => {
                let (tx, rx) = bounded::<()>(1);
                let shared = self.shared.clone();
                let posted = runner.event_loop().post(move || {
                    shared.teardown();
                    let _ = tx.send(());
                });
                match posted {
                    Ok(()) => {
                        if rx.recv().is_err() {
                            warn!(engine = self.shared.id, "Engine thread exited before acknowledging teardown");
                        }
                    }
                    Err(e) => {
                        warn!(engine = self.shared.id, error = %e, "Engine loop closed, tearing down in place");
                    }
                }
                self.shared.teardown();
                self.remove_host_listeners();
                runner.stop_and_join();
            }
            None => {
                self.shared.teardown();
                self.remove_host_listeners();
            }
        }
    }

    fn remove_host_listeners(&mut self) {
        for (host_loop, id) in self.host_listeners.drain(..) {
            host_loop.remove_observer(id);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let alive = self.shared.core.lock().is_some();
        if !alive && self.runner.is_none() && self.host_listeners.is_empty() {
            return;
        }
        if self.shared.event_loop.is_running_on_current_thread() {
            if std::thread::panicking() {
                error!(engine = self.shared.id, "Engine dropped on its own loop while unwinding, leaking it");
                return;
            }
            panic!(
                "engine {} dropped on the thread running its loop",
                self.shared.id
            );
        }
        self.shutdown();
    }
}

/// Create an engine bound to the calling thread's loop.
fn create_here(ctx: &HostContext, id: u64) -> HostResult<Arc<EngineShared>> {
    let stats = ctx.stats().clone();
    let shared = Arc::new(EngineShared {
        id,
        owner: std::thread::current().id(),
        event_loop: EventLoop::current(),
        state: Mutex::new(EngineState::Uninitialized),
        core: Mutex::new(None),
        factory: ctx.factory().clone(),
        modules: ctx.modules().clone(),
        stats: stats.clone(),
    });

    shared.set_state(EngineState::Creating);
    match create_core(&shared) {
        Ok(core) => {
            *shared.core.lock() = Some(core);
            shared.set_state(EngineState::Running);
            stats.engines_created.fetch_add(1, Ordering::Relaxed);
            info!(engine = id, event_loop = shared.event_loop.id(), "Engine created");
            Ok(shared)
        }
        Err(e) => {
            shared.set_state(EngineState::Destroyed);
            stats.creation_failures.fetch_add(1, Ordering::Relaxed);
            error!(engine = id, error = %e, "Engine creation failed");
            Err(e)
        }
    }
}

fn create_core(shared: &EngineShared) -> HostResult<EngineCore> {
    let id = shared.id;
    let options = VmOptions {
        engine_id: id,
        thread_name: std::thread::current().name().map(str::to_string),
    };

    let vm = shared
        .factory
        .create_vm(&options)
        .ok_or_else(|| HostError::VmCreation(format!("engine {id}: factory returned no VM")))?;
    let mut vm = scopeguard::guard(vm, |vm| {
        debug!(engine = id, "Releasing partially created VM");
        shared.factory.destroy_vm(vm);
    });

    let env = NativeEnv::new(id, &mut **vm)?;
    if !vm.set_loop(shared.event_loop.clone()) {
        return Err(HostError::LoopAttach);
    }

    Ok(EngineCore {
        vm: scopeguard::ScopeGuard::into_inner(vm),
        env,
        modules: HashMap::new(),
        listeners: Vec::new(),
    })
}

fn with_scope<R>(
    shared: &EngineShared,
    f: impl FnOnce(&mut EngineScope<'_>) -> R,
) -> HostResult<R> {
    if std::thread::current().id() != shared.owner {
        return Err(HostError::WrongThread(shared.id));
    }
    let mut core = shared.core.lock();
    let core = core.as_mut().ok_or(HostError::EngineGone)?;
    let mut scope = EngineScope {
        id: shared.id,
        core,
        manager: &shared.modules,
        event_loop: &shared.event_loop,
    };
    Ok(f(&mut scope))
}

/// Access to a live engine from its owning thread.
pub struct EngineScope<'a> {
    id: u64,
    core: &'a mut EngineCore,
    manager: &'a NativeModuleManager,
    event_loop: &'a EventLoop,
}

impl EngineScope<'_> {
    pub fn engine_id(&self) -> u64 {
        self.id
    }

    pub fn vm(&mut self) -> &mut dyn Vm {
        &mut *self.core.vm
    }

    pub fn env(&mut self) -> &mut NativeEnv {
        &mut self.core.env
    }

    /// Number of native modules required through this engine.
    pub fn loaded_module_count(&self) -> usize {
        self.core.modules.len()
    }

    /// Resolve a native module and return its export object. Requiring the
    /// same module again returns the same object.
    pub fn require_native(&mut self, request: &ModuleRequest) -> HostResult<ValueHandle> {
        let module = self.manager.resolve(request)?;
        let name = module.name();
        let key = name.to_ascii_lowercase();
        if let Some(exports) = self.core.modules.get(&key) {
            trace!(engine = self.id, module = name, "Module already required");
            return Ok(*exports);
        }

        let exports = if let Some(code) = module.code() {
            if !self.core.vm.execute(ScriptSource::Buffer { name, bytes: code }, name) {
                return Err(self.take_exception(name));
            }
            self.core
                .vm
                .get_export_object(name, "default")
                .ok_or_else(|| HostError::Exception(format!("{name}: no default export")))?
        } else if let Some(register) = module.register_callback() {
            let exports = self.core.vm.new_object().ok_or_else(|| {
                HostError::AdapterInit(format!("{name}: VM could not allocate exports"))
            })?;
            let exports = register.invoke(self.core.env.handle(), exports);
            if self.core.vm.has_pending_exception() {
                return Err(self.take_exception(name));
            }
            exports
        } else {
            warn!(engine = self.id, module = name, "Module has neither code nor a register callback");
            return Err(LoadError::NotFound(name.to_string()).into());
        };

        self.core.modules.insert(key, exports);
        debug!(engine = self.id, module = name, "Native module required");
        Ok(exports)
    }

    /// Run a script, converting a pending exception into an error.
    pub fn execute(&mut self, source: ScriptSource<'_>, entry_point: &str) -> HostResult<()> {
        if self.core.vm.execute(source, entry_point) {
            Ok(())
        } else {
            Err(self.take_exception(entry_point))
        }
    }

    /// Observe the engine's own loop. Removed at teardown.
    pub fn add_loop_observer(&mut self, observer: Arc<dyn LoopObserver>) -> ListenerId {
        let id = self.event_loop.add_observer(observer);
        self.core.listeners.push(id);
        id
    }

    fn take_exception(&mut self, context: &str) -> HostError {
        let message = self
            .core
            .vm
            .get_and_clear_exception()
            .map(|value| self.core.vm.describe(value))
            .unwrap_or_else(|| "unknown error".to_string());
        HostError::Exception(format!("{context}: {message}"))
    }
}

struct EngineGcTrigger {
    shared: Weak<EngineShared>,
}

impl EngineGcTrigger {
    fn dispatch(&self, f: impl FnOnce(&mut dyn Vm) + Send + 'static) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Direct call only on the owning thread and only when the engine is
        // not already borrowed further up the stack.
        if std::thread::current().id() == shared.owner {
            if let Some(mut core) = shared.core.try_lock() {
                if let Some(core) = core.as_mut() {
                    f(&mut *core.vm);
                }
                return;
            }
        }
        let weak = self.shared.clone();
        let posted = shared.event_loop.post(move || {
            if let Some(shared) = weak.upgrade() {
                shared.with_vm(f);
            }
        });
        if posted.is_err() {
            trace!(engine = shared.id, "GC request dropped, engine loop closed");
        }
    }
}

impl GcTrigger for EngineGcTrigger {
    fn notify_idle_gc(&self, timestamp_ms: i64, budget_ms: i64) {
        self.dispatch(move |vm| vm.notify_idle_gc(timestamp_ms, budget_ms));
    }

    fn trigger_compacting_gc(&self, kind: GcKind) {
        self.dispatch(move |vm| vm.trigger_compacting_gc(kind));
    }
}
