//! Process-wide host context.
//!
//! A [`HostContext`] owns the pieces shared by every engine in the process:
//! the native module manager, the idle monitor, the VM factory and the
//! lifecycle statistics. Build one and hand clones to whoever needs it. The C
//! ABI works against the single context registered with
//! [`HostContext::install`].

use crate::config::HostConfig;
use crate::engine::{Engine, LifecycleStats};
use crate::error::{HostError, HostResult};
use crate::event_loop::{EventLoop, ListenerId};
use crate::idle::IdleMonitor;
use crate::timer::{MonitorScheduler, ThreadTimer};
use crate::vm::VmFactory;
use arkhost_loader::{LibraryLoader, NativeModuleManager, SystemLoader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

static INSTALLED: OnceLock<HostContext> = OnceLock::new();

struct ContextInner {
    config: HostConfig,
    modules: Arc<NativeModuleManager>,
    idle: Arc<IdleMonitor>,
    factory: Arc<dyn VmFactory>,
    stats: Arc<LifecycleStats>,
    next_engine_id: AtomicU64,
}

/// Shared host state, cheap to clone.
#[derive(Clone)]
pub struct HostContext {
    inner: Arc<ContextInner>,
}

/// Builder for [`HostContext`].
pub struct HostContextBuilder {
    config: HostConfig,
    factory: Arc<dyn VmFactory>,
    loader: Option<Arc<dyn LibraryLoader>>,
    scheduler: Option<Arc<dyn MonitorScheduler>>,
    thread_timer: bool,
}

impl HostContextBuilder {
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `loader` instead of the platform dynamic linker.
    pub fn loader(mut self, loader: Arc<dyn LibraryLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Drive the idle monitor from `scheduler`.
    pub fn scheduler(mut self, scheduler: Arc<dyn MonitorScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self.thread_timer = false;
        self
    }

    /// Drive the idle monitor from a [`ThreadTimer`] owned by the context.
    pub fn thread_timer(mut self) -> Self {
        self.thread_timer = true;
        self.scheduler = None;
        self
    }

    pub fn build(self) -> HostResult<HostContext> {
        self.config.validate()?;

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(SystemLoader::new()) as Arc<dyn LibraryLoader>);
        let modules = Arc::new(NativeModuleManager::new(self.config.modules.clone(), loader));

        let scheduler = if self.thread_timer {
            Some(Arc::new(ThreadTimer::new("arkhost-idle-timer")?) as Arc<dyn MonitorScheduler>)
        } else {
            self.scheduler
        };
        let idle = Arc::new(match scheduler {
            Some(scheduler) => IdleMonitor::with_scheduler(self.config.idle.clone(), scheduler),
            None => IdleMonitor::new(self.config.idle.clone()),
        });
        idle.start();

        debug!(
            system_module_dir = %self.config.modules.system_module_dir.display(),
            idle_monitor = idle.has_scheduler(),
            "Host context built"
        );

        Ok(HostContext {
            inner: Arc::new(ContextInner {
                config: self.config,
                modules,
                idle,
                factory: self.factory,
                stats: Arc::new(LifecycleStats::new()),
                next_engine_id: AtomicU64::new(1),
            }),
        })
    }
}

impl HostContext {
    pub fn builder(factory: Arc<dyn VmFactory>) -> HostContextBuilder {
        HostContextBuilder {
            config: HostConfig::default(),
            factory,
            loader: None,
            scheduler: None,
            thread_timer: false,
        }
    }

    /// Register this context as the one the C ABI uses. Only the first call
    /// succeeds.
    pub fn install(self) -> HostResult<&'static HostContext> {
        let mut installed = false;
        let context = INSTALLED.get_or_init(|| {
            installed = true;
            self
        });
        if installed {
            info!("Host context installed");
            Ok(context)
        } else {
            Err(HostError::AlreadyInstalled)
        }
    }

    /// The context registered with [`HostContext::install`].
    pub fn installed() -> Option<&'static HostContext> {
        INSTALLED.get()
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn modules(&self) -> &Arc<NativeModuleManager> {
        &self.inner.modules
    }

    pub fn idle_monitor(&self) -> &Arc<IdleMonitor> {
        &self.inner.idle
    }

    pub fn factory(&self) -> &Arc<dyn VmFactory> {
        &self.inner.factory
    }

    pub fn stats(&self) -> &Arc<LifecycleStats> {
        &self.inner.stats
    }

    pub(crate) fn next_engine_id(&self) -> u64 {
        self.inner.next_engine_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an engine on the calling thread.
    pub fn create_engine(&self) -> HostResult<Engine> {
        Engine::create_inline(self)
    }

    /// Create an engine on a dedicated thread with the configured timeout.
    pub fn create_engine_on_dedicated_thread(&self) -> HostResult<Engine> {
        Engine::create_on_dedicated_thread(self, self.inner.config.engine.create_timeout())
    }

    /// Feed `event_loop`'s idle windows to the idle monitor.
    pub fn attach_idle_monitor(&self, event_loop: &EventLoop) -> ListenerId {
        debug!(event_loop = event_loop.id(), "Idle monitor attached");
        event_loop.add_observer(self.inner.idle.clone())
    }

    /// Send the idle monitor's GC requests to `engine`.
    pub fn set_gc_target(&self, engine: &Engine) {
        self.inner.idle.set_target(engine.gc_trigger());
    }
}
