//! In-memory VM used by the runtime tests.

#![allow(dead_code)]

use arkhost_runtime::loader::ValueHandle;
use arkhost_runtime::{EventLoop, GcKind, ScriptSource, Vm, VmFactory, VmOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How the factory and its VMs should misbehave.
#[derive(Clone, Default)]
pub struct MockOptions {
    pub fail_create: bool,
    pub fail_new_object: bool,
    pub fail_loop_attach: bool,
    pub fail_execute: bool,
    pub create_delay: Option<Duration>,
}

/// Everything the mock observed, shared by the factory and its VMs.
#[derive(Default)]
pub struct MockState {
    pub created: u32,
    pub destroyed: u32,
    pub created_on: Vec<Option<String>>,
    pub events: Vec<String>,
    pub executed: Vec<String>,
    pub idle_gcs: Vec<(i64, i64)>,
    pub compactions: Vec<GcKind>,
    pub gc_threads: Vec<Option<String>>,
}

#[derive(Clone, Default)]
pub struct MockVmFactory {
    pub options: MockOptions,
    pub state: Arc<Mutex<MockState>>,
}

impl MockVmFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_options(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Arc::default(),
        })
    }

    pub fn created(&self) -> u32 {
        self.state.lock().created
    }

    pub fn destroyed(&self) -> u32 {
        self.state.lock().destroyed
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    pub fn push_event(&self, event: impl Into<String>) {
        self.state.lock().events.push(event.into());
    }
}

impl VmFactory for MockVmFactory {
    fn create_vm(&self, options: &VmOptions) -> Option<Box<dyn Vm>> {
        if let Some(delay) = self.options.create_delay {
            std::thread::sleep(delay);
        }
        if self.options.fail_create {
            return None;
        }
        let mut state = self.state.lock();
        state.created += 1;
        state.created_on.push(options.thread_name.clone());
        Some(Box::new(MockVm {
            engine_id: options.engine_id,
            options: self.options.clone(),
            state: self.state.clone(),
            next_value: AtomicU64::new(options.engine_id * 1000 + 1),
            pending_exception: None,
            event_loop: None,
        }))
    }

    fn destroy_vm(&self, vm: Box<dyn Vm>) {
        let mut state = self.state.lock();
        state.destroyed += 1;
        state.events.push("destroy_vm".to_string());
        drop(vm);
    }
}

pub struct MockVm {
    engine_id: u64,
    options: MockOptions,
    state: Arc<Mutex<MockState>>,
    next_value: AtomicU64,
    pending_exception: Option<ValueHandle>,
    event_loop: Option<EventLoop>,
}

impl MockVm {
    fn alloc(&self) -> ValueHandle {
        ValueHandle(self.next_value.fetch_add(1, Ordering::Relaxed))
    }

    fn record_gc_thread(&self) {
        self.state
            .lock()
            .gc_threads
            .push(std::thread::current().name().map(str::to_string));
    }
}

impl Vm for MockVm {
    fn set_loop(&mut self, event_loop: EventLoop) -> bool {
        if self.options.fail_loop_attach {
            return false;
        }
        self.event_loop = Some(event_loop);
        true
    }

    fn execute(&mut self, source: ScriptSource<'_>, entry_point: &str) -> bool {
        let label = match source {
            ScriptSource::File(path) => format!("file:{}#{entry_point}", path.display()),
            ScriptSource::Buffer { name, bytes } => format!("buffer:{name}:{}#{entry_point}", bytes.len()),
        };
        self.state.lock().executed.push(label);
        if self.options.fail_execute {
            self.pending_exception = Some(ValueHandle(u64::MAX));
            return false;
        }
        true
    }

    fn get_export_object(&mut self, _module_id: &str, _export_name: &str) -> Option<ValueHandle> {
        Some(self.alloc())
    }

    fn new_object(&mut self) -> Option<ValueHandle> {
        if self.options.fail_new_object {
            return None;
        }
        Some(self.alloc())
    }

    fn notify_idle_gc(&mut self, timestamp_ms: i64, budget_ms: i64) {
        self.record_gc_thread();
        self.state.lock().idle_gcs.push((timestamp_ms, budget_ms));
    }

    fn trigger_compacting_gc(&mut self, kind: GcKind) {
        self.record_gc_thread();
        self.state.lock().compactions.push(kind);
    }

    fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    fn get_and_clear_exception(&mut self) -> Option<ValueHandle> {
        self.pending_exception.take()
    }

    fn describe(&self, value: ValueHandle) -> String {
        if value.0 == u64::MAX {
            format!("SyntaxError in engine {}", self.engine_id)
        } else {
            format!("value#{}", value.0)
        }
    }
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
