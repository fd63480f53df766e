//! The scripting VM as seen by the host.
//!
//! The VM itself lives outside this crate. Hosts plug one in by implementing
//! [`VmFactory`] and [`Vm`]; everything here only relies on this surface.

use crate::event_loop::EventLoop;
use arkhost_loader::ValueHandle;
use std::path::Path;

/// Options passed to [`VmFactory::create_vm`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmOptions {
    /// Host-assigned engine id, for diagnostics
    pub engine_id: u64,
    /// Thread the VM is created on, when it has a name
    pub thread_name: Option<String>,
}

/// Script input for [`Vm::execute`].
#[derive(Debug, Clone, Copy)]
pub enum ScriptSource<'a> {
    /// Bytecode or source file on disk
    File(&'a Path),
    /// In-memory bytecode, named by its module id
    Buffer { name: &'a str, bytes: &'a [u8] },
}

/// Kind of heavyweight collection requested from the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcKind {
    /// Full collection of the VM's local heap
    Full,
    /// Compacting collection of the heap shared between VMs
    SharedCompacting,
}

/// One VM instance.
///
/// A VM is owned by a single engine and only touched from the thread running
/// that engine's loop, so it only needs to be `Send`.
pub trait Vm: Send {
    /// Route the VM's task scheduling through `event_loop`. Returns false when
    /// the VM cannot be bound to it.
    fn set_loop(&mut self, event_loop: EventLoop) -> bool;

    /// Run `source`, starting at `entry_point`. Returns false on failure, in
    /// which case the VM usually has a pending exception.
    fn execute(&mut self, source: ScriptSource<'_>, entry_point: &str) -> bool;

    /// Look up `export_name` in the module `module_id`.
    fn get_export_object(&mut self, module_id: &str, export_name: &str) -> Option<ValueHandle>;

    /// Allocate an empty object.
    fn new_object(&mut self) -> Option<ValueHandle>;

    /// Offer the VM an idle window of `budget_ms` starting at `timestamp_ms`.
    fn notify_idle_gc(&mut self, timestamp_ms: i64, budget_ms: i64);

    fn trigger_compacting_gc(&mut self, kind: GcKind);

    fn has_pending_exception(&self) -> bool;

    /// Take the pending exception, if any.
    fn get_and_clear_exception(&mut self) -> Option<ValueHandle>;

    /// Human-readable rendering of a value, used in error messages.
    fn describe(&self, value: ValueHandle) -> String {
        format!("{value:?}")
    }
}

/// Creates and destroys VMs.
pub trait VmFactory: Send + Sync {
    /// `None` when the VM could not be created.
    fn create_vm(&self, options: &VmOptions) -> Option<Box<dyn Vm>>;

    fn destroy_vm(&self, vm: Box<dyn Vm>);
}
