//! Native module self-registration.
//!
//! Libraries register their modules from initializers that run while the
//! library is being opened. When a manager is opening a library on the current
//! thread, those registrations belong to that load and are captured by a
//! [`RegistrationScope`]. Registrations that happen outside any load (modules
//! linked into the host binary) are queued and handed to the first
//! [`NativeModuleManager`](crate::NativeModuleManager) that is constructed.

use crate::module::ModuleDescriptor;
use parking_lot::{Mutex, const_mutex};
use std::cell::RefCell;
use std::marker::PhantomData;
use tracing::debug;

static PENDING: Mutex<Vec<ModuleDescriptor>> = const_mutex(Vec::new());

thread_local! {
    static LOAD_SINKS: RefCell<Vec<Vec<ModuleDescriptor>>> = const { RefCell::new(Vec::new()) };
}

/// Register a native module.
///
/// The descriptor is owned by the registry from here on.
pub fn register_module(descriptor: ModuleDescriptor) {
    let unclaimed = LOAD_SINKS.with_borrow_mut(|sinks| match sinks.last_mut() {
        Some(sink) => {
            sink.push(descriptor);
            None
        }
        None => Some(descriptor),
    });

    if let Some(descriptor) = unclaimed {
        debug!(module = %descriptor.name, "Queued static module registration");
        PENDING.lock().push(descriptor);
    }
}

/// Take every registration queued outside a library load.
pub(crate) fn take_pending() -> Vec<ModuleDescriptor> {
    std::mem::take(&mut *PENDING.lock())
}

/// Captures registrations made on this thread while a library is opened.
///
/// Scopes nest: a library whose initializer resolves another module gets its
/// own scope for that inner load.
pub(crate) struct RegistrationScope {
    finished: bool,
    // Tied to the thread whose sink stack it pushed onto.
    _not_send: PhantomData<*const ()>,
}

impl RegistrationScope {
    pub(crate) fn enter() -> Self {
        LOAD_SINKS.with_borrow_mut(|sinks| sinks.push(Vec::new()));
        Self {
            finished: false,
            _not_send: PhantomData,
        }
    }

    /// Leave the scope, returning what was registered inside it.
    pub(crate) fn finish(mut self) -> Vec<ModuleDescriptor> {
        self.finished = true;
        LOAD_SINKS
            .with_borrow_mut(|sinks| sinks.pop())
            .unwrap_or_default()
    }
}

impl Drop for RegistrationScope {
    fn drop(&mut self) {
        if !self.finished {
            LOAD_SINKS.with_borrow_mut(|sinks| {
                sinks.pop();
            });
        }
    }
}
