//! Host-facing C ABI.
//!
//! Every entry point works against the context registered with
//! [`HostContext::install`] and reports failure through [`ArkStatus`]. Engines
//! cross the boundary as opaque owned pointers.
//!
//! Destroying an engine from the thread running its loop panics, and a panic
//! cannot unwind out of an `extern "C"` function, so that violation aborts the
//! process.

#![allow(improper_ctypes_definitions)]

use crate::context::HostContext;
use crate::engine::Engine;
use crate::error::HostError;
use arkhost_loader::{LoadError, ModuleRequest, NativeModule};
use libc::c_char;
use std::ffi::CStr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Status code returned by every entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArkStatus {
    Ok = 0,
    InvalidArg = 1,
    NotFound = 2,
    ShadowConflict = 3,
    NotInstalled = 4,
    CreateFailed = 5,
    Timeout = 6,
    Failure = 7,
}

impl From<&HostError> for ArkStatus {
    fn from(error: &HostError) -> Self {
        match error {
            HostError::Load(LoadError::ShadowConflict { .. }) => Self::ShadowConflict,
            HostError::Load(LoadError::EmptyName | LoadError::InvalidName(_)) => Self::InvalidArg,
            HostError::Load(e) if e.is_not_found() => Self::NotFound,
            HostError::Load(LoadError::Open { .. }) => Self::NotFound,
            HostError::VmCreation(_)
            | HostError::AdapterInit(_)
            | HostError::LoopAttach
            | HostError::ThreadSpawn(_) => Self::CreateFailed,
            HostError::CreateTimeout(_) => Self::Timeout,
            HostError::Config(_) => Self::InvalidArg,
            _ => Self::Failure,
        }
    }
}

/// Borrow a NUL-terminated UTF-8 string; `None` for null or invalid input.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller passes a NUL-terminated string that outlives the call.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Resolve and load a native module.
///
/// On success `*out` points at the module record, which lives as long as the
/// host context.
///
/// # Safety
///
/// `name` must be a valid C string, `path` null or a valid C string, `out`
/// null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_load_native_module(
    name: *const c_char,
    path: *const c_char,
    is_app_module: bool,
    internal: bool,
    is_ark_module: bool,
    out: *mut *const NativeModule,
) -> ArkStatus {
    let Some(context) = HostContext::installed() else {
        return ArkStatus::NotInstalled;
    };
    let Some(name) = (unsafe { str_arg(name) }) else {
        warn!("arkhost_load_native_module called without a valid name");
        return ArkStatus::InvalidArg;
    };

    let mut request = ModuleRequest::new(name);
    request.path = unsafe { str_arg(path) }.map(PathBuf::from);
    request.app_module = is_app_module;
    request.internal = internal;
    request.ark_module = is_ark_module;

    match context.modules().resolve(&request) {
        Ok(module) => {
            if !out.is_null() {
                // SAFETY: the registry keeps the record alive with the context.
                unsafe { *out = std::sync::Arc::as_ptr(&module) };
            }
            ArkStatus::Ok
        }
        Err(e) => ArkStatus::from(&HostError::Load(e)),
    }
}

/// Set the app library search path under `key` (null for the default key).
///
/// # Safety
///
/// `paths` must point at `count` valid C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_set_app_lib_path(
    key: *const c_char,
    paths: *const *const c_char,
    count: usize,
) -> ArkStatus {
    let Some(context) = HostContext::installed() else {
        return ArkStatus::NotInstalled;
    };
    if paths.is_null() || count == 0 {
        return ArkStatus::InvalidArg;
    }
    let key = unsafe { str_arg(key) }.unwrap_or(arkhost_loader::DEFAULT_APP_KEY);

    // SAFETY: caller guarantees `count` entries.
    let raw = unsafe { std::slice::from_raw_parts(paths, count) };
    let mut dirs = Vec::with_capacity(count);
    for &ptr in raw {
        match unsafe { str_arg(ptr) } {
            Some(dir) => dirs.push(PathBuf::from(dir)),
            None => return ArkStatus::InvalidArg,
        }
    }

    match context.modules().set_app_lib_path(key, &dirs) {
        Ok(()) => ArkStatus::Ok,
        Err(e) => ArkStatus::from(&HostError::Load(e)),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn arkhost_notify_idle_start(timestamp_ms: i64, budget_ms: i64) -> ArkStatus {
    match HostContext::installed() {
        Some(context) => {
            context.idle_monitor().notify_idle_start(timestamp_ms, budget_ms);
            ArkStatus::Ok
        }
        None => ArkStatus::NotInstalled,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn arkhost_notify_idle_end(timestamp_ms: i64) -> ArkStatus {
    match HostContext::installed() {
        Some(context) => {
            context.idle_monitor().notify_idle_end(timestamp_ms);
            ArkStatus::Ok
        }
        None => ArkStatus::NotInstalled,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn arkhost_notify_background_state(in_background: bool) -> ArkStatus {
    match HostContext::installed() {
        Some(context) => {
            context
                .idle_monitor()
                .notify_change_background_state(in_background);
            ArkStatus::Ok
        }
        None => ArkStatus::NotInstalled,
    }
}

/// Create an engine on the calling thread.
///
/// # Safety
///
/// `out` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_create_engine(out: *mut *mut Engine) -> ArkStatus {
    if out.is_null() {
        return ArkStatus::InvalidArg;
    }
    let Some(context) = HostContext::installed() else {
        return ArkStatus::NotInstalled;
    };
    match context.create_engine() {
        Ok(engine) => {
            unsafe { *out = Box::into_raw(Box::new(engine)) };
            ArkStatus::Ok
        }
        Err(e) => ArkStatus::from(&e),
    }
}

/// Create an engine on a dedicated thread. A zero timeout uses the configured
/// one.
///
/// # Safety
///
/// `out` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_create_engine_on_dedicated_thread(
    timeout_ms: u64,
    out: *mut *mut Engine,
) -> ArkStatus {
    if out.is_null() {
        return ArkStatus::InvalidArg;
    }
    let Some(context) = HostContext::installed() else {
        return ArkStatus::NotInstalled;
    };
    let timeout = if timeout_ms == 0 {
        context.config().engine.create_timeout()
    } else {
        Duration::from_millis(timeout_ms)
    };
    match Engine::create_on_dedicated_thread(context, timeout) {
        Ok(engine) => {
            unsafe { *out = Box::into_raw(Box::new(engine)) };
            ArkStatus::Ok
        }
        Err(e) => ArkStatus::from(&e),
    }
}

/// Destroy an engine created by this ABI.
///
/// # Safety
///
/// `engine` must come from one of the create functions and not have been
/// destroyed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_destroy_engine(engine: *mut Engine) -> ArkStatus {
    if engine.is_null() {
        return ArkStatus::InvalidArg;
    }
    // SAFETY: ownership returns to Rust here.
    let engine = unsafe { Box::from_raw(engine) };
    engine.destroy();
    ArkStatus::Ok
}

/// Write the engine's native environment handle to `out`.
///
/// # Safety
///
/// `engine` must be a live engine from this ABI, `out` writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arkhost_get_native_env(engine: *const Engine, out: *mut u64) -> ArkStatus {
    if out.is_null() {
        return ArkStatus::InvalidArg;
    }
    let Some(engine) = (unsafe { engine.as_ref() }) else {
        return ArkStatus::InvalidArg;
    };
    match engine.env_handle() {
        Ok(handle) => {
            unsafe { *out = handle.0 };
            ArkStatus::Ok
        }
        Err(e) => ArkStatus::from(&e),
    }
}
