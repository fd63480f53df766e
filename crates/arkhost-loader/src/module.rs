//! Native module descriptors and resolved module records.
//!
//! A [`ModuleDescriptor`] is what a library hands to the host when it
//! self-registers. Once the manager has resolved a descriptor to a file on
//! disk (or accepted it as built into the process) it produces a
//! [`NativeModule`], which is immutable and shared through an `Arc` so that
//! every later lookup returns the identical record.

use crate::library::LoadedLibrary;
use libc::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque handle to a script value owned by a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueHandle(pub u64);

/// Opaque handle to the native environment a module registers against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvHandle(pub u64);

/// C signature of a NAPI-style addon registration function.
pub type RawRegisterFn = unsafe extern "C" fn(env: *mut c_void, exports: *mut c_void) -> *mut c_void;

/// Callback invoked to populate a module's export object.
#[derive(Clone)]
pub enum RegisterCallback {
    /// Registration function exported by a C library
    Raw(RawRegisterFn),
    /// Registration closure supplied by a Rust host
    Native(Arc<dyn Fn(EnvHandle, ValueHandle) -> Option<ValueHandle> + Send + Sync>),
}

impl RegisterCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(EnvHandle, ValueHandle) -> Option<ValueHandle> + Send + Sync + 'static,
    {
        Self::Native(Arc::new(f))
    }

    /// Run the callback. A null (or `None`) result means the module kept
    /// the exports object it was given.
    pub fn invoke(&self, env: EnvHandle, exports: ValueHandle) -> ValueHandle {
        match self {
            Self::Raw(func) => {
                // SAFETY: the library promised this signature when it registered.
                let ret = unsafe {
                    func(
                        env.0 as usize as *mut c_void,
                        exports.0 as usize as *mut c_void,
                    )
                };
                if ret.is_null() {
                    exports
                } else {
                    ValueHandle(ret as usize as u64)
                }
            }
            Self::Native(func) => func(env, exports).unwrap_or(exports),
        }
    }
}

impl fmt::Debug for RegisterCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(func) => write!(f, "RegisterCallback::Raw({:p})", *func as *const ()),
            Self::Native(_) => f.write_str("RegisterCallback::Native(..)"),
        }
    }
}

/// Script or bytecode shipped inside a native library.
pub type EmbeddedCode = Arc<[u8]>;

/// Registration data for one native module, owned by the registry.
#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: i32,
    pub ref_count: u32,
    /// File name the library claims for itself, informational only
    pub file_name: Option<String>,
    pub register: Option<RegisterCallback>,
    pub code: Option<EmbeddedCode>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            ref_count: 0,
            file_name: None,
            register: None,
            code: None,
        }
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_register<F>(mut self, f: F) -> Self
    where
        F: Fn(EnvHandle, ValueHandle) -> Option<ValueHandle> + Send + Sync + 'static,
    {
        self.register = Some(RegisterCallback::new(f));
        self
    }

    pub fn with_code(mut self, code: impl Into<EmbeddedCode>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A resolved native module.
///
/// Records are never mutated after resolution; the registry hands out the
/// same `Arc` for every subsequent lookup of the name.
pub struct NativeModule {
    name: String,
    version: i32,
    ref_count: u32,
    file_path: Option<PathBuf>,
    register: Option<RegisterCallback>,
    code: Option<EmbeddedCode>,
    // Keeps the library mapped for as long as the record is reachable.
    library: Option<Arc<dyn LoadedLibrary>>,
}

impl NativeModule {
    pub(crate) fn resolve(
        descriptor: &ModuleDescriptor,
        file_path: Option<PathBuf>,
        library: Option<Arc<dyn LoadedLibrary>>,
        code: Option<EmbeddedCode>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            version: descriptor.version,
            ref_count: descriptor.ref_count,
            file_path,
            register: descriptor.register.clone(),
            code: code.or_else(|| descriptor.code.clone()),
            library,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// File the module was loaded from, `None` for modules built into the host.
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn register_callback(&self) -> Option<&RegisterCallback> {
        self.register.as_ref()
    }

    pub fn code(&self) -> Option<&[u8]> {
        self.code.as_deref()
    }

    pub fn has_library(&self) -> bool {
        self.library.is_some()
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("file_path", &self.file_path)
            .field("register", &self.register)
            .field("code_len", &self.code.as_ref().map(|c| c.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_callback_keeps_exports_on_none() {
        let cb = RegisterCallback::new(|_, _| None);
        assert_eq!(cb.invoke(EnvHandle(1), ValueHandle(7)), ValueHandle(7));
    }

    #[test]
    fn test_native_callback_replaces_exports() {
        let cb = RegisterCallback::new(|env, exports| Some(ValueHandle(env.0 + exports.0)));
        assert_eq!(cb.invoke(EnvHandle(2), ValueHandle(40)), ValueHandle(42));
    }

    unsafe extern "C" fn raw_register(_env: *mut c_void, _exports: *mut c_void) -> *mut c_void {
        std::ptr::null_mut()
    }

    #[test]
    fn test_raw_callback_null_return_keeps_exports() {
        let cb = RegisterCallback::Raw(raw_register);
        assert_eq!(cb.invoke(EnvHandle(1), ValueHandle(9)), ValueHandle(9));
    }

    #[test]
    fn test_descriptor_code_used_when_no_override() {
        let descriptor = ModuleDescriptor::new("calc").with_code(vec![1u8, 2, 3]);
        let module = NativeModule::resolve(&descriptor, None, None, None);
        assert_eq!(module.code(), Some(&[1u8, 2, 3][..]));

        let module = NativeModule::resolve(&descriptor, None, None, Some(Arc::from(vec![9u8])));
        assert_eq!(module.code(), Some(&[9u8][..]));
    }
}
