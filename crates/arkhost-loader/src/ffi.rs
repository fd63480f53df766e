//! C entry points used by native libraries to register themselves.

use crate::module::{ModuleDescriptor, RawRegisterFn, RegisterCallback};
use crate::register::register_module;
use libc::{c_char, c_int, c_uint, c_void};
use std::ffi::CStr;
use tracing::error;

/// Module descriptor layout shared with C addons.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct napi_module {
    pub nm_version: c_int,
    pub nm_flags: c_uint,
    pub nm_filename: *const c_char,
    pub nm_register_func: Option<RawRegisterFn>,
    pub nm_modname: *const c_char,
    pub nm_priv: *mut c_void,
    pub reserved: [*mut c_void; 4],
}

/// Register a native module from C.
///
/// The descriptor's strings are copied; the caller keeps ownership of `module`.
///
/// # Safety
///
/// `module` must be null or point to a valid `napi_module` whose string
/// fields are null or NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_module_register(module: *const napi_module) {
    // SAFETY: caller guarantees the pointer is null or valid.
    let Some(module) = (unsafe { module.as_ref() }) else {
        error!("napi_module_register called with a null module");
        return;
    };
    if module.nm_modname.is_null() {
        error!("napi_module_register called without a module name");
        return;
    }

    // SAFETY: non-null strings are NUL-terminated per the contract above.
    let name = unsafe { CStr::from_ptr(module.nm_modname) }
        .to_string_lossy()
        .into_owned();
    let file_name = (!module.nm_filename.is_null()).then(|| {
        unsafe { CStr::from_ptr(module.nm_filename) }
            .to_string_lossy()
            .into_owned()
    });

    let mut descriptor = ModuleDescriptor::new(name).with_version(module.nm_version);
    descriptor.file_name = file_name;
    descriptor.register = module.nm_register_func.map(RegisterCallback::Raw);
    register_module(descriptor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegistrationScope;
    use std::ptr;

    unsafe extern "C" fn init(_env: *mut c_void, exports: *mut c_void) -> *mut c_void {
        exports
    }

    fn raw_module(name: &CStr) -> napi_module {
        napi_module {
            nm_version: 2,
            nm_flags: 0,
            nm_filename: ptr::null(),
            nm_register_func: Some(init),
            nm_modname: name.as_ptr(),
            nm_priv: ptr::null_mut(),
            reserved: [ptr::null_mut(); 4],
        }
    }

    #[test]
    fn test_register_copies_descriptor() {
        let scope = RegistrationScope::enter();
        let name = c"ffi_demo".to_owned();
        let module = raw_module(&name);
        unsafe { napi_module_register(&module) };
        drop(name);

        let captured = scope.finish();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].name, "ffi_demo");
        assert_eq!(captured[0].version, 2);
        assert!(matches!(captured[0].register, Some(RegisterCallback::Raw(_))));
    }

    #[test]
    fn test_null_module_is_ignored() {
        let scope = RegistrationScope::enter();
        unsafe { napi_module_register(ptr::null()) };
        let mut module = raw_module(c"unused");
        module.nm_modname = ptr::null();
        unsafe { napi_module_register(&module) };
        assert!(scope.finish().is_empty());
    }
}
