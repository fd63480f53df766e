mod common;

use arkhost_loader::path::LIBRARY_EXTENSION;
use arkhost_loader::{
    LoadError, ModuleDescriptor, ModuleManagerConfig, ModuleRequest, NativeModuleManager,
    SystemLoader, bytecode_symbol_name, register_module,
};
use common::MockLoader;
use libc::c_int;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

const SYSTEM_DIR: &str = "/sys/module";

fn lib(dir: &str, file_stem: &str) -> PathBuf {
    PathBuf::from(format!("{dir}/{file_stem}{LIBRARY_EXTENSION}"))
}

fn manager(loader: &Arc<MockLoader>) -> Arc<NativeModuleManager> {
    let config = ModuleManagerConfig::new().system_module_dir(SYSTEM_DIR);
    Arc::new(NativeModuleManager::new(config, loader.clone()))
}

/// A library that registers `name` when opened.
fn add_module(loader: &MockLoader, path: PathBuf, name: &'static str) {
    loader.add_library(path, move || register_module(ModuleDescriptor::new(name)));
}

#[test]
fn test_resolve_is_idempotent() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libnet"), "net");
    let manager = manager(&loader);

    let first = manager.resolve(&ModuleRequest::new("net")).unwrap();
    let second = manager.resolve(&ModuleRequest::new("net")).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.opened().len(), 1);
    assert_eq!(manager.libraries_opened(), 1);
    assert_eq!(first.file_path(), Some(lib(SYSTEM_DIR, "libnet").as_path()));
    assert!(first.has_library());
}

#[test]
fn test_falls_back_to_napi_suffix() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libaudio_napi"), "audio");
    let manager = manager(&loader);

    let module = manager.resolve(&ModuleRequest::new("audio")).unwrap();

    assert_eq!(module.file_path(), Some(lib(SYSTEM_DIR, "libaudio_napi").as_path()));
    assert_eq!(
        loader.attempts(),
        vec![lib(SYSTEM_DIR, "libaudio"), lib(SYSTEM_DIR, "libaudio_napi")]
    );
}

#[test]
fn test_dotted_name_maps_to_subdirectory() {
    let loader = MockLoader::new();
    add_module(
        &loader,
        lib(&format!("{SYSTEM_DIR}/multimedia"), "libaudio"),
        "multimedia.audio",
    );
    let manager = manager(&loader);

    let module = manager
        .resolve(&ModuleRequest::new("multimedia.audio"))
        .unwrap();
    assert_eq!(module.name(), "multimedia.audio");
    assert_eq!(
        loader.attempts()[0],
        lib(&format!("{SYSTEM_DIR}/multimedia"), "libaudio")
    );
}

#[test]
fn test_missing_module_is_not_found() {
    let loader = MockLoader::new();
    let manager = manager(&loader);

    let err = manager.resolve(&ModuleRequest::new("ghost")).unwrap_err();
    assert!(matches!(err, LoadError::NotFound(ref name) if name == "ghost"));
    assert!(err.is_not_found());
    assert_eq!(loader.attempts().len(), 2);
    assert_eq!(manager.libraries_opened(), 0);
}

#[test]
fn test_empty_and_invalid_names() {
    let loader = MockLoader::new();
    let manager = manager(&loader);

    assert!(matches!(
        manager.resolve(&ModuleRequest::new("")),
        Err(LoadError::EmptyName)
    ));
    assert!(matches!(
        manager.resolve(&ModuleRequest::new("trailing.")),
        Err(LoadError::InvalidName(_))
    ));
    assert!(matches!(
        manager.resolve(&ModuleRequest::new("foo..bar")),
        Err(LoadError::InvalidName(_))
    ));
    assert!(matches!(
        manager.resolve(&ModuleRequest::new("bad\0name").ark()),
        Err(LoadError::InvalidSymbolName(_))
    ));
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_path_too_long() {
    let loader = MockLoader::new();
    let config = ModuleManagerConfig::new()
        .system_module_dir(SYSTEM_DIR)
        .max_path_len(32);
    let manager = NativeModuleManager::new(config, loader.clone());

    let err = manager
        .resolve(&ModuleRequest::new("a_rather_long_module_name"))
        .unwrap_err();
    assert!(matches!(err, LoadError::PathTooLong { max: 32 }));
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_shadowing_is_rejected() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libnet"), "net");
    add_module(&loader, lib("/data/other", "libnet"), "net");
    let manager = manager(&loader);

    let loaded = manager.resolve(&ModuleRequest::new("net")).unwrap();

    let err = manager
        .resolve(&ModuleRequest::new("net").path("/data/other"))
        .unwrap_err();
    match err {
        LoadError::ShadowConflict {
            name,
            existing,
            requested,
        } => {
            assert_eq!(name, "net");
            assert!(existing.starts_with(SYSTEM_DIR));
            assert!(requested.starts_with("/data/other"));
        }
        other => panic!("Expected shadow conflict, got {other}"),
    }

    // Same directory spelled the same way resolves to the cached record.
    let same = manager
        .resolve(&ModuleRequest::new("net").path(SYSTEM_DIR))
        .unwrap();
    assert!(Arc::ptr_eq(&loaded, &same));
    assert_eq!(loader.opened().len(), 1);

    // The rejected load left the first record in place.
    let kept = manager.resolve(&ModuleRequest::new("net")).unwrap();
    assert!(Arc::ptr_eq(&loaded, &kept));
    assert_eq!(kept.file_path(), Some(lib(SYSTEM_DIR, "libnet").as_path()));
}

#[test]
fn test_shadow_check_compares_paths_literally() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libnet"), "net");
    let manager = manager(&loader);
    manager.resolve(&ModuleRequest::new("net")).unwrap();

    // Same file, different spelling: still a conflict.
    let err = manager
        .resolve(&ModuleRequest::new("net").path("/sys/./module"))
        .unwrap_err();
    assert!(matches!(err, LoadError::ShadowConflict { .. }));
    assert!(err.is_not_found());
}

#[test]
fn test_unloaded_registration_is_promoted_then_loaded() {
    let loader = MockLoader::new();
    loader.add_empty_library(lib(SYSTEM_DIR, "libA"));
    let manager = manager(&loader);

    manager.register(ModuleDescriptor::new("A"));
    manager.register_builtin(ModuleDescriptor::new("B"));
    manager.register(ModuleDescriptor::new("C"));

    let module = manager.resolve(&ModuleRequest::new("A")).unwrap();
    assert_eq!(module.name(), "A");
    assert_eq!(manager.registered_names(), vec!["B", "C", "A"]);
    assert_eq!(manager.is_loaded("A"), Some(true));
    assert_eq!(manager.is_loaded("C"), Some(false));

    let again = manager.resolve(&ModuleRequest::new("A")).unwrap();
    assert!(Arc::ptr_eq(&module, &again));
    assert_eq!(manager.registered_names(), vec!["B", "C", "A"]);
}

#[test]
fn test_builtin_resolves_without_disk() {
    let loader = MockLoader::new();
    let manager = manager(&loader);
    let builtin = manager.register_builtin(ModuleDescriptor::new("Storage").with_version(2));

    let module = manager.resolve(&ModuleRequest::new("storage")).unwrap();
    assert!(Arc::ptr_eq(&builtin, &module));
    assert_eq!(module.version(), 2);
    assert!(module.file_path().is_none());
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_library_without_registration() {
    let loader = MockLoader::new();
    loader.add_library(lib(SYSTEM_DIR, "libbundle"), || {
        register_module(ModuleDescriptor::new("bundle_helper"));
    });
    let manager = manager(&loader);

    let err = manager.resolve(&ModuleRequest::new("bundle")).unwrap_err();
    assert!(matches!(err, LoadError::NotFound(_)));

    // Other registrations made by the library are kept.
    assert!(manager.registered_names().contains(&"bundle_helper".to_string()));
    assert_eq!(manager.is_loaded("bundle_helper"), Some(false));
}

static DEMO_CODE: &[u8] = b"demo-bytecode";

unsafe extern "C" fn demo_get_code(buf: *mut *const u8, len: *mut c_int) {
    unsafe {
        *buf = DEMO_CODE.as_ptr();
        *len = DEMO_CODE.len() as c_int;
    }
}

#[test]
fn test_ark_module_embedded_code() {
    let loader = MockLoader::new();
    let path = lib(SYSTEM_DIR, "libdemo");
    loader.add_empty_library(path.clone());
    let symbol = bytecode_symbol_name("demo").unwrap();
    loader.add_symbol(path, &symbol, demo_get_code as usize);
    let manager = manager(&loader);

    let module = manager.resolve(&ModuleRequest::new("demo").ark()).unwrap();
    assert_eq!(module.code(), Some(DEMO_CODE));
    assert!(module.register_callback().is_none());
}

unsafe extern "C" fn empty_get_code(buf: *mut *const u8, len: *mut c_int) {
    unsafe {
        *buf = std::ptr::null();
        *len = 0;
    }
}

#[test]
fn test_ark_module_without_code_keeps_registrations() {
    let loader = MockLoader::new();
    let path = lib(SYSTEM_DIR, "libdemo");
    loader.add_library(path.clone(), || {
        register_module(ModuleDescriptor::new("demo"));
        register_module(ModuleDescriptor::new("demo_extra"));
    });
    let symbol = bytecode_symbol_name("demo").unwrap();
    loader.add_symbol(path, &symbol, empty_get_code as usize);
    let manager = manager(&loader);

    let module = manager.resolve(&ModuleRequest::new("demo").ark()).unwrap();
    assert_eq!(module.code(), None);
    assert_eq!(manager.is_loaded("demo"), Some(true));
    assert_eq!(manager.is_loaded("demo_extra"), Some(false));
    assert_eq!(loader.opened().len(), 1);
}

#[test]
fn test_non_ark_request_ignores_embedded_code() {
    let loader = MockLoader::new();
    let path = lib(SYSTEM_DIR, "libdemo");
    loader.add_empty_library(path.clone());
    let symbol = bytecode_symbol_name("demo").unwrap();
    loader.add_symbol(path, &symbol, demo_get_code as usize);
    let manager = manager(&loader);

    assert!(matches!(
        manager.resolve(&ModuleRequest::new("demo")),
        Err(LoadError::NotFound(_))
    ));
}

#[test]
fn test_app_module_uses_app_lib_path_and_namespace() {
    let loader = MockLoader::with_namespaces();
    add_module(&loader, lib("/data/app/lib", "libutil"), "util");
    let manager = manager(&loader);

    manager
        .set_app_lib_path(
            "bundle",
            &[PathBuf::from("/data/app/lib"), PathBuf::from("/data/app/lib2")],
        )
        .unwrap();
    assert_eq!(
        manager.app_search_path("bundle").as_deref(),
        Some("/data/app/lib:/data/app/lib2")
    );

    let namespaces = loader.namespaces();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].1, "/data/app/lib:/data/app/lib2");
    assert!(namespaces[0].2.iter().any(|lib| lib == "libc.so"));

    let module = manager
        .resolve(&ModuleRequest::new("util").app_key("bundle"))
        .unwrap();
    assert_eq!(module.name(), "util");

    let (opened_path, namespace) = loader.opened()[0].clone();
    assert_eq!(opened_path, lib("/data/app/lib", "libutil"));
    assert_eq!(namespace.map(|ns| ns.as_str().to_string()), Some("ns:bundle".to_string()));
}

#[test]
fn test_app_module_without_lib_path() {
    let loader = MockLoader::new();
    let manager = manager(&loader);

    let err = manager.resolve(&ModuleRequest::new("util").app()).unwrap_err();
    assert!(matches!(err, LoadError::NoAppLibPath(ref key) if key == "default"));
    assert!(manager.set_app_lib_path("empty", &[]).is_err());
}

#[test]
fn test_internal_module_searches_system_dir() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libinfra"), "infra");
    let manager = manager(&loader);

    let module = manager
        .resolve(&ModuleRequest::new("infra").app().internal())
        .unwrap();
    assert_eq!(module.file_path(), Some(lib(SYSTEM_DIR, "libinfra").as_path()));
}

#[test]
fn test_initializer_may_resolve_other_modules() {
    let loader = MockLoader::new();
    add_module(&loader, lib(SYSTEM_DIR, "libinner"), "inner");
    let manager = manager(&loader);

    let weak = Arc::downgrade(&manager);
    let inner_result = Arc::new(Mutex::new(None));
    let slot = inner_result.clone();
    loader.add_library(lib(SYSTEM_DIR, "libouter"), move || {
        register_module(ModuleDescriptor::new("outer"));
        if let Some(manager) = weak.upgrade() {
            *slot.lock() = Some(manager.resolve(&ModuleRequest::new("inner")).is_ok());
        }
    });

    let outer = manager.resolve(&ModuleRequest::new("outer")).unwrap();
    assert_eq!(outer.name(), "outer");
    assert_eq!(*inner_result.lock(), Some(true));
    assert_eq!(manager.is_loaded("inner"), Some(true));
    assert_eq!(manager.is_loaded("outer"), Some(true));
}

#[test]
fn test_self_reentrant_load_is_rejected() {
    let loader = MockLoader::new();
    let manager = manager(&loader);

    let weak = Arc::downgrade(&manager);
    let nested = Arc::new(Mutex::new(None));
    let slot = nested.clone();
    loader.add_library(lib(SYSTEM_DIR, "libloop"), move || {
        register_module(ModuleDescriptor::new("loop"));
        if let Some(manager) = weak.upgrade() {
            *slot.lock() = Some(manager.resolve(&ModuleRequest::new("LOOP")));
        }
    });

    let module = manager.resolve(&ModuleRequest::new("loop")).unwrap();
    assert_eq!(module.name(), "loop");
    match nested.lock().take() {
        Some(Err(LoadError::Reentrant(name))) => assert_eq!(name, "LOOP"),
        other => panic!("Expected reentrant error, got {other:?}"),
    }
}

#[test]
fn test_system_loader_rejects_invalid_library() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(format!("libbroken{LIBRARY_EXTENSION}")),
        b"not a shared object",
    )
    .unwrap();

    let config = ModuleManagerConfig::new().system_module_dir(dir.path());
    let manager = NativeModuleManager::new(config, Arc::new(SystemLoader::new()));

    let err = manager.resolve(&ModuleRequest::new("broken")).unwrap_err();
    assert!(matches!(err, LoadError::NotFound(_)));
}
