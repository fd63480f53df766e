//! CLI command implementations.

pub mod paths;
pub mod probe;

use arkhost_loader::{ModuleRequest, NativeModuleManager, SystemLoader};
use arkhost_runtime::HostConfig;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// How a module name is looked up, shared by the module commands.
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Module name, e.g. `net.http`
    pub name: String,

    /// Look the module up as an app module in these directories
    #[arg(long = "app", value_name = "DIR")]
    pub app_dirs: Vec<PathBuf>,

    /// Directory overriding the default search location
    #[arg(long, value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// Internal module, always taken from the system directory
    #[arg(long)]
    pub internal: bool,
}

impl RequestArgs {
    pub fn request(&self) -> ModuleRequest {
        let mut request = ModuleRequest::new(&self.name);
        if let Some(path) = &self.path {
            request = request.path(path);
        }
        if !self.app_dirs.is_empty() {
            request = request.app();
        }
        if self.internal {
            request = request.internal();
        }
        request
    }

    /// A manager using the platform linker, with the app path set when given.
    pub fn manager(&self, config: &HostConfig) -> anyhow::Result<NativeModuleManager> {
        let manager = NativeModuleManager::new(config.modules.clone(), Arc::new(SystemLoader::new()));
        if !self.app_dirs.is_empty() {
            manager.set_app_lib_path(arkhost_loader::DEFAULT_APP_KEY, &self.app_dirs)?;
        }
        Ok(manager)
    }
}
