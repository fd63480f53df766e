//! Locating and loading arkhost.toml.

use arkhost_runtime::HostConfig;
use std::path::{Path, PathBuf};

/// Config file names, in lookup order.
const CONFIG_NAMES: &[&str] = &["arkhost.toml", ".arkhostrc.toml"];

/// Load configuration from `path`, or from the nearest config file above the
/// current directory. Defaults when there is none.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    if let Some(path) = path {
        return HostConfig::from_file(path).map_err(Into::into);
    }
    let cwd = std::env::current_dir()?;
    match find_config_file(&cwd) {
        Some(path) => HostConfig::from_file(&path).map_err(Into::into),
        None => Ok(HostConfig::default()),
    }
}

/// Search `start` and its parents for a config file.
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[modules]
system_module_dir = "/opt/arkhost/modules"

[engine]
create_timeout_ms = 500
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(
            config.modules.system_module_dir,
            PathBuf::from("/opt/arkhost/modules")
        );
        assert_eq!(config.engine.create_timeout_ms, 500);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_find_in_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("app").join("src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("arkhost.toml"), "[idle]\n").unwrap();

        assert_eq!(
            find_config_file(&nested),
            Some(dir.path().join("arkhost.toml"))
        );
    }
}
