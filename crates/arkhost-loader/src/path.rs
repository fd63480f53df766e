//! On-disk candidate paths for a module name.
//!
//! File names follow `lib<name>[_napi][.z]<ext>`. Dotted names map to nested
//! directories: `foo.bar` becomes `<prefix>/foo/libbar.so`. A name that already
//! ends in the platform extension is used verbatim under the prefix.

use crate::error::{LoadError, LoadResult};
use std::path::{Path, PathBuf};

/// Maximum length of a constructed library path, including the prefix.
pub const NAPI_PATH_MAX: usize = 4096;

/// Marker inserted before the extension by packaging that compresses libraries.
pub const ZIP_MARKER: &str = ".z";

/// Suffix of the secondary candidate.
pub const NAPI_SUFFIX: &str = "_napi";

#[cfg(target_os = "macos")]
pub const LIBRARY_EXTENSION: &str = ".dylib";
#[cfg(windows)]
pub const LIBRARY_EXTENSION: &str = ".dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_EXTENSION: &str = ".so";

/// How library file names are spelled on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryNaming {
    pub extension: String,
    pub zip_marker: bool,
    pub max_path_len: usize,
}

impl Default for LibraryNaming {
    fn default() -> Self {
        Self {
            extension: LIBRARY_EXTENSION.to_string(),
            zip_marker: false,
            max_path_len: NAPI_PATH_MAX,
        }
    }
}

/// Up to two library paths to try, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePaths {
    primary: PathBuf,
    secondary: Option<PathBuf>,
}

impl CandidatePaths {
    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Path> {
        self.secondary.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.primary.as_path()).chain(self.secondary.as_deref())
    }

    /// Literal comparison; paths are not canonicalized.
    pub fn contains(&self, path: &Path) -> bool {
        self.iter()
            .any(|candidate| candidate.as_os_str() == path.as_os_str())
    }
}

/// Build the candidate paths for `name` under `prefix`.
///
/// An empty prefix yields bare file names, which the linker resolves through
/// its search path (used for namespaced app libraries).
pub fn candidate_paths(
    prefix: &str,
    name: &str,
    naming: &LibraryNaming,
) -> LoadResult<CandidatePaths> {
    if name.is_empty() {
        return Err(LoadError::EmptyName);
    }

    let ext = naming.extension.as_str();
    if name.len() > ext.len() && name.ends_with(ext) {
        let primary = join(prefix, name);
        check_len(&primary, naming.max_path_len)?;
        return Ok(CandidatePaths {
            primary: PathBuf::from(primary),
            secondary: None,
        });
    }

    let (dir, base) = match name.rfind('.') {
        Some(dot) => (Some(&name[..dot]), &name[dot + 1..]),
        None => (None, name),
    };
    if base.is_empty() || dir.is_some_and(|dir| dir.split('.').any(str::is_empty)) {
        return Err(LoadError::InvalidName(name.to_string()));
    }
    let dir = dir.map(|dir| dir.replace('.', "/"));

    let dir_prefix = match dir {
        Some(dir) => join(prefix, &dir),
        None => prefix.to_string(),
    };
    let zip = if naming.zip_marker { ZIP_MARKER } else { "" };

    let primary = join(&dir_prefix, &format!("lib{base}{zip}{ext}"));
    let secondary = join(&dir_prefix, &format!("lib{base}{NAPI_SUFFIX}{zip}{ext}"));
    check_len(&primary, naming.max_path_len)?;
    check_len(&secondary, naming.max_path_len)?;

    Ok(CandidatePaths {
        primary: PathBuf::from(primary),
        secondary: Some(PathBuf::from(secondary)),
    })
}

fn join(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{rest}")
    } else {
        format!("{prefix}/{rest}")
    }
}

fn check_len(path: &str, max: usize) -> LoadResult<()> {
    if path.len() >= max {
        return Err(LoadError::PathTooLong { max });
    }
    Ok(())
}
