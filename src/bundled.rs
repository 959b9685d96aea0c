//! Bundled sandbox wrapper scripts.
//!
//! The two execution wrappers (`py_sandbox_runner.py`, `js_sandbox_runner.js`)
//! are embedded directly into the binary and extracted on demand to a cache
//! directory, so a `vigil` binary is self-contained and never depends on the
//! scripts directory being present on the host filesystem.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use include_dir::{Dir, include_dir};

use crate::model::TestKind;

static SCRIPTS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/scripts");

static SCRIPTS_CACHE: OnceLock<Result<PathBuf, BundledError>> = OnceLock::new();

pub type BundledResult<T> = Result<T, BundledError>;

#[derive(Debug, thiserror::Error)]
pub enum BundledError {
    #[error("failed to create bundled script cache directory: {0}")]
    CacheCreationFailed(std::io::Error),

    #[error("failed to extract bundled script '{name}': {source}")]
    ExtractionFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bundled script not found: {0}")]
    ScriptNotFound(String),
}

/// Cache directory for extracted scripts:
/// - macOS: `~/Library/Caches/vigil/scripts`
/// - Linux: `$XDG_CACHE_HOME/vigil/scripts` or `~/.cache/vigil/scripts`
/// - Windows: `%LOCALAPPDATA%/vigil/scripts`
/// - Fallback: `/tmp/vigil/scripts`
fn get_cache_dir() -> BundledResult<PathBuf> {
    let base_cache = if cfg!(target_os = "macos") {
        env::var("HOME").ok().map(|h| PathBuf::from(h).join("Library/Caches"))
    } else if cfg!(target_os = "windows") {
        env::var("LOCALAPPDATA").ok().map(PathBuf::from)
    } else {
        env::var("XDG_CACHE_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| env::var("HOME").ok().map(|h| PathBuf::from(h).join(".cache")))
    };

    let cache_dir = base_cache.unwrap_or_else(|| PathBuf::from("/tmp")).join("vigil").join("scripts");
    fs::create_dir_all(&cache_dir).map_err(BundledError::CacheCreationFailed)?;
    Ok(cache_dir)
}

fn ensure_scripts_extracted() -> BundledResult<PathBuf> {
    let result = SCRIPTS_CACHE.get_or_init(|| {
        let cache_dir = get_cache_dir()?;

        for file in SCRIPTS_DIR.files() {
            let target_path = cache_dir.join(file.path());

            if target_path.exists()
                && let Ok(existing) = fs::read(&target_path)
                && existing == file.contents()
            {
                continue;
            }

            if let Some(parent) = target_path.parent() {
                fs::create_dir_all(parent).map_err(BundledError::CacheCreationFailed)?;
            }

            fs::write(&target_path, file.contents()).map_err(|e| BundledError::ExtractionFailed {
                name: file.path().display().to_string(),
                source: e,
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&target_path)
                    .map_err(|e| BundledError::ExtractionFailed {
                        name: file.path().display().to_string(),
                        source: e,
                    })?
                    .permissions();
                perms.set_mode(0o755);
                fs::set_permissions(&target_path, perms).map_err(|e| BundledError::ExtractionFailed {
                    name: file.path().display().to_string(),
                    source: e,
                })?;
            }
        }

        Ok(cache_dir)
    });

    match result {
        Ok(path) => Ok(path.clone()),
        Err(e) => Err(BundledError::ExtractionFailed {
            name: "cache initialization".to_string(),
            source: std::io::Error::other(e.to_string()),
        }),
    }
}

fn wrapper_file_name(kind: TestKind) -> &'static str {
    match kind {
        TestKind::ScriptPython => "py_sandbox_runner.py",
        TestKind::ScriptJs => "js_sandbox_runner.js",
    }
}

/// Extracts (if needed) and returns the path to the wrapper script for
/// `kind`, for the Runner Pool to pass as an argv entry.
pub fn wrapper_script_path(kind: TestKind) -> BundledResult<PathBuf> {
    let name = wrapper_file_name(kind);
    if SCRIPTS_DIR.get_file(name).is_none() {
        return Err(BundledError::ScriptNotFound(name.to_string()));
    }
    let cache_dir = ensure_scripts_extracted()?;
    Ok(cache_dir.join(name))
}

/// Path to the fixed minimal-expectation script the Domain Monitor loads
/// through the `script_js` wrapper in place of a tenant upload.
pub fn domain_browser_check_script_path() -> BundledResult<PathBuf> {
    const NAME: &str = "domain_browser_check.js";
    if SCRIPTS_DIR.get_file(NAME).is_none() {
        return Err(BundledError::ScriptNotFound(NAME.to_string()));
    }
    let cache_dir = ensure_scripts_extracted()?;
    Ok(cache_dir.join(NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_wrapper_resolves_to_a_cached_path() {
        let path = wrapper_script_path(TestKind::ScriptPython).unwrap();
        assert!(path.ends_with("py_sandbox_runner.py"));
        assert!(path.exists());
    }

    #[test]
    fn js_wrapper_resolves_to_a_cached_path() {
        let path = wrapper_script_path(TestKind::ScriptJs).unwrap();
        assert!(path.ends_with("js_sandbox_runner.js"));
        assert!(path.exists());
    }

    #[test]
    fn domain_browser_check_resolves_to_a_cached_path() {
        let path = domain_browser_check_script_path().unwrap();
        assert!(path.ends_with("domain_browser_check.js"));
        assert!(path.exists());
    }
}
