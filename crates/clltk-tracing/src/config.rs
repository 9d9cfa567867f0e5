//! Writer-side configuration.
//!
//! Both writer and reader locate tracebuffer files through the same
//! directory: a process-wide override set with [`set_tracing_path`]
//! wins, then the `CLLTK_TRACING_PATH` environment variable, then the
//! current working directory.

use std::env;
use std::path::PathBuf;

use parking_lot::RwLock;

/// Environment variable naming the tracing directory.
pub const TRACING_PATH_ENV: &str = "CLLTK_TRACING_PATH";

/// Longest accepted tracebuffer name.
pub const MAX_NAME_LEN: usize = 257;

static TRACING_PATH_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Sets the process-wide tracing directory. Takes precedence over the
/// environment when non-empty; an empty path clears the override.
pub fn set_tracing_path<P: Into<PathBuf>>(path: P) {
    let path = path.into();
    let mut guard = TRACING_PATH_OVERRIDE.write();
    if path.as_os_str().is_empty() {
        *guard = None;
    } else {
        *guard = Some(path);
    }
}

/// Resolves the directory tracebuffer files live in.
#[must_use]
pub fn tracing_path() -> PathBuf {
    if let Some(path) = TRACING_PATH_OVERRIDE.read().clone() {
        return path;
    }
    if let Some(path) = env::var_os(TRACING_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Whether `name` is a valid tracebuffer name: a letter followed by up
/// to 256 letters, digits or underscores.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() || name.len() > MAX_NAME_LEN {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
