//! Canonical home and data directory resolution.
//!
//! All coordinator paths (lock files, fallback log directories, the default
//! socket location) are derived from the two functions here so that tests and
//! custom deployments can redirect everything with a single environment
//! variable.
//!
//! # Precedence
//!
//! 1. `APM_HOME` environment variable (if set and non-empty)
//! 2. Platform defaults via the `dirs` crate

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Get the home directory for coordinator operations.
///
/// # Errors
///
/// Returns an error only when `APM_HOME` is unset and the platform home
/// directory cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("APM_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

/// Get the platform data directory used for coordinator-owned state
/// (lock files, fallback agent logs).
///
/// When `APM_HOME` is set the data directory is rooted under it so tests
/// never touch real user state.
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("APM_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed).join(".local").join("share"));
        }
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir);
    }

    // Headless environments occasionally lack a data dir; fall back to home.
    Ok(get_home_dir()?.join(".local").join("share"))
}

/// Expand a leading `~` or `~/` in a path string against the resolved home
/// directory. Paths without a tilde are returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = get_home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = get_home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
