//! Thin command layer over `statewalk-core`.
//!
//! Each subcommand is a `*_command` function in [`commands`] so it can be
//! driven from tests without spawning the binary.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub mod commands;

/// Absolute form of `root`: the current directory for `.`, the canonical path
/// when it exists, otherwise `root` joined onto the current directory.
pub fn canonicalize_or_current(root: &str) -> Result<PathBuf> {
    let path = Path::new(root);
    let cwd = || env::current_dir().context("Failed to get current directory");
    if path == Path::new(".") {
        return cwd();
    }
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => Ok(cwd()?.join(path)),
    }
}

/// Project name derived from the last component of `root`, or `unnamed-project`.
pub fn infer_project_name(root: &Path) -> String {
    root.file_name().and_then(|os_str| os_str.to_str()).unwrap_or("unnamed-project").to_string()
}

/// Lower-case hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("Failed to open binary for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read binary for hashing: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}
