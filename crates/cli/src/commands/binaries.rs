use std::path::Path;

use anyhow::{anyhow, Context, Result};
use statewalk_core::db::BinaryRecord;

use crate::commands::open_project;
use crate::{canonicalize_or_current, sha256_file};

/// Register a binary (object file or instruction listing) in the project database.
pub fn add_binary_command(
    root: &str,
    path: &str,
    name: Option<String>,
    arch: Option<String>,
    hash: Option<String>,
    skip_hash: bool,
) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    let ctx = open_project(root)?;

    let input_path = Path::new(path);
    let abs_path =
        if input_path.is_absolute() { input_path.to_path_buf() } else { root_path.join(input_path) };
    if !abs_path.exists() {
        return Err(anyhow!("Binary file does not exist: {}", abs_path.display()));
    }

    // Stored relative to the project root when it lives underneath it.
    let rel_path = match (abs_path.canonicalize(), root_path.canonicalize()) {
        (Ok(abs), Ok(root)) => abs.strip_prefix(&root).map(Path::to_path_buf).unwrap_or(abs),
        _ => abs_path.clone(),
    };

    let binary_name = name.unwrap_or_else(|| {
        input_path.file_name().and_then(|os| os.to_str()).unwrap_or(path).to_string()
    });
    if ctx.db.find_binary(&binary_name)?.is_some() {
        return Err(anyhow!("A binary named '{binary_name}' is already registered"));
    }

    let hash = match hash {
        Some(h) => Some(h),
        None if skip_hash => None,
        None => Some(sha256_file(&abs_path)?),
    };

    let record = BinaryRecord {
        name: binary_name,
        path: rel_path.to_string_lossy().to_string(),
        arch,
        hash,
    };
    let id = ctx.db.insert_binary(&record).context("Failed to insert binary record")?;

    println!("Added binary:");
    println!("  Id: {}", id);
    println!("  Name: {}", record.name);
    println!("  Path (relative): {}", record.path);
    println!("  DB: {}", ctx.db_path.display());

    Ok(())
}

/// List all binaries registered in the project database.
pub fn list_binaries_command(root: &str, json: bool) -> Result<()> {
    let ctx = open_project(root)?;
    let binaries = ctx.db.list_binaries().context("Failed to list binaries")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&binaries)?);
        return Ok(());
    }

    println!("Binaries:");
    if binaries.is_empty() {
        println!("(none)");
    }
    for bin in binaries {
        println!(
            "- {} (path: {}, arch: {}, hash: {})",
            bin.name,
            bin.path,
            bin.arch.as_deref().unwrap_or("(unspecified)"),
            bin.hash.as_deref().unwrap_or("(none)")
        );
    }

    Ok(())
}
