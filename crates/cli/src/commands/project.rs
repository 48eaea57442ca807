use std::fs;

use anyhow::{Context, Result};
use statewalk_core::db::{ProjectConfig, ProjectDb, ProjectLayout, ProjectSnapshot};

use crate::commands::{open_project, print_dir_status};
use crate::{canonicalize_or_current, infer_project_name};

/// Initialize a new project at `root`.
pub fn init_project_command(root: &str, name: Option<String>) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    let layout = ProjectLayout::new(&root_path);
    let project_name = name.unwrap_or_else(|| infer_project_name(&root_path));

    for (label, dir) in [
        ("meta dir", &layout.meta_dir),
        ("annotations dir", &layout.annotations_dir),
        ("reports dir", &layout.reports_dir),
    ] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {label}: {}", dir.display()))?;
    }

    let config = ProjectConfig::new(&project_name, layout.db_path_relative_string());
    let json = serde_json::to_string_pretty(&config)?;
    fs::write(&layout.project_config_path, json).with_context(|| {
        format!("Failed to write project config: {}", layout.project_config_path.display())
    })?;

    // Create the database now so later commands can rely on it.
    ProjectDb::open(&layout.db_path).with_context(|| {
        format!("Failed to initialize project database at {}", layout.db_path.display())
    })?;
    log::debug!("initialized project '{project_name}' at {}", layout.root.display());

    println!("Initialized statewalk project:");
    println!("  Name: {}", project_name);
    println!("  Root: {}", layout.root.display());
    println!("  Config: {}", layout.project_config_path.display());
    println!("  DB path (relative): {}", config.db.path);
    println!("  Annotations dir: {}", layout.annotations_dir.display());
    println!("  Reports dir: {}", layout.reports_dir.display());

    Ok(())
}

/// Show config, layout and registered binaries of an existing project.
pub fn project_info_command(root: &str, json: bool) -> Result<()> {
    let ctx = open_project(root)?;
    let binaries = ctx.db.list_binaries().context("Failed to list binaries")?;
    let run_count = ctx.db.list_runs(None).context("Failed to list calculation runs")?.len();

    if json {
        let snapshot = ProjectSnapshot { config: ctx.config.clone(), binaries, run_count };
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let config = &ctx.config;
    println!("statewalk Project Info");
    println!("======================");
    println!("Name: {}", config.name);
    if let Some(description) = &config.description {
        println!("Description: {description}");
    }
    println!("Root: {}", ctx.layout.root.display());
    println!("Config version: {}", config.config_version);
    println!("DB path: {}", ctx.db_path.display());
    println!(
        "Default update function: {}",
        config.default_update_function.as_deref().unwrap_or("(per architecture)")
    );
    println!(
        "Analysis: stop_at_entrypoints={}, seed_width={}, seed={}",
        config.analysis.stop_at_entrypoints,
        config.analysis.seed_width,
        config.analysis.seed.as_deref().unwrap_or("0")
    );
    println!();

    println!("Directories:");
    print_dir_status("Meta dir (.statewalk)", &ctx.layout.meta_dir);
    print_dir_status("Annotations dir", &ctx.layout.annotations_dir);
    print_dir_status("Reports dir", &ctx.layout.reports_dir);
    println!();

    println!("Binaries: {}", binaries.len());
    for bin in &binaries {
        println!("- {} ({})", bin.name, bin.path);
    }
    println!("Calculation runs: {run_count}");

    Ok(())
}
