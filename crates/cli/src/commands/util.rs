use std::path::Path;

use anyhow::{anyhow, Context, Result};
use statewalk_core::analysis::{CalculationOptions, StateValue};
use statewalk_core::db::{resolve_project_path, ProjectConfig, ProjectContext};
use statewalk_core::model::{parse_address, Address};
use statewalk_core::services::{AnalysisRegistry, LoadedBinary, SessionConfig};

/// Load the project rooted at `root` (delegates to the core context helper).
pub fn open_project(root: &str) -> Result<ProjectContext> {
    let root_path = crate::canonicalize_or_current(root)?;
    ProjectContext::from_root(root_path)
}

/// Helper to print whether a directory exists.
pub fn print_dir_status(label: &str, path: &Path) {
    let exists = path.is_dir();
    println!("- {label}: {} ({})", if exists { "OK" } else { "MISSING" }, path.display());
}

/// Parse a CLI address argument (`0x…` hex or decimal).
pub fn parse_address_arg(text: &str) -> Result<Address> {
    parse_address(text).ok_or_else(|| anyhow!("Invalid address '{text}' (expected 0x-prefixed hex or decimal)"))
}

/// Per-run overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub update_function: Option<String>,
    pub seed: Option<String>,
    pub seed_addresses: Vec<String>,
    pub stop_at_entrypoints: bool,
}

/// Build a session config from the project's analysis defaults plus CLI overrides.
pub fn session_config(config: &ProjectConfig, overrides: &SessionOverrides) -> Result<SessionConfig> {
    let analysis = &config.analysis;
    let seed = match overrides.seed.as_deref().or(analysis.seed.as_deref()) {
        Some(text) => {
            let value = parse_address_arg(text).context("Invalid seed value")?;
            Some(StateValue::from_u64(value, analysis.seed_width))
        }
        None => None,
    };
    let seed_addresses = overrides
        .seed_addresses
        .iter()
        .map(|text| parse_address_arg(text))
        .collect::<Result<Vec<_>>>()?;

    Ok(SessionConfig {
        update_function: overrides
            .update_function
            .clone()
            .or_else(|| config.default_update_function.clone()),
        calculation: CalculationOptions {
            stop_at_entrypoints: overrides.stop_at_entrypoints || analysis.stop_at_entrypoints,
        },
        seed,
        seed_width: analysis.seed_width,
        seed_addresses,
        max_instructions: analysis.max_instructions,
        ..SessionConfig::default()
    })
}

/// Open a registered binary: stored annotations first, then the image on top of them.
pub fn open_binary_session<'r>(
    ctx: &ProjectContext,
    registry: &'r AnalysisRegistry,
    binary: &str,
    config: SessionConfig,
) -> Result<LoadedBinary<'r>> {
    let record = ctx
        .db
        .find_binary(binary)
        .context("Failed to look up binary")?
        .ok_or_else(|| anyhow!("Binary '{binary}' is not registered in this project"))?;
    let path = resolve_project_path(&ctx.layout, &record.path);

    let mut session = LoadedBinary::new(registry, config);
    session
        .load_annotations(&ctx.db.annotations_for(binary))
        .with_context(|| format!("Failed to load stored annotations for {binary}"))?;
    session.load(&path).with_context(|| format!("Failed to load binary {}", path.display()))?;

    if let Some(arch) = session.arch() {
        if record.arch.as_deref() != Some(arch.as_str()) {
            ctx.db.update_binary_arch(binary, arch.as_str()).context("Failed to record architecture")?;
        }
    }
    Ok(session)
}
