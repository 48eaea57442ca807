use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use statewalk_core::db::{CalculationRunRecord, FixupRecord, ProjectContext, RunStatus};
use statewalk_core::model::format_address;
use statewalk_core::services::{default_registry, LoadedBinary, SessionError};

use crate::commands::{
    open_binary_session, open_project, parse_address_arg, session_config, SessionOverrides,
};

/// Reconstructed function as reported by `functions` and calculation reports.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub entry_points: Vec<String>,
    pub blocks: usize,
}

/// Report written to `reports/<binary>-run<id>.json` after each calculation.
#[derive(Debug, Clone, Serialize)]
pub struct CalculationReport {
    pub run: CalculationRunRecord,
    pub decode_fault: Option<String>,
    pub functions: Vec<FunctionSummary>,
    pub fixups: Vec<FixupRecord>,
}

fn function_summaries(session: &LoadedBinary<'_>) -> Vec<FunctionSummary> {
    session
        .functions()
        .iter()
        .map(|function| FunctionSummary {
            name: function.name.clone(),
            start: function.start_address(session.graph()).map(format_address),
            end: function.end_address(session.graph()).map(format_address),
            entry_points: function.entry_points.iter().map(|ep| format_address(ep.address)).collect(),
            blocks: function.blocks.len(),
        })
        .collect()
}

/// Disassemble, tolerating a decode fault: the partial graph stays usable.
fn disassemble(session: &mut LoadedBinary<'_>) -> Result<Option<String>> {
    match session.disassemble() {
        Ok(()) => Ok(None),
        Err(SessionError::DecodeAborted { fault, decoded }) => {
            log::warn!("continuing with {decoded} decoded instructions: {fault}");
            Ok(Some(fault))
        }
        Err(err) => Err(err).context("Disassembly failed"),
    }
}

/// Disassemble a binary and list its reconstructed functions.
pub fn functions_command(root: &str, binary: &str, stop_at_entrypoints: bool, json: bool) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let mut config = session_config(&ctx.config, &SessionOverrides::default())?;
    config.reconstruct.stop_at_entrypoints = stop_at_entrypoints;
    let mut session = open_binary_session(&ctx, &registry, binary, config)?;
    let fault = disassemble(&mut session)?;

    let summaries = function_summaries(&session);
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if let Some(fault) = fault {
        println!("Decode stopped early: {fault}");
    }
    println!("Functions in {binary}: {}", summaries.len());
    for line in session.describe_functions() {
        println!("- {line}");
    }
    let unresolved = session.graph().unresolved_targets();
    if !unresolved.is_empty() {
        println!("Unresolved targets: {}", unresolved.len());
    }
    Ok(())
}

fn record_run(
    ctx: &ProjectContext,
    mut run: CalculationRunRecord,
    fixups: &[FixupRecord],
) -> Result<CalculationRunRecord> {
    let run_id = ctx.db.insert_calculation_run(&run).context("Failed to record calculation run")?;
    ctx.db.insert_fixups(run_id, fixups).context("Failed to record fixups")?;
    run.id = Some(run_id);
    Ok(run)
}

/// Run a state calculation, persist the run and its fixups, and write a report.
pub fn calculate_command(
    root: &str,
    binary: &str,
    overrides: &SessionOverrides,
    json: bool,
) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let config = session_config(&ctx.config, overrides)?;
    let mut session = open_binary_session(&ctx, &registry, binary, config)?;

    let started_at = Utc::now().to_rfc3339();
    let decode_fault = disassemble(&mut session)?;
    let outcome = session.calculate_states();

    let mut run = CalculationRunRecord {
        id: None,
        binary: binary.to_string(),
        update_function: session
            .update_function_name()
            .map(str::to_string)
            .or_else(|| session.config().update_function.clone())
            .unwrap_or_else(|| "(architecture default)".to_string()),
        status: RunStatus::Failed,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        fixup_count: 0,
    };

    let fixups = match outcome {
        Ok(fixups) => fixups,
        Err(err) => {
            record_run(&ctx, run, &[])?;
            return Err(err).with_context(|| format!("State calculation for {binary} failed"));
        }
    };
    let fixups: Vec<FixupRecord> = fixups.iter().map(FixupRecord::from).collect();
    run.status = if decode_fault.is_some() { RunStatus::Partial } else { RunStatus::Succeeded };
    run.fixup_count = fixups.len();
    let run = record_run(&ctx, run, &fixups)?;

    let report = CalculationReport {
        run,
        decode_fault,
        functions: function_summaries(&session),
        fixups,
    };
    let run_id = report.run.id.unwrap_or_default();
    let report_path = ctx.layout.report_path(binary, run_id);
    fs::create_dir_all(&ctx.layout.reports_dir).with_context(|| {
        format!("Failed to create reports dir: {}", ctx.layout.reports_dir.display())
    })?;
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write report {}", report_path.display()))?;
    log::debug!("wrote calculation report to {}", report_path.display());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Run {run_id}: {} with '{}' ({} fixups)",
        report.run.status.as_str(),
        report.run.update_function,
        report.run.fixup_count
    );
    for fixup in &report.fixups {
        println!(
            "- {} {}: expected {}, computed {} [{}]",
            format_address(fixup.address),
            fixup.kind,
            fixup.expected.as_deref().unwrap_or("(none)"),
            fixup.computed,
            fixup.resolution
        );
    }
    println!("Report: {}", report_path.display());
    Ok(())
}

/// Print pre/post state at each address after a fresh calculation.
pub fn states_command(
    root: &str,
    binary: &str,
    addresses: &[String],
    overrides: &SessionOverrides,
) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let config = session_config(&ctx.config, overrides)?;
    let mut session = open_binary_session(&ctx, &registry, binary, config)?;
    disassemble(&mut session)?;
    session
        .calculate_states()
        .with_context(|| format!("State calculation for {binary} failed"))?;

    for text in addresses {
        let address = parse_address_arg(text)?;
        println!("{}: {}", format_address(address), session.states_display(address));
    }
    Ok(())
}

/// List recorded calculation runs, optionally for one binary.
pub fn list_runs_command(root: &str, binary: Option<&str>, json: bool) -> Result<()> {
    let ctx = open_project(root)?;
    let runs = ctx.db.list_runs(binary).context("Failed to list calculation runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("Calculation runs:");
    if runs.is_empty() {
        println!("(none)");
    }
    for run in runs {
        println!(
            "- #{} {} [{}] update={} fixups={} started={} finished={}",
            run.id.unwrap_or_default(),
            run.binary,
            run.status.as_str(),
            run.update_function,
            run.fixup_count,
            run.started_at,
            run.finished_at
        );
    }
    Ok(())
}
