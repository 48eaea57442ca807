use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use statewalk_core::annotations::{AnnotationFile, AnnotationPersistence, AnnotationRecord};
use statewalk_core::model::format_address;
use statewalk_core::services::{default_registry, SessionConfig};

use crate::commands::{open_binary_session, open_project, parse_address_arg};

#[derive(Debug, Serialize)]
pub struct AnnotationRow {
    pub index: usize,
    #[serde(flatten)]
    pub record: AnnotationRecord,
    pub description: String,
}

/// Add an annotation of `kind` at `address`; `fields` is an optional JSON object.
pub fn annotate_command(
    root: &str,
    binary: &str,
    kind: &str,
    address: &str,
    fields: Option<&str>,
) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let mut session = open_binary_session(&ctx, &registry, binary, SessionConfig::default())?;
    let address = parse_address_arg(address)?;

    let handle = match fields {
        Some(text) => {
            let fields: serde_json::Value =
                serde_json::from_str(text).context("Failed to parse --fields as JSON")?;
            session.add_annotation(kind, address, fields)?
        }
        None => session.create_annotation(kind, address)?,
    };
    session.save_annotations(&ctx.db.annotations_for(binary))?;

    if let Some(annotation) = session.annotation(handle) {
        println!(
            "Added {} at {}: {}",
            annotation.kind(),
            format_address(annotation.address),
            annotation.describe()
        );
    }
    Ok(())
}

/// Remove the annotation at list position `index`.
pub fn remove_annotation_command(root: &str, binary: &str, index: usize) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let mut session = open_binary_session(&ctx, &registry, binary, SessionConfig::default())?;

    let handle = session
        .annotations()
        .handle_at(index)
        .ok_or_else(|| anyhow!("No annotation at index {index} (binary has {})", session.annotations().len()))?;
    let removed = session
        .remove_annotation(handle)
        .ok_or_else(|| anyhow!("Annotation at index {index} disappeared"))?;
    session.save_annotations(&ctx.db.annotations_for(binary))?;

    println!("Removed {} at {}", removed.kind(), format_address(removed.address));
    Ok(())
}

/// List annotations in store order, including loader-created entry points.
pub fn list_annotations_command(root: &str, binary: &str, json: bool) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let session = open_binary_session(&ctx, &registry, binary, SessionConfig::default())?;

    let rows = session
        .annotations()
        .annotations()
        .iter()
        .enumerate()
        .map(|(index, annotation)| {
            Ok(AnnotationRow {
                index,
                record: AnnotationRecord::from_annotation(annotation)?,
                description: annotation.describe(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Annotations for {binary}:");
    if rows.is_empty() {
        println!("(none)");
    }
    for row in rows {
        println!(
            "[{}] {} {:<10} {}",
            row.index,
            format_address(row.record.address),
            row.record.kind,
            row.description
        );
    }
    Ok(())
}

/// Replace the stored annotation set of `binary` with the contents of `file`.
pub fn import_annotations_command(root: &str, binary: &str, file: &str) -> Result<()> {
    let ctx = open_project(root)?;
    if ctx.db.find_binary(binary)?.is_none() {
        return Err(anyhow!("Binary '{binary}' is not registered in this project"));
    }
    let source = AnnotationFile::new(file);
    let annotations = source
        .load_annotations()
        .with_context(|| format!("Failed to import annotations from {file}"))?;
    ctx.db.annotations_for(binary).save_annotations(&annotations)?;

    println!("Imported {} annotations for {binary} from {file}", annotations.len());
    Ok(())
}

/// Write the annotation set to `out`, or `annotations/<binary>.<format>` by default.
pub fn export_annotations_command(
    root: &str,
    binary: &str,
    out: Option<&str>,
    format: &str,
) -> Result<()> {
    let ctx = open_project(root)?;
    let registry = default_registry();
    let session = open_binary_session(&ctx, &registry, binary, SessionConfig::default())?;

    let path = match out {
        Some(out) => PathBuf::from(out),
        None => {
            fs::create_dir_all(&ctx.layout.annotations_dir).with_context(|| {
                format!("Failed to create annotations dir: {}", ctx.layout.annotations_dir.display())
            })?;
            ctx.layout.annotation_export_path(binary, format)
        }
    };
    session
        .save_annotations(&AnnotationFile::new(&path))
        .with_context(|| format!("Failed to export annotations to {}", path.display()))?;

    println!("Exported {} annotations to {}", session.annotations().len(), path.display());
    Ok(())
}
