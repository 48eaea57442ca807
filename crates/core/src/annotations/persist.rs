//! Persisted form of annotations and the file-backed persistence backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Annotation, AnnotationError, AnnotationKind, AnnotationPayload, AnnotationResult};
use crate::model::Address;

/// One persisted annotation: kind string, anchor and variant-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: Address,
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl AnnotationRecord {
    pub fn from_annotation(annotation: &Annotation) -> AnnotationResult<Self> {
        Ok(Self {
            kind: annotation.kind().as_str().to_string(),
            address: annotation.address,
            fields: annotation.payload.to_fields()?,
        })
    }

    pub fn into_annotation(self) -> AnnotationResult<Annotation> {
        let kind = AnnotationKind::from_str(&self.kind)?;
        let payload = AnnotationPayload::from_fields(kind, self.fields)?;
        Ok(Annotation::new(self.address, payload))
    }
}

/// Load and save the full annotation set of one binary.
pub trait AnnotationPersistence {
    fn load_annotations(&self) -> AnnotationResult<Vec<Annotation>>;
    fn save_annotations(&self, annotations: &[Annotation]) -> AnnotationResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Json,
    Yaml,
}

/// Annotation set stored as a JSON or YAML document, chosen by file extension.
#[derive(Debug, Clone)]
pub struct AnnotationFile {
    path: PathBuf,
}

impl AnnotationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> AnnotationResult<FileFormat> {
        match self.path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "json" => Ok(FileFormat::Json),
            Some(ext) if ext == "yaml" || ext == "yml" => Ok(FileFormat::Yaml),
            _ => Err(AnnotationError::UnsupportedFormat(self.path.clone())),
        }
    }
}

impl AnnotationPersistence for AnnotationFile {
    fn load_annotations(&self) -> AnnotationResult<Vec<Annotation>> {
        let format = self.format()?;
        let raw = fs::read_to_string(&self.path)
            .map_err(|source| AnnotationError::Io { path: self.path.clone(), source })?;
        let records: Vec<AnnotationRecord> = match format {
            FileFormat::Json => serde_json::from_str(&raw)?,
            FileFormat::Yaml => serde_yaml::from_str(&raw)?,
        };
        log::debug!("loaded {} annotation records from {}", records.len(), self.path.display());
        records.into_iter().map(AnnotationRecord::into_annotation).collect()
    }

    fn save_annotations(&self, annotations: &[Annotation]) -> AnnotationResult<()> {
        let format = self.format()?;
        let records = annotations
            .iter()
            .map(AnnotationRecord::from_annotation)
            .collect::<AnnotationResult<Vec<_>>>()?;
        let body = match format {
            FileFormat::Json => serde_json::to_string_pretty(&records)?,
            FileFormat::Yaml => serde_yaml::to_string(&records)?,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| AnnotationError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(&self.path, body)
            .map_err(|source| AnnotationError::Io { path: self.path.clone(), source })?;
        Ok(())
    }
}
