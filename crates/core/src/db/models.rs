use serde::{Deserialize, Serialize};

use crate::analysis::{FixupKind, FixupResolution, StateFixup};

/// Record describing a binary known to the project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinaryRecord {
    /// Human-friendly name, unique within a project.
    pub name: String,
    /// Path to the binary, relative to the project root if possible.
    pub path: String,
    /// Optional architecture string (e.g., "arm", "x86_64").
    pub arch: Option<String>,
    /// Optional content hash for identity (SHA-256).
    pub hash: Option<String>,
}

impl BinaryRecord {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self { name: name.into(), path: path.into(), arch: None, hash: None }
    }
}

/// A high-level snapshot of project metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub config: crate::db::ProjectConfig,
    pub binaries: Vec<BinaryRecord>,
    pub run_count: usize,
}

/// Outcome of a state calculation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Completed over a partial graph after a decode fault.
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "succeeded" => Some(RunStatus::Succeeded),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Bookkeeping row for one `calculate` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalculationRunRecord {
    /// Row id; `None` before insertion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub binary: String,
    pub update_function: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
    pub fixup_count: usize,
}

/// Persisted form of a [`StateFixup`]; values are stored as hex strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixupRecord {
    pub address: u64,
    pub kind: String,
    pub expected: Option<String>,
    pub computed: String,
    pub resolution: String,
}

impl From<&StateFixup> for FixupRecord {
    fn from(fixup: &StateFixup) -> Self {
        Self {
            address: fixup.address,
            kind: fixup.kind.as_str().to_string(),
            expected: fixup.expected.as_ref().map(ToString::to_string),
            computed: fixup.computed.to_string(),
            resolution: fixup.resolution.as_str().to_string(),
        }
    }
}

impl FixupRecord {
    /// Rebuild the in-memory fixup; `None` when a stored field no longer parses.
    pub fn to_fixup(&self) -> Option<StateFixup> {
        Some(StateFixup {
            address: self.address,
            kind: FixupKind::parse(&self.kind)?,
            expected: match &self.expected {
                Some(text) => Some(text.parse().ok()?),
                None => None,
            },
            computed: self.computed.parse().ok()?,
            resolution: FixupResolution::parse(&self.resolution)?,
        })
    }
}
