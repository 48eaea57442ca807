use serde::{Deserialize, Serialize};

/// Location of the project database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Path to the project database file (typically relative to project root).
    pub path: String,
}

impl DbConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Defaults applied to every session opened from the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Bound state propagation at other entry points (boundary reconstruction always is).
    pub stop_at_entrypoints: bool,
    /// Seed width in bytes.
    pub seed_width: usize,
    /// Seed value as hex (`0x…`); zero when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    /// Decoder instruction budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_instructions: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { stop_at_entrypoints: false, seed_width: 4, seed: None, max_instructions: None }
    }
}

/// Serializable configuration describing a project.
///
/// This lives at `.statewalk/project.json` in the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Human-friendly project name.
    pub name: String,
    /// Optional description / notes.
    pub description: Option<String>,
    /// Schema/config version. This is about the config format, not binary version.
    pub config_version: String,
    /// Database configuration (path is typically relative to project root).
    pub db: DbConfig,
    /// Update function used when neither the CLI nor the architecture picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_update_function: Option<String>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, db_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            config_version: "0.1.0".to_string(),
            db: DbConfig::new(db_path),
            default_update_function: None,
            analysis: AnalysisConfig::default(),
        }
    }
}
