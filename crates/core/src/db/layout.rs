use std::path::{Path, PathBuf};

/// Logical layout of a project on disk.
///
/// This is derived from a chosen root path. It does *not* perform any IO itself.
/// The CLI is responsible for creating directories and files based on it.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    /// Root directory of the project.
    pub root: PathBuf,
    /// Directory for internal metadata (.statewalk).
    pub meta_dir: PathBuf,
    /// Path to the project config file (JSON).
    pub project_config_path: PathBuf,
    /// Path to the project database file.
    pub db_path: PathBuf,
    /// Directory for exported annotation files.
    pub annotations_dir: PathBuf,
    /// Directory for calculation reports.
    pub reports_dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(".statewalk");
        let project_config_path = meta_dir.join("project.json");
        let db_path = meta_dir.join("project.db");
        let annotations_dir = root.join("annotations");
        let reports_dir = root.join("reports");

        Self { root, meta_dir, project_config_path, db_path, annotations_dir, reports_dir }
    }

    /// Database path suitable for storing in `ProjectConfig`, relative to `root` when possible.
    pub fn db_path_relative_string(&self) -> String {
        match self.db_path.strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => self.db_path.to_string_lossy().to_string(),
        }
    }

    /// Default export location for a binary's annotations.
    pub fn annotation_export_path(&self, binary_name: &str, extension: &str) -> PathBuf {
        self.annotations_dir.join(format!("{binary_name}.{extension}"))
    }

    /// Report file for one calculation run.
    pub fn report_path(&self, binary_name: &str, run_id: i64) -> PathBuf {
        self.reports_dir.join(format!("{binary_name}-run{run_id}.json"))
    }
}
