//! Project database integration and project layout definitions.
//!
//! A project root holds:
//! - `.statewalk/project.json`: serializable [`ProjectConfig`]
//! - `.statewalk/project.db`: SQLite database with binaries, annotations,
//!   calculation runs and their fixups
//! - `annotations/` and `reports/`: exported artifacts

mod config;
mod context;
mod layout;
mod models;
mod project_db;
mod util;

pub use config::{AnalysisConfig, DbConfig, ProjectConfig};
pub use context::ProjectContext;
pub use layout::ProjectLayout;
pub use models::{BinaryRecord, CalculationRunRecord, FixupRecord, ProjectSnapshot, RunStatus};
pub use project_db::{BinaryAnnotations, DbError, DbResult, ProjectDb, CURRENT_SCHEMA_VERSION};
pub use util::{load_project_config, open_project_db, resolve_project_path};
