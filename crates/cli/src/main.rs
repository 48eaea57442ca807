use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use statewalk::commands::{self, SessionOverrides};

/// Function-boundary reconstruction and state propagation for native binaries.
///
/// This CLI is a thin wrapper around `statewalk-core`; all substantive logic
/// lives in the library so it can be tested and reused from other frontends.
#[derive(Parser, Debug)]
#[command(name = "statewalk", version, about = "Annotation-driven state propagation over native binaries", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by commands that run a state calculation.
#[derive(Args, Debug, Clone, Default)]
struct CalculationArgs {
    /// Update function name (xor, sum, crc32c); defaults to the project or architecture default.
    #[arg(long)]
    update_function: Option<String>,

    /// Seed value (hex or decimal); defaults to the project seed or zero.
    #[arg(long)]
    seed: Option<String>,

    /// Address to seed from (repeatable); defaults to the image entry or all entry points.
    #[arg(long = "seed-address")]
    seed_addresses: Vec<String>,

    /// Do not propagate state into other entry points.
    #[arg(long, default_value_t = false)]
    stop_at_entrypoints: bool,
}

impl From<CalculationArgs> for SessionOverrides {
    fn from(args: CalculationArgs) -> Self {
        SessionOverrides {
            update_function: args.update_function,
            seed: args.seed,
            seed_addresses: args.seed_addresses,
            stop_at_entrypoints: args.stop_at_entrypoints,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new project at the given root.
    ///
    /// Creates `.statewalk/` (config and database), `annotations/` and `reports/`.
    InitProject {
        /// Project root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Optional project name. If omitted, the name is derived from the root directory.
        #[arg(long)]
        name: Option<String>,
    },

    /// Show configuration, layout and registered binaries of a project.
    ProjectInfo {
        #[arg(long, default_value = ".")]
        root: String,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Register an object file or instruction listing in the project database.
    AddBinary {
        #[arg(long, default_value = ".")]
        root: String,

        /// Path to the binary to register.
        #[arg(long)]
        path: String,

        /// Optional human-friendly name. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,

        /// Optional architecture hint; replaced by the loader's answer on first open.
        #[arg(long)]
        arch: Option<String>,

        /// Optional precomputed hash. If omitted, SHA-256 is computed unless `--skip-hash` is set.
        #[arg(long)]
        hash: Option<String>,

        #[arg(long, default_value_t = false)]
        skip_hash: bool,
    },

    /// List all binaries registered in the project database.
    ListBinaries {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Add an annotation (comment, entrypoint, inst_type, load_ref) at an address.
    Annotate {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        /// Annotation kind string.
        #[arg(long)]
        kind: String,

        /// Anchor address (hex with 0x prefix, or decimal).
        #[arg(long)]
        address: String,

        /// Payload fields as a JSON object; the kind's default payload when omitted.
        #[arg(long)]
        fields: Option<String>,
    },

    /// Remove the annotation at a list index (see `list-annotations`).
    RemoveAnnotation {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        #[arg(long)]
        index: usize,
    },

    /// List a binary's annotations, including loader-created entry points.
    ListAnnotations {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Replace a binary's stored annotations with a JSON/YAML annotation file.
    ImportAnnotations {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        #[arg(long)]
        file: String,
    },

    /// Write a binary's annotations to a JSON/YAML file.
    ExportAnnotations {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        /// Output path; defaults to `annotations/<binary>.<format>`.
        #[arg(long)]
        out: Option<String>,

        /// Format used for the default output path (json or yaml).
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Disassemble a binary and print its reconstructed functions.
    Functions {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        /// Let a function's reach run into other entry points.
        #[arg(long, default_value_t = false)]
        unbounded: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run a state calculation, record it with its fixups, and write a report.
    Calculate {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        #[command(flatten)]
        calculation: CalculationArgs,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print pre/post states at the given addresses.
    States {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        binary: String,

        /// Addresses to show (hex with 0x prefix, or decimal).
        #[arg(required = true)]
        addresses: Vec<String>,

        #[command(flatten)]
        calculation: CalculationArgs,
    },

    /// List recorded calculation runs.
    ListRuns {
        #[arg(long, default_value = ".")]
        root: String,

        /// Only runs for this binary.
        #[arg(long)]
        binary: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new()
        .filter_module("statewalk_core", level)
        .filter_module("statewalk", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    match cli.command {
        Command::InitProject { root, name } => commands::init_project_command(&root, name),
        Command::ProjectInfo { root, json } => commands::project_info_command(&root, json),
        Command::AddBinary { root, path, name, arch, hash, skip_hash } => {
            commands::add_binary_command(&root, &path, name, arch, hash, skip_hash)
        }
        Command::ListBinaries { root, json } => commands::list_binaries_command(&root, json),
        Command::Annotate { root, binary, kind, address, fields } => {
            commands::annotate_command(&root, &binary, &kind, &address, fields.as_deref())
        }
        Command::RemoveAnnotation { root, binary, index } => {
            commands::remove_annotation_command(&root, &binary, index)
        }
        Command::ListAnnotations { root, binary, json } => {
            commands::list_annotations_command(&root, &binary, json)
        }
        Command::ImportAnnotations { root, binary, file } => {
            commands::import_annotations_command(&root, &binary, &file)
        }
        Command::ExportAnnotations { root, binary, out, format } => {
            commands::export_annotations_command(&root, &binary, out.as_deref(), &format)
        }
        Command::Functions { root, binary, unbounded, json } => {
            commands::functions_command(&root, &binary, !unbounded, json)
        }
        Command::Calculate { root, binary, calculation, json } => {
            commands::calculate_command(&root, &binary, &calculation.into(), json)
        }
        Command::States { root, binary, addresses, calculation } => {
            commands::states_command(&root, &binary, &addresses, &calculation.into())
        }
        Command::ListRuns { root, binary, json } => {
            commands::list_runs_command(&root, binary.as_deref(), json)
        }
    }
}
