//! epictree CLI
//!
//! Converts recording metadata into the analysis GUI's export file and
//! inspects saved selection masks.

use clap::{Parser, Subcommand};
use epictree_core::mat::WriteOptions;
use epictree_core::source::{open_query_store, JsonDumpSource, SqliteQuerySource};
use epictree_core::transform::resolve::MemorySampleReader;
use epictree_core::{
    default_log_level, init_logging, read_selection_mask, CellTypeNaming, ExportOptions,
    ExportService, LogTarget, Materialization, RawNode, RunSummary, SelectionMask, SourceAdapter,
};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "epictree")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Flatten recording metadata into the canonical export file")]
struct Cli {
    /// Absolute directory for rolling log files; logs go to stderr otherwise
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<String>,

    /// trace|debug|info|warn|error
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Output file, or a directory to receive a generated file name
    output: PathBuf,

    /// Name recorded as the export user
    #[arg(short, long, value_name = "NAME")]
    user: Option<String>,

    /// Free-text notes stored in the file metadata
    #[arg(long)]
    notes: Option<String>,

    /// Write the file without zlib compression
    #[arg(long)]
    no_compress: bool,

    /// Keep cell type shorthands instead of expanding them
    #[arg(long)]
    raw_cell_types: bool,

    /// Also write an all-selected selection mask for the exported epochs
    #[arg(long, value_name = "FILE")]
    mask: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a JSON dump (raw node tree or Symphony document)
    JsonToMat {
        input: PathBuf,

        #[command(flatten)]
        export: ExportArgs,

        /// Embed sample arrays instead of lazy references
        #[arg(long)]
        eager: bool,

        /// Sample reader workers for --eager; 0 uses one per CPU
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// JSON sample store (`{"file": {"locator": [..]}}`) read by --eager
        #[arg(long, value_name = "FILE")]
        samples: Option<PathBuf>,
    },

    /// Convert experiments stored in a SQLite database
    SqliteToMat {
        db: PathBuf,

        #[command(flatten)]
        export: ExportArgs,

        /// Experiment id to export; repeat for several, omit for all
        #[arg(long = "experiment", value_name = "ID")]
        experiments: Vec<i64>,
    },

    /// Print the selection summary of a saved mask
    ReadMask { file: PathBuf },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let level = cli.log_level.as_deref().unwrap_or_else(|| default_log_level());
    let target = match cli.log_dir.as_deref() {
        Some(dir) => LogTarget::directory(dir)?,
        None => LogTarget::Stderr,
    };
    init_logging(level, target)?;

    match cli.command {
        Commands::JsonToMat {
            input,
            export,
            eager,
            workers,
            samples,
        } => {
            let source = JsonDumpSource::from_path(&input)?;
            let roots = source.load_experiments()?;
            let mut options = export_options(&export, source.describe());
            let reader = match samples {
                Some(path) => Some(MemorySampleReader::from_json_str(&fs::read_to_string(
                    &path,
                )?)?),
                None => None,
            };
            if eager {
                options.materialization = Materialization::Eager { workers };
            }

            let mut service = ExportService::new(options);
            if let Some(reader) = reader.as_ref() {
                service = service.with_reader(reader);
            }
            run_export(&service, &roots, &export)?;
        }

        Commands::SqliteToMat {
            db,
            export,
            experiments,
        } => {
            let conn = open_query_store(&db)?;
            let source = SqliteQuerySource::new(&conn).with_experiment_ids(experiments);
            let roots: Vec<RawNode> = source.load_experiments()?;
            let service = ExportService::new(export_options(&export, source.describe()));
            run_export(&service, &roots, &export)?;
        }

        Commands::ReadMask { file } => print_mask(&file)?,
    }

    Ok(())
}

fn run_export(service: &ExportService<'_>, roots: &[RawNode], args: &ExportArgs) -> CliResult<()> {
    let (document, summary) = service.build_document(roots, &user_of(args))?;
    if let Some(mask_path) = args.mask.as_ref() {
        SelectionMask::from_document(&document).write(
            mask_path,
            &WriteOptions {
                compress: service.options().compress,
            },
        )?;
        println!("Wrote selection mask {}", mask_path.display());
    }
    let summary = service.write_document(&document, summary, &args.output)?;
    print_summary(&summary);
    Ok(())
}

fn export_options(args: &ExportArgs, data_source: String) -> ExportOptions {
    ExportOptions {
        data_source,
        notes: args.notes.clone(),
        compress: !args.no_compress,
        cell_type_naming: if args.raw_cell_types {
            CellTypeNaming::Passthrough
        } else {
            CellTypeNaming::default()
        },
        ..ExportOptions::default()
    }
}

fn user_of(args: &ExportArgs) -> String {
    args.user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_summary(summary: &RunSummary) {
    if let Some(path) = summary.output.as_ref() {
        println!("Wrote {}", path.display());
    }
    println!(
        "  experiments: {}  cells: {}  epochs: {}",
        summary.experiment_count, summary.cell_count, summary.epoch_count
    );
    for name in &summary.exported {
        println!("  + {name}");
    }
    for failure in &summary.failures {
        println!("  - {}: {}", failure.experiment, failure.reason);
    }
    if !summary.warnings.is_empty() {
        println!("  {} payloads left as lazy references:", summary.warnings.len());
        for warning in &summary.warnings {
            println!("    {warning}");
        }
    }
}

fn print_mask(path: &Path) -> CliResult<()> {
    let state = read_selection_mask(path)?;
    println!("Selection mask {} (version {})", path.display(), state.version);
    println!("  created:  {}", state.created);
    println!("  epochs:   {}", state.epoch_count);
    println!("  selected: {}", state.selected_count());
    println!("  excluded: {}", state.excluded_count());
    Ok(())
}
