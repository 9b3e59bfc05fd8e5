//! omero-transfer: move an image-metadata graph between two image-data
//! servers.
//!
//! A migration exports a project, dataset or image subgraph from the source
//! server into an intermediate metadata document (IMD), copies and
//! re-imports the backing files, pairs every source image with the
//! destination image its file produced, and finally replays the document
//! against the destination server.
//!
//! # Modules
//!
//! - [`ir`]: The intermediate metadata document and its JSON form
//! - [`export`]: Source graph traversal into a document
//! - [`locate`]: Backing file lookup for exported images
//! - [`correlate`]: Source-to-destination image ID pairing
//! - [`rehydrate`]: Destination graph recreation
//! - [`transfer`]: External copy and import tools
//! - [`service`]: Server interfaces and the JSON snapshot server
//! - [`validation`]: Document consistency checks
//! - [`pipeline`]: The full run, stage by stage

pub mod config;
pub mod correlate;
pub mod error;
pub mod export;
pub mod ir;
pub mod locate;
pub mod pipeline;
pub mod rehydrate;
pub mod service;
pub mod transfer;
pub mod validation;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub use error::MigrateError;

use correlate::DestinationFiles;
use ir::EntityRef;
use locate::SourceFiles;
use rehydrate::{ImageResolution, RehydrateOptions, RehydrationCache, Rehydrator};
use service::{PathView, SharedSnapshot, SnapshotImporter, SnapshotServer};

/// The omero-transfer CLI application.
#[derive(Parser)]
#[command(name = "omero-transfer")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Log every entity and call, not just stage progress.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Export a source subgraph into a metadata document.
    Export(ExportArgs),
    /// Check a metadata document for errors and warnings.
    Validate(ValidateArgs),
    /// List the backing files of every image in a document.
    Locate(LocateArgs),
    /// Pair source image IDs with imported destination image IDs.
    Correlate(CorrelateArgs),
    /// Recreate a document's graph on the destination server.
    Rehydrate(RehydrateArgs),
    /// Run every stage from a YAML configuration file.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Source server snapshot (JSON).
    #[arg(long)]
    source: PathBuf,

    /// Root entity, e.g. 'Project:1'.
    #[arg(long)]
    root: EntityRef,

    /// Where to write the document.
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(clap::Args)]
struct ValidateArgs {
    /// Metadata document to validate.
    input: PathBuf,

    /// Treat warnings as errors (exit non-zero if any warnings).
    #[arg(long)]
    strict: bool,

    /// Output format for the report ('text' or 'json').
    #[arg(long, default_value = "text")]
    output: String,
}

#[derive(clap::Args)]
struct LocateArgs {
    /// Metadata document.
    input: PathBuf,

    /// Source server snapshot (JSON).
    #[arg(long)]
    source: PathBuf,

    /// Report paths as the uploading client saw them.
    #[arg(long)]
    client_paths: bool,

    /// Root of the source server's managed repository.
    #[arg(long, default_value = "")]
    managed_repo_dir: PathBuf,

    /// Where to write the file map (JSON).
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(clap::Args)]
struct CorrelateArgs {
    /// File map written by 'locate'.
    #[arg(long)]
    source_files: PathBuf,

    /// Destination file map (JSON object of path -> image IDs).
    #[arg(long, conflicts_with = "destination", required_unless_present = "destination")]
    destination_files: Option<PathBuf>,

    /// Destination server snapshot to query by client path instead.
    #[arg(long, requires = "data_directory")]
    destination: Option<PathBuf>,

    /// Directory the files were copied into.
    #[arg(long)]
    data_directory: Option<PathBuf>,

    /// Where to write the image map (JSON).
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(clap::Args)]
struct RehydrateArgs {
    /// Metadata document.
    input: PathBuf,

    /// Image map written by 'correlate'.
    #[arg(long)]
    map: Option<PathBuf>,

    /// Destination server snapshot (JSON); updated in place.
    #[arg(long)]
    destination: PathBuf,

    /// Create metadata-only images instead of resolving them through the map.
    #[arg(long)]
    create_images: bool,

    /// Cache file to resume from and update.
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(clap::Args)]
struct RunArgs {
    /// YAML configuration file.
    config: PathBuf,
}

/// Run the omero-transfer CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Export(args)) => run_export(args),
        Some(Commands::Validate(args)) => run_validate(args),
        Some(Commands::Locate(args)) => run_locate(args),
        Some(Commands::Correlate(args)) => run_correlate(args),
        Some(Commands::Rehydrate(args)) => run_rehydrate(args),
        Some(Commands::Run(args)) => run_pipeline(args),
        None => {
            println!("omero-transfer {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Image metadata migration between image-data servers.");
            println!();
            println!("Run 'omero-transfer --help' for usage information.");
            Ok(())
        }
    }
}

/// `--verbose` wins over `RUST_LOG`; otherwise `RUST_LOG` wins over the
/// `info` default.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run_export(args: ExportArgs) -> Result<(), MigrateError> {
    let source = SnapshotServer::load(&args.source)?;
    let document = export::export_graph(&source, args.root)?;
    ir::io_json::write_imd(&args.output, &document)?;

    println!(
        "Exported {} entities from {} to {}",
        document.entity_count(),
        args.root,
        args.output.display()
    );
    println!(
        "  {} project(s), {} dataset(s), {} image(s), {} ROI(s), {} annotation(s)",
        document.projects.len(),
        document.datasets.len(),
        document.images.len(),
        document.rois.len(),
        document.annotations.len()
    );
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<(), MigrateError> {
    let document = ir::io_json::read_imd(&args.input)?;
    let opts = validation::ValidateOptions {
        strict: args.strict,
    };
    let report = validation::validate_document(&document, &opts);

    match args.output.as_str() {
        "json" => {
            let summary = serde_json::json!({
                "error_count": report.error_count(),
                "warning_count": report.warning_count(),
                "issues": &report.issues,
            });
            let json =
                serde_json::to_string_pretty(&summary).map_err(|e| MigrateError::Artifact {
                    path: PathBuf::from("<stdout>"),
                    message: e.to_string(),
                })?;
            println!("{}", json);
        }
        _ => print!("{}", report),
    }

    let has_errors = report.error_count() > 0;
    let has_warnings = report.warning_count() > 0;

    if has_errors || (args.strict && has_warnings) {
        Err(MigrateError::InvalidDocument {
            error_count: report.error_count(),
            warning_count: report.warning_count(),
            report,
        })
    } else {
        Ok(())
    }
}

fn run_locate(args: LocateArgs) -> Result<(), MigrateError> {
    let document = ir::io_json::read_imd(&args.input)?;
    let source = SnapshotServer::load(&args.source)?;
    let opts = locate::LocateOptions {
        view: if args.client_paths {
            PathView::Client
        } else {
            PathView::Server
        },
        managed_repo_dir: args.managed_repo_dir,
    };
    let located = locate::locate_files(&document, &source, &opts)?;
    located.write(&args.output)?;

    println!(
        "Located {} file(s) for {} image(s)",
        located.files.len(),
        located.located_images().len()
    );
    if !located.unlocated.is_empty() {
        println!(
            "{} image(s) have no backing files and will not be migrated",
            located.unlocated.len()
        );
    }
    Ok(())
}

fn run_correlate(args: CorrelateArgs) -> Result<(), MigrateError> {
    let located = SourceFiles::read(&args.source_files)?;
    let destination_files = match (&args.destination_files, &args.destination) {
        (Some(path), _) => read_destination_files(path)?,
        (None, Some(snapshot)) => {
            let destination = SnapshotServer::load(snapshot)?;
            let data_directory = args.data_directory.clone().unwrap_or_default();
            let copied: Vec<PathBuf> = located
                .files
                .iter()
                .map(|file| transfer::destination_path(&data_directory, file))
                .collect();
            correlate::destination_map_from_service(&destination, &copied)?
        }
        (None, None) => DestinationFiles::new(),
    };

    let image_map = correlate::correlate(&located.by_path, &destination_files)?;
    image_map.write(&args.output)?;
    println!(
        "Correlated {} image(s); map written to {}",
        image_map.len(),
        args.output.display()
    );
    Ok(())
}

fn read_destination_files(path: &Path) -> Result<DestinationFiles, MigrateError> {
    let file = File::open(path).map_err(MigrateError::Io)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| MigrateError::Artifact {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn run_rehydrate(args: RehydrateArgs) -> Result<(), MigrateError> {
    let document = ir::io_json::read_imd(&args.input)?;
    let image_map = match &args.map {
        Some(path) => correlate::ImageMap::read(path)?,
        None => correlate::ImageMap::new(),
    };
    let cache = match &args.cache {
        Some(path) if path.exists() => RehydrationCache::read(path)?,
        _ => RehydrationCache::new(),
    };
    let options = RehydrateOptions {
        images: if args.create_images {
            ImageResolution::CreateNew
        } else {
            ImageResolution::Correlated
        },
    };

    let mut destination = SnapshotServer::load(&args.destination)?;
    let mut rehydrator = Rehydrator::new(&mut destination, &image_map, options).with_cache(cache);
    let outcome = rehydrator.rehydrate(&document);
    let cache = rehydrator.into_cache();

    // The destination keeps whatever was created, success or not.
    destination.save(&args.destination)?;
    if let Some(path) = &args.cache {
        cache.write(path)?;
    }
    let summary = outcome?;

    println!(
        "Rehydrated into {}: {} created, {} image(s) resolved, {} link(s)",
        args.destination.display(),
        summary.created,
        summary.resolved_images,
        summary.linked
    );
    if !summary.skipped_images.is_empty() {
        println!(
            "Skipped {} image(s) with no imported counterpart",
            summary.skipped_images.len()
        );
    }
    Ok(())
}

fn run_pipeline(args: RunArgs) -> Result<(), MigrateError> {
    let config = config::MigrationConfig::load(&args.config)?;
    let required = |path: &Option<PathBuf>, key: &str| {
        path.clone().ok_or_else(|| MigrateError::Config {
            path: args.config.clone(),
            message: format!("{} is required by the command-line runner", key),
        })
    };
    let source_path = required(&config.source.snapshot, "source.snapshot")?;
    let destination_snapshot = required(
        &config.general.destination_snapshot,
        "general.destination_snapshot",
    )?;

    let defaults = config::ImportConfig::default();
    if config.import.program != defaults.program || !config.import.extra_args.is_empty() {
        return Err(MigrateError::Config {
            path: args.config.clone(),
            message: "import.program and import.extra_args have no effect when \
                      general.destination_snapshot stands in for the destination"
                .to_string(),
        });
    }

    let source = SnapshotServer::load(&source_path)?;
    let destination = SharedSnapshot::new(SnapshotServer::load(&destination_snapshot)?);
    let importer = SnapshotImporter::new(destination.clone(), &source);
    let file_transfer: Box<dyn transfer::FileTransfer> =
        if config.transfer.is_local() && config.transfer.dest_user.is_none() {
            Box::new(transfer::LocalCopy)
        } else {
            Box::new(
                transfer::RsyncTransfer::new(
                    config.transfer.user.clone(),
                    config.transfer.host.clone(),
                )
                .with_dest_user(config.transfer.dest_user.clone()),
            )
        };

    info!("Starting migration from {}", args.config.display());
    let mut rehydrate_into = destination.clone();
    let outcome = pipeline::run_migration(
        &config,
        &source,
        &mut rehydrate_into,
        file_transfer.as_ref(),
        &importer,
    );
    destination.save(&destination_snapshot)?;
    let report = outcome?;

    println!("Migration complete");
    println!("  Exported entities: {}", report.exported_entities);
    println!("  Files copied:      {}", report.files);
    println!("  Images correlated: {}", report.correlated_images);
    println!("  Entities created:  {}", report.rehydration.created);
    if report.unlocated_images > 0 {
        println!("  Images without files: {}", report.unlocated_images);
    }
    Ok(())
}
