use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use photometa::config::{Config, ExtractorKind};
use photometa::db::Database;
use photometa::ingest::{IngestProgress, IngestRun};
use photometa::logging;
use photometa::report::{self, ReportFormat};
use photometa::source::{DumpSource, ExifToolSource, NativeExifSource, RecordSource};
use photometa::taxonomy::Taxonomy;

#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    taxonomy_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    dump_path: Option<PathBuf>,
    native: bool,
    diagnostics_path: Option<PathBuf>,
    folder: Option<PathBuf>,
}

fn path_arg(args: &[String], i: usize, flag: &str) -> PathBuf {
    if i + 1 < args.len() {
        PathBuf::from(&args[i + 1])
    } else {
        eprintln!("Error: {} requires a path argument", flag);
        std::process::exit(1);
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("photometa {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                parsed.config_path = Some(path_arg(&args, i, "--config"));
                i += 1;
            }
            "--taxonomy" | "-t" => {
                parsed.taxonomy_path = Some(path_arg(&args, i, "--taxonomy"));
                i += 1;
            }
            "--db" => {
                parsed.db_path = Some(path_arg(&args, i, "--db"));
                i += 1;
            }
            "--dump" => {
                parsed.dump_path = Some(path_arg(&args, i, "--dump"));
                i += 1;
            }
            "--native" => parsed.native = true,
            "--diagnostics" | "-d" => {
                parsed.diagnostics_path = Some(path_arg(&args, i, "--diagnostics"));
                i += 1;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => {
                if parsed.folder.is_some() {
                    eprintln!("Error: only one folder can be ingested per run");
                    std::process::exit(1);
                }
                parsed.folder = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"photometa - ingest photo metadata into a SQLite table

USAGE:
    photometa [OPTIONS] FOLDER

OPTIONS:
    --config, -c PATH       Path to config file
    --taxonomy, -t PATH     Tag taxonomy JSON (default: built-in taxonomy)
    --db PATH               Database file (default: FOLDER/photo_metadata.db)
    --dump FILE             Read an existing exiftool JSON dump instead of running exiftool
    --native                Read EXIF directly instead of running exiftool
    --diagnostics, -d FILE  Diagnostics report, .csv or .json
                            (default: FOLDER/photometa-diagnostics.csv)
    --version, -V           Show version
    --help, -h              Show this help message

ENVIRONMENT:
    PHOTOMETA_CONFIG        Path to config file (overrides default location)
    PHOTOMETA_LOG           Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/photometa/config.toml"#
    );
}

fn main() {
    let args = parse_args();

    let _ = logging::init(None);

    if let Err(e) = run(args) {
        tracing::error!("Ingest failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let Some(folder) = args.folder else {
        print_help();
        std::process::exit(1);
    };

    let config = Config::load(args.config_path.as_deref())?;

    let identity = config.store.identity_column.as_str();
    let taxonomy = match args.taxonomy_path.as_ref().or(config.taxonomy_path.as_ref()) {
        Some(path) => Taxonomy::load(path, identity)
            .with_context(|| format!("Failed to load taxonomy {}", path.display()))?,
        None => {
            let taxonomy = Taxonomy::builtin(identity)?;
            tracing::info!(tags = taxonomy.tag_count(), "Using built-in taxonomy");
            taxonomy
        }
    };

    let mut source = build_source(&args.dump_path, args.native, &config, &folder, &taxonomy);

    // Schema problems must surface before the store is touched.
    let (tx, rx) = mpsc::channel();
    let ingest = IngestRun::new(&taxonomy, &config.store, &config.ingest)?.with_progress(tx);

    let db_path = args.db_path.unwrap_or_else(|| config.db_path_for(&folder));
    let mut db = Database::open(&db_path, config.store.busy_timeout())
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let progress = std::thread::spawn(move || {
        for event in rx {
            if let IngestProgress::Batch { processed, total, .. } = event {
                tracing::info!("Processed {}/{} records", processed, total);
            }
        }
    });

    let summary = ingest.run_source(&mut db, source.as_mut())?;
    let diagnostics = ingest.into_diagnostics();
    let _ = progress.join();

    let report_path = args
        .diagnostics_path
        .unwrap_or_else(|| folder.join("photometa-diagnostics.csv"));
    let written = report::export_diagnostics(
        &summary,
        &diagnostics,
        &report_path,
        ReportFormat::from_path(&report_path),
    )
    .with_context(|| format!("Failed to write diagnostics {}", report_path.display()))?;

    println!("{}", report::summary_line(&summary));
    if written > 0 {
        println!("Diagnostics written to {}", report_path.display());
    }

    Ok(())
}

fn build_source(
    dump_path: &Option<PathBuf>,
    native: bool,
    config: &Config,
    folder: &Path,
    taxonomy: &Taxonomy,
) -> Box<dyn RecordSource> {
    if let Some(path) = dump_path {
        return Box::new(DumpSource::new(path));
    }
    if native || config.extractor.kind == ExtractorKind::Native {
        Box::new(NativeExifSource::new(&config.extractor, folder))
    } else {
        Box::new(ExifToolSource::new(&config.extractor, folder, taxonomy))
    }
}
