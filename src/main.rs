//! devport CLI - content-addressed dependency cache command line interface

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, warn};

use devport::ops::{
    check, resolve_manifest, CancelToken, CheckOptions, ManifestSource, ManifestTarget, RebuildMode,
    RebuildOptions, RebuildOutput, Rebuilder, RunReport, ScanOptions, Scanner,
};
use devport::{logging, Backend, Config, Error, LocalStore, LookupKey, LookupMode, ObjectStore, S3Store};

/// exit status for a run that finished but skipped some files
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser)]
#[command(name = "devport")]
#[command(about = "content-addressed dependency cache - snapshot node_modules and rebuild it anywhere")]
#[command(version)]
struct Cli {
    /// config file (default: ./.devport.toml, then ~/.devport/config.toml)
    #[arg(short, long, global = true, env = "DEVPORT_CONFIG")]
    config: Option<PathBuf>,

    /// debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// per-file workers, overrides the config file
    #[arg(short = 'j', long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// scan the root into the local cache and write the manifest file
    Scan,

    /// rebuild the root from the manifest file and the local cache
    Rebuild {
        /// re-hash restored files and reject mismatches
        #[arg(long)]
        verify: bool,

        /// rebuild beside the root and swap in only if every file was restored
        #[arg(long)]
        staged: bool,
    },

    /// scan the root into the configured store and publish its manifest
    Push {
        /// lookup key (default: derived from lockfile or git revision)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// fetch the manifest for a lookup key and rebuild the root from the configured store
    Pull {
        /// lookup key (default: derived from lockfile or git revision)
        #[arg(short, long)]
        key: Option<String>,

        /// re-hash restored files and reject mismatches
        #[arg(long)]
        verify: bool,

        /// rebuild beside the root and swap in only if every file was restored
        #[arg(long)]
        staged: bool,
    },

    /// report which objects a manifest needs that the store cannot provide
    Check {
        /// lookup key of a published manifest
        #[arg(short, long, conflicts_with = "manifest")]
        key: Option<String>,

        /// manifest file, checked against the local cache
        #[arg(short, long)]
        manifest: Option<PathBuf>,

        /// fetch and re-hash every object
        #[arg(long)]
        deep: bool,
    },

    /// print the lookup key push and pull would use
    Key,
}

enum Status {
    Complete,
    Partial,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    // in-flight files finish or are cleaned up; nothing partial is published
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.cancel()) {
        warn!(error = %e, "failed to install interrupt handler");
    }

    match run(cli, &cancel) {
        Ok(Status::Complete) => ExitCode::SUCCESS,
        Ok(Status::Partial) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            error!(error = %e, "aborted");
            eprintln!("error: {}", e);
            match e {
                Error::CacheMiss { .. } => {
                    eprintln!("hint: run 'devport push' on the source machine first")
                }
                Error::ManifestNotFound(_) => eprintln!("hint: run 'devport scan' first"),
                _ => {}
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, cancel: &CancelToken) -> devport::Result<Status> {
    let mut config = Config::discover(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    match cli.command {
        Commands::Scan => {
            let store = LocalStore::open(&config.cache_directory)?;
            let target = ManifestTarget::File(config.manifest_file.clone());
            let output = Scanner::new(&store, scan_options(&config, cancel)?)
                .publish(&config.root_directory, &target)?;

            println!(
                "wrote {} ({} files)",
                config.manifest_file.display(),
                output.manifest.len()
            );
            Ok(print_scan_summary(&output.report))
        }

        Commands::Rebuild { verify, staged } => {
            let store = LocalStore::open(&config.cache_directory)?;
            let source = ManifestSource::File(config.manifest_file.clone());
            let output = Rebuilder::new(&store, rebuild_options(&config, verify, staged, cancel))
                .rebuild(&source, &config.root_directory)?;
            Ok(print_rebuild_summary(&config.root_directory, &output))
        }

        Commands::Push { key } => {
            let key = lookup_key(&config, key)?;
            let store = open_backend(&config)?;
            let output = Scanner::new(store.as_ref(), scan_options(&config, cancel)?)
                .publish(&config.root_directory, &ManifestTarget::Store(key.clone()))?;

            println!(
                "pushed {} files to {} as {}",
                output.manifest.len(),
                store.describe(),
                key
            );
            Ok(print_scan_summary(&output.report))
        }

        Commands::Pull {
            key,
            verify,
            staged,
        } => {
            let key = lookup_key(&config, key)?;
            let store = open_backend(&config)?;
            let output =
                Rebuilder::new(store.as_ref(), rebuild_options(&config, verify, staged, cancel))
                .rebuild(&ManifestSource::Store(key), &config.root_directory)?;
            Ok(print_rebuild_summary(&config.root_directory, &output))
        }

        Commands::Check {
            key,
            manifest,
            deep,
        } => {
            let (store, source) = match manifest {
                Some(path) => {
                    let local: Box<dyn ObjectStore> =
                        Box::new(LocalStore::open(&config.cache_directory)?);
                    (local, ManifestSource::File(path))
                }
                None => (
                    open_backend(&config)?,
                    ManifestSource::Store(lookup_key(&config, key)?),
                ),
            };
            store.check_access()?;
            let manifest = resolve_manifest(store.as_ref(), &source)?;
            let options = CheckOptions {
                strategy: config.strategy(),
                deep,
            };
            let report = check(store.as_ref(), &manifest, &options);

            println!(
                "objects checked: {} ({} files)",
                report.objects_checked,
                manifest.len()
            );
            if report.is_ok() {
                println!("all objects available");
                Ok(Status::Complete)
            } else {
                print!("{}", report);
                Ok(Status::Partial)
            }
        }

        Commands::Key => {
            println!("{}", lookup_key(&config, None)?);
            Ok(Status::Complete)
        }
    }
}

fn open_backend(config: &Config) -> devport::Result<Box<dyn ObjectStore>> {
    let store: Box<dyn ObjectStore> = match config.backend {
        Backend::Local => Box::new(LocalStore::open(&config.cache_directory)?),
        Backend::S3 => Box::new(S3Store::new(config.s3_options())?),
    };
    Ok(store)
}

fn lookup_key(config: &Config, explicit: Option<String>) -> devport::Result<LookupKey> {
    match explicit {
        Some(key) => LookupKey::new(key),
        None => match config.lookup {
            LookupMode::Lockfile => LookupKey::from_lockfile(&config.lockfile),
            LookupMode::Commit => LookupKey::from_git_revision(Path::new(".")),
        },
    }
}

fn scan_options(config: &Config, cancel: &CancelToken) -> devport::Result<ScanOptions> {
    Ok(ScanOptions {
        strategy: config.strategy(),
        native_patterns: config.native_patterns()?,
        cancel: cancel.clone(),
    })
}

fn rebuild_options(
    config: &Config,
    verify: bool,
    staged: bool,
    cancel: &CancelToken,
) -> RebuildOptions {
    RebuildOptions {
        strategy: config.strategy(),
        mode: if staged {
            RebuildMode::Staged
        } else {
            RebuildMode::InPlace
        },
        verify,
        cancel: cancel.clone(),
    }
}

fn print_scan_summary(report: &RunReport) -> Status {
    println!(
        "transferred: {} uploaded, {} deduplicated, {} skipped, {} bytes",
        report.uploaded(),
        report.deduplicated(),
        report.skipped().count(),
        report.bytes_transferred()
    );
    print_skipped(report)
}

fn print_rebuild_summary(root: &Path, output: &RebuildOutput) -> Status {
    let report = &output.report;
    if output.applied {
        println!(
            "rebuilt {}: {} restored, {} skipped, {} bytes",
            root.display(),
            report.restored(),
            report.skipped().count(),
            report.bytes_transferred()
        );
    } else {
        println!(
            "staged rebuild discarded, {} left unchanged ({} of {} files could not be restored)",
            root.display(),
            report.skipped().count(),
            report.len()
        );
    }
    print_skipped(report)
}

fn print_skipped(report: &RunReport) -> Status {
    if report.is_complete() {
        return Status::Complete;
    }
    println!("\nnot transferred:");
    print!("{}", report);
    Status::Partial
}
