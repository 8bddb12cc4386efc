use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use assetso_lifecycle_api::{
    preview_archive, CancellationFlag, ConfigArgs, DataLifecycle, LifecycleError,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "alm")]
#[command(about = "Assetso data lifecycle CLI: export, import and clean")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Write a backup archive of every table and uploaded file.
    Export(ExportArgs),
    /// Restore an archive into the selected engine and the uploads directory.
    Import(ImportArgs),
    /// Validate an archive and print its metadata.
    Preview(PreviewArgs),
    /// Delete operational data and reseed the administrator account.
    Clean(CleanArgs),
    /// Print the configured engines in the order they are tried.
    Engines,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Migrate,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Archive path, or an existing directory to receive a timestamped archive.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Confirm that every non-admin row may be deleted.
    #[arg(long, default_value_t = false)]
    yes: bool,
}

fn envelope(data: Value) -> Value {
    serde_json::json!({
        "cli_contract_version": CLI_CONTRACT_VERSION,
        "data": data
    })
}

fn emit_json(data: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&envelope(data))?);
    Ok(())
}

/// Failures still go to stdout as JSON so operators see how far the operation got.
fn emit_error(err: &anyhow::Error) {
    let lifecycle = err.downcast_ref::<LifecycleError>();
    let summary = lifecycle.and_then(|err| {
        err.restore_summary()
            .and_then(|summary| serde_json::to_value(summary).ok())
            .or_else(|| err.clean_summary().and_then(|summary| serde_json::to_value(summary).ok()))
    });
    let body = serde_json::json!({
        "cli_contract_version": CLI_CONTRACT_VERSION,
        "error": format!("{err:#}"),
        "summary": summary
    });
    match serde_json::to_string_pretty(&body) {
        Ok(text) => println!("{text}"),
        Err(_) => eprintln!("{err:#}"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = &dotenv {
        if !err.not_found() {
            tracing::warn!(error = %err, "ignoring unreadable environment file");
        }
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            emit_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.config.resolve()?;
    let lifecycle = DataLifecycle::new(&config);
    match cli.command {
        Command::Db { command: DbCommand::Migrate } => run_db_migrate(&lifecycle),
        Command::Export(args) => run_export(&args, &lifecycle),
        Command::Import(args) => run_import(&args, &lifecycle),
        Command::Preview(args) => run_preview(&args),
        Command::Clean(args) => run_clean(&args, &lifecycle),
        Command::Engines => emit_json(serde_json::json!({
            "engines": lifecycle.engines(),
            "uploads_dir": config.uploads_dir
        })),
    }
}

fn run_db_migrate(lifecycle: &DataLifecycle) -> Result<()> {
    let status = lifecycle.migrate()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_export(args: &ExportArgs, lifecycle: &DataLifecycle) -> Result<()> {
    let into_directory = args.out.is_dir();
    let directory = if into_directory {
        args.out.clone()
    } else {
        match args.out.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    };
    fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create export directory {}", directory.display()))?;

    // Only a finished archive is ever visible at the destination.
    let staged = tempfile::Builder::new()
        .prefix(".assetso-export-")
        .suffix(".zip")
        .tempfile_in(&directory)
        .with_context(|| format!("failed to stage export in {}", directory.display()))?;
    let (staged, report) = lifecycle.export(staged, &CancellationFlag::new())?;

    let destination =
        if into_directory { directory.join(&report.file_name) } else { args.out.clone() };
    staged
        .persist(&destination)
        .map_err(|err| anyhow!("failed to write archive {}: {}", destination.display(), err.error))?;

    emit_json(serde_json::json!({
        "out": destination,
        "engine": report.engine,
        "file_name": report.file_name,
        "metadata": report.metadata
    }))
}

fn open_archive(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("failed to open archive {}", path.display()))
}

fn run_import(args: &ImportArgs, lifecycle: &DataLifecycle) -> Result<()> {
    let summary = lifecycle.import(open_archive(&args.input)?)?;
    emit_json(serde_json::json!({
        "in": args.input,
        "summary": summary
    }))
}

fn run_preview(args: &PreviewArgs) -> Result<()> {
    let metadata = preview_archive(open_archive(&args.input)?)?;
    emit_json(serde_json::to_value(metadata)?)
}

fn run_clean(args: &CleanArgs, lifecycle: &DataLifecycle) -> Result<()> {
    if !args.yes {
        return Err(anyhow!("clean deletes all operational data; pass --yes to confirm"));
    }
    let summary = lifecycle.clean()?;
    emit_json(serde_json::to_value(summary)?)
}
