use clap::{Args, Parser, Subcommand};
use color_eyre::eyre;
use savior_lib::jobs::{backup, backup_temp, finalize_transfers, restore};
use savior_lib::{JobConfig, JobContext, JobMode};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Parser)]
#[command(
    name = "vm-savior",
    version,
    about = "Back up and restore oVirt virtual machines with their snapshot chains",
    after_help = "\
Environment variables:
  SAVIOR_PASSWORD   Replaces connection.password from the setup file
  RUST_LOG          Log filter (overrides -v)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot a VM and download its disk images and settings
    Backup(JobArgs),
    /// Replace the backup snapshot without downloading anything
    BackupTemp(JobArgs),
    /// Recreate a VM from a previous backup
    Restore(JobArgs),
    /// Finalize every image transfer the engine still lists as open
    FinalizeTransfers(JobArgs),
}

#[derive(Args)]
struct JobArgs {
    /// YAML setup file describing the connection, directories and VM
    #[arg(short, long)]
    setup_file: PathBuf,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also append the job log to this file, shared across VMs and runs
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Command {
    fn args(&self) -> &JobArgs {
        match self {
            Command::Backup(args)
            | Command::BackupTemp(args)
            | Command::Restore(args)
            | Command::FinalizeTransfers(args) => args,
        }
    }
}

fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    let cli = Cli::parse();
    let args = cli.command.args();
    let config = JobConfig::from_file(&args.setup_file)?;

    let subscriber = job_subscriber(
        args.verbose,
        &config.vm_log_path(),
        args.log_file.as_deref(),
    )?;
    let _guard = tracing::subscriber::set_default(subscriber);

    // Single-threaded so the scoped subscriber covers the whole job.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(&cli.command, config))
}

/// Stdout, the per-VM log truncated on every run, and an optional appending
/// log file, filtered by `RUST_LOG` or the verbosity flag.
fn job_subscriber(
    verbose: u8,
    vm_log: &Path,
    log_file: Option<&Path>,
) -> eyre::Result<impl tracing::Subscriber + Send + Sync> {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if let Some(parent) = vm_log.parent() {
        fs::create_dir_all(parent)?;
    }
    let vm_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(File::create(vm_log)?));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    Ok(Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(vm_layer)
        .with(file_layer))
}

async fn run(command: &Command, config: JobConfig) -> eyre::Result<()> {
    match command {
        Command::Backup(_) => {
            config.validate(JobMode::Backup)?;
            let span = info_span!("job", mode = %JobMode::Backup, vm = %config.vm.name);
            let ctx = JobContext::connect(config)?;
            let report = backup(&ctx).instrument(span).await?;
            info!(
                vm = %report.vm.name,
                snapshot = %report.snapshot.description,
                images = report.images,
                settings = %report.settings_path.display(),
                "Backup finished"
            );
        }
        Command::BackupTemp(_) => {
            config.validate(JobMode::BackupTemp)?;
            let span = info_span!("job", mode = %JobMode::BackupTemp, vm = %config.vm.name);
            let ctx = JobContext::connect(config)?;
            let report = backup_temp(&ctx).instrument(span).await?;
            info!(
                vm = %report.vm.name,
                snapshot_id = %report.snapshot.id,
                "Backup snapshot ready"
            );
        }
        Command::Restore(_) => {
            config.validate(JobMode::Restore)?;
            let span = info_span!("job", mode = %JobMode::Restore, vm = %config.vm.name);
            let ctx = JobContext::connect(config)?;
            let report = restore(&ctx).instrument(span).await?;
            info!(
                vm = %report.restored.vm.name,
                vm_id = %report.restored.vm.id,
                disks = report.restored.disk_mapping.len(),
                snapshots = report.restored.snapshots.len(),
                "Restore finished"
            );
        }
        Command::FinalizeTransfers(_) => {
            let ctx = JobContext::connect(config)?;
            let finalized = finalize_transfers(&ctx).await?;
            info!(finalized, "Open transfers finalized");
        }
    }
    Ok(())
}
