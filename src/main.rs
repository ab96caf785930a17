use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pvevm::catalog;
use pvevm::download::HttpSource;
use pvevm::menu::Whiptail;
use pvevm::pve::{Hypervisor, QmCli};
use pvevm::usb::LsUsb;
use pvevm::workflow::Workflow;
use pvevm::{cleanup, config, format, system_check};

#[derive(Parser)]
#[command(
    name = "pvevm",
    version,
    about = "Create Proxmox VE virtual machines from upstream appliance releases"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.config/pvevm/pvevmrc)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// GitHub repository to take releases from (OWNER/NAME; overrides config)
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactively create a new VM (default)
    Create,

    /// List the releases that can be installed
    Releases,

    /// List storage pools that can hold VM disks
    Storage,

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show current configuration
    Get,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Install the tracing subscriber: everything at debug level goes to the log
/// file, and a compact stderr layer honors `RUST_LOG` (default `warn`, or
/// `debug` with `--verbose`).
fn install_tracing(log_file: &Path, verbose: bool) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let file_layer = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        ),
        Err(e) => {
            eprintln!("warning: cannot open log file {}: {e}", log_file.display());
            None
        }
    };

    let default_level = if verbose { "debug" } else { "warn" };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let format = fmt::format().without_time().with_target(false).compact();
    let stderr_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter_layer);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

/// Refuse to start `create` on a host that cannot run it.
fn preflight() -> Result<()> {
    if !pvevm::is_privileged() {
        bail!("pvevm requires root privileges; run with sudo");
    }
    if !pvevm::is_interactive_terminal() {
        bail!("pvevm create needs an interactive terminal");
    }
    system_check::check_arch()?;
    system_check::check_dependencies(system_check::REQUIRED_PROGRAMS)?;
    system_check::check_pve_version(7, 2)?;
    Ok(())
}

fn create(cfg: &config::Config) -> Result<()> {
    preflight()?;
    pvevm::install_interrupt_handler();

    let releases = HttpSource::new()?;
    let mut menu = Whiptail;
    let vmid = Workflow {
        config: cfg,
        hypervisor: &QmCli,
        releases: &releases,
        usb: &LsUsb,
        menu: &mut menu,
    }
    .create()?;
    eprintln!("✓ Completed successfully! New VM id is {vmid}");
    println!("{vmid}");
    Ok(())
}

fn list_releases(cfg: &config::Config) -> Result<()> {
    let source = HttpSource::new()?;
    let entries = catalog::fetch(&source, cfg)?;
    if entries.is_empty() {
        println!("no releases found");
        return Ok(());
    }
    let version_w = entries.iter().map(|e| e.version.len()).max().unwrap_or(0).max(7);
    println!("{:<version_w$}  {:<8}  URL", "VERSION", "KIND");
    for e in &entries {
        println!("{:<version_w$}  {:<8}  {}", e.version, e.kind.to_string(), e.download_url);
    }
    Ok(())
}

fn list_storage() -> Result<()> {
    let targets = QmCli.storage_status()?;
    if targets.is_empty() {
        println!("no storage with support for VM images found");
        return Ok(());
    }
    let id_w = targets.iter().map(|t| t.id.len()).max().unwrap_or(0).max(4);
    let type_w = targets.iter().map(|t| t.backend.len()).max().unwrap_or(0).max(4);
    println!("{:<id_w$}  {:<type_w$}  FREE", "NAME", "TYPE");
    for t in &targets {
        println!(
            "{:<id_w$}  {:<type_w$}  {}",
            t.id,
            t.backend,
            format::kib_to_human(t.free_kib)
        );
    }
    Ok(())
}

fn run(cli: Cli, cfg: config::Config) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command.unwrap_or(Command::Create) {
        Command::Create => create(&cfg)?,
        Command::Releases => list_releases(&cfg)?,
        Command::Storage => list_storage()?,
        Command::Config(cmd) => match cmd {
            ConfigCommand::Get => {
                let resolved = config::resolve_path(config_path)?;
                tracing::debug!("config: {}", resolved.display());
                cfg.display();
            }
            ConfigCommand::Set { key, value } => {
                // Persist the file contents, not the --repo override.
                let mut stored = config::load(config_path)?;
                stored.set(&key, &value)?;
                config::save(&stored, config_path)?;
            }
        },
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(repo) = &cli.repo {
        if let Err(e) = cfg.set("repo", repo) {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    install_tracing(&cfg.log_file, cli.verbose);
    tracing::info!("pvevm {} starting", env!("CARGO_PKG_VERSION"));

    let log_file = cfg.log_file.clone();
    match run(cli, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(cleanup::report(&e, &log_file) as u8),
    }
}
