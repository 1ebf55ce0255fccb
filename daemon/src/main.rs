//! cardkeeper daemon: boots, monitors and shuts down the accelerator cards
//! attached to this host.

mod lock;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use cardkeeper_host::config::TransportKind;
use cardkeeper_host::{ConfigError, Daemon, DaemonConfig, DaemonContext, HostError};
use cardkeeper_network::{TcpTransport, TcpTransportConfig, Transport};
use cardkeeper_sysfs::SysfsAttributes;
use cardkeeper_utils::{init_logging, LogFormat};

use crate::lock::{InstanceLock, LockError};

#[derive(Parser)]
#[command(name = "cardkeeperd", about = "Accelerator card lifecycle daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/cardkeeper/cardkeeper.toml", env = "CARDKEEPER_CONFIG")]
    config: PathBuf,

    /// Run in the foreground and log to stderr instead of the log file.
    #[arg(long, env = "CARDKEEPER_LOCAL")]
    local: bool,

    /// Log level: "trace", "debug", "info", "warn", "error".
    /// Defaults to the config file's value.
    #[arg(long, env = "CARDKEEPER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "CARDKEEPER_LOG_FORMAT")]
    log_format: Option<String>,

    /// Written with the daemon's pid once every card has been brought up.
    #[arg(long, env = "CARDKEEPER_PID_FILE")]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the daemon (the default).
    Run,
    /// Load and validate the configuration, then print it with defaults filled in.
    CheckConfig,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_NO_NODES: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cardkeeperd: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Some(Command::CheckConfig) = cli.command {
        return match config.to_toml_string() {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cardkeeperd: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        };
    }

    if let Err(e) = setup_logging(&config, cli.local) {
        eprintln!("cardkeeperd: {e:#}");
        return ExitCode::from(EXIT_CONFIG);
    }
    install_panic_hook();
    tracing::info!("Loaded config from {}", cli.config.display());

    match run(config).await {
        Ok(()) => {
            tracing::info!("cardkeeper daemon exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn load_config(cli: &Cli) -> Result<DaemonConfig, ConfigError> {
    let mut config = DaemonConfig::from_toml_file(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format.clone();
    }
    if let Some(pid_file) = &cli.pid_file {
        config.pid_file = Some(pid_file.clone());
    }
    if cli.local {
        config.log_file = None;
    }
    Ok(config)
}

fn setup_logging(config: &DaemonConfig, local: bool) -> anyhow::Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    let log_file = if local { None } else { config.log_file.as_deref() };
    init_logging(format, &config.log_level, log_file)?;
    Ok(())
}

/// Log panics, with a symbolized backtrace, through the daemon log rather
/// than an unattended stderr.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(panic = %info, "task panicked\n{backtrace}");
    }));
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(HostError::NoNodes) = e.downcast_ref::<HostError>() {
        EXIT_NO_NODES
    } else if e.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else if let Some(HostError::Config(_)) = e.downcast_ref::<HostError>() {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let _lock = InstanceLock::acquire(&config.lock_file).map_err(|e| match e {
        LockError::Held(path) => {
            anyhow::anyhow!("another cardkeeper daemon is running (lock {})", path.display())
        }
        other => anyhow::Error::new(other),
    })?;

    let transport = build_transport(&config)?;
    let attrs = Arc::new(SysfsAttributes::new(config.sysfs_dir.clone()));
    let pid_file = config.pid_file.clone();

    let ctx = DaemonContext::discover(config, attrs, transport).await?;
    let daemon = Daemon::start(Arc::clone(&ctx)).await?;

    let signal = ctx.shutdown.wait_for_signal();
    tokio::pin!(signal);
    let signalled = tokio::select! {
        _ = daemon.wait_started() => false,
        res = &mut signal => {
            res.context("installing signal handlers")?;
            true
        }
    };
    if !signalled {
        if let Some(path) = &pid_file {
            write_pid_file(path).await;
        }
        tracing::info!(cards = ctx.registry.len(), "cardkeeper daemon ready");
        signal.await.context("installing signal handlers")?;
    }

    let summary = daemon.shutdown().await;
    if let Some(path) = &pid_file {
        let _ = tokio::fs::remove_file(path).await;
    }
    if !summary.wedged.is_empty() {
        tracing::warn!(
            wedged = ?summary.wedged,
            "exiting with cards still shutting down"
        );
    }
    Ok(())
}

fn build_transport(config: &DaemonConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Tcp => {
            let mut nodes = HashMap::new();
            for card in &config.cards {
                let Some(address) = card.address else {
                    tracing::warn!(node = %card.name, "no fabric address configured");
                    continue;
                };
                nodes.insert(card.node_id()?.fabric_node(), address);
            }
            Ok(Arc::new(TcpTransport::new(TcpTransportConfig {
                bind_address: config.transport.bind_address,
                nodes,
            })))
        }
    }
}

async fn write_pid_file(path: &Path) {
    let pid = format!("{}\n", std::process::id());
    if let Err(e) = tokio::fs::write(path, pid).await {
        tracing::warn!(path = %path.display(), error = %e, "cannot write pid file");
    }
}
