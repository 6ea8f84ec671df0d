//! iob daemon - connection broker for action hosts and dashboard clients
//!
//! This binary runs the broker: hosts connect on `/ws/host`, dashboard
//! clients on `/ws/client`, and the daemon relays transactions and pages
//! between them.
//!
//! # Usage
//!
//! ```bash
//! # Start the broker in the foreground
//! iobd start
//!
//! # Start in the background with an explicit config and listen address
//! iobd start -d --config /etc/iob/iobd.toml --listen 0.0.0.0:3002
//!
//! # Stop the broker, waiting up to 10 seconds for connections to drain
//! iobd stop --wait 10
//!
//! # Show pid, listen address, config source and log file
//! iobd status
//! ```

use std::fs::{self, File, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iobd::config::{default_config_path, CONFIG_ENV};
use iobd::notifier::TracingNotifier;
use iobd::store::MemoryStore;
use iobd::{AppState, BrokerConfig, BrokerServer};

/// Overrides the directory holding the pid file and broker log.
const STATE_DIR_ENV: &str = "IOB_STATE_DIR";

/// iob daemon - transaction and page broker
#[derive(Parser, Debug)]
#[command(name = "iobd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker
    Start {
        /// Detach and log to the broker log file
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $IOB_CONFIG, then the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the config file
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Stop the running broker
    Stop {
        /// Seconds to wait for the broker to drain its connections
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    /// Show broker status
    Status,
}

/// Files the broker keeps between runs.
struct RuntimeFiles {
    dir: PathBuf,
}

impl RuntimeFiles {
    fn locate() -> Self {
        let dir = std::env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::state_dir().map(|dir| dir.join("iob")))
            .unwrap_or_else(|| PathBuf::from("/tmp/iob"));
        Self { dir }
    }

    fn pid(&self) -> PathBuf {
        self.dir.join("iobd.pid")
    }

    fn log(&self) -> PathBuf {
        self.dir.join("broker.log")
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))
    }

    /// The pid of a live broker, clearing a pid file left by a dead one.
    fn running_broker(&self) -> Option<u32> {
        let pid: u32 = fs::read_to_string(self.pid()).ok()?.trim().parse().ok()?;
        if Path::new(&format!("/proc/{pid}")).exists() {
            Some(pid)
        } else {
            let _ = fs::remove_file(self.pid());
            None
        }
    }
}

/// Removes the pid file when the broker exits.
struct PidFile(PathBuf);

impl PidFile {
    fn claim(path: PathBuf) -> Result<Self> {
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Self(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// Where the configuration comes from, for `status`.
fn config_source(explicit: Option<&Path>) -> String {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(default_config_path);
    match path {
        Some(path) if path.exists() => path.display().to_string(),
        Some(path) => format!("defaults ({} not found)", path.display()),
        None => "defaults".to_string(),
    }
}

fn signal_broker(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to broker (PID {pid})");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("Stop command is only supported on Unix systems");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let files = RuntimeFiles::locate();

    match args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        listen: None,
    }) {
        Command::Start {
            daemon,
            config,
            listen,
        } => start(&files, daemon, config.as_deref(), listen),
        Command::Stop { wait } => stop(&files, Duration::from_secs(wait)),
        Command::Status => status(&files),
    }
}

fn start(
    files: &RuntimeFiles,
    daemon: bool,
    config_path: Option<&Path>,
    listen: Option<SocketAddr>,
) -> Result<()> {
    if let Some(pid) = files.running_broker() {
        eprintln!("Broker is already running (PID {pid})");
        eprintln!("Use 'iobd stop' to stop it first.");
        process::exit(1);
    }

    // Load before detaching so config errors reach the terminal.
    let mut config = BrokerConfig::load(config_path).context("Failed to load configuration")?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    files.ensure_dir()?;
    if daemon {
        detach(&files.log())?;
    }

    let _pid = PidFile::claim(files.pid())?;
    run_broker(config)
}

fn stop(files: &RuntimeFiles, wait: Duration) -> Result<()> {
    let Some(pid) = files.running_broker() else {
        println!("Broker is not running.");
        return Ok(());
    };

    println!("Stopping broker (PID {pid})...");
    signal_broker(pid)?;

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < wait {
        if files.running_broker().is_none() {
            println!("Broker stopped.");
            return Ok(());
        }
        std::thread::sleep(poll);
        waited += poll;
    }

    eprintln!("Broker did not stop within {}s.", wait.as_secs());
    process::exit(1);
}

fn status(files: &RuntimeFiles) -> Result<()> {
    let Some(pid) = files.running_broker() else {
        println!("Broker is not running.");
        process::exit(1);
    };

    println!("Broker is running (PID {pid})");
    println!("  config:  {}", config_source(None));
    match BrokerConfig::load(None) {
        Ok(config) => {
            println!("  listen:  {}", config.listen);
            println!("  hosts:   ws://{}/ws/host", config.listen);
            println!("  clients: ws://{}/ws/client", config.listen);
        }
        Err(e) => println!("  config error: {e}"),
    }
    println!("  log:     {}", files.log().display());
    Ok(())
}

fn detach(log_path: &Path) -> Result<()> {
    use daemonize::Daemonize;

    let open_log = || -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open {}", log_path.display()))
    };

    Daemonize::new()
        .working_directory(Path::new("/"))
        .stdout(open_log()?)
        .stderr(open_log()?)
        .start()
        .context("Failed to detach broker")?;

    Ok(())
}

#[tokio::main]
async fn run_broker(config: BrokerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("iobd=info".parse()?)
                .add_directive("iob_core=info".parse()?)
                .add_directive("iob_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.listen,
        min_sdk_version = %config.min_sdk_version,
        "iob broker starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Draining connections");
        shutdown_token.cancel();
    });

    let store = MemoryStore::with_credentials(&config.credentials);
    info!(
        api_keys = config.credentials.api_keys.len(),
        sessions = config.credentials.sessions.len(),
        "Credentials loaded"
    );

    let state = AppState::new(config, Arc::new(store), Arc::new(TracingNotifier))
        .context("Invalid broker configuration")?;
    BrokerServer::new(state, cancel_token)
        .run()
        .await
        .inspect_err(|e| error!(error = %e, "Broker server failed"))?;

    info!("iob broker stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "Shutdown signal received");
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!(signal = "ctrl-c", "Shutdown signal received");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_files_live_in_one_dir() {
        let files = RuntimeFiles {
            dir: PathBuf::from("/var/lib/iob"),
        };
        assert_eq!(files.pid(), PathBuf::from("/var/lib/iob/iobd.pid"));
        assert_eq!(files.log(), PathBuf::from("/var/lib/iob/broker.log"));
    }

    #[test]
    fn test_config_source_reports_explicit_file() {
        let missing = std::env::temp_dir().join("iobd-status-missing.toml");
        assert_eq!(
            config_source(Some(&missing)),
            format!("defaults ({} not found)", missing.display())
        );

        let present = std::env::temp_dir();
        assert_eq!(config_source(Some(&present)), present.display().to_string());
    }
}
