use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vhostgate::artifacts::HostLayout;
use vhostgate::config::Config;
use vhostgate::deploy::DeploymentScanner;
use vhostgate::engine::{EngineSettings, ProvisioningEngine};
use vhostgate::hostname;
use vhostgate::registry::{HostRegistry, HostSpec, HostTable};
use vhostgate::router::HostRouter;
use vhostgate::server::GatewayServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vhostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let pid_file = match config.server.pid_file.as_deref().map(Path::new) {
        Some(path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The runtime's host table, seeded with the default host
    let table = Arc::new(HostTable::new());
    let default_host = hostname::normalize(&config.runtime.default_host);
    let mut default_spec = HostSpec::auto_deploying(default_host.clone(), config.runtime.app_base.clone());
    default_spec.auto_deploy = false;
    table
        .add_host(default_spec)
        .map_err(|e| anyhow::anyhow!("Failed to register default host: {}", e))?;
    table
        .mark_deployed(&default_host, config.runtime.base_dir().join(&config.runtime.app_base))
        .map_err(|e| anyhow::anyhow!("Failed to deploy default host: {}", e))?;

    let layout = HostLayout::new(config.runtime.base_dir(), config.runtime.engine_name.clone());
    let scanner = DeploymentScanner::new(
        Arc::clone(&table),
        layout,
        config.runtime.scan_interval(),
        shutdown_rx.clone(),
    );
    let scanner_handle = tokio::spawn(scanner.run());

    let engine = Arc::new(ProvisioningEngine::new(
        Arc::clone(&table) as Arc<dyn HostRegistry>,
        EngineSettings::from_config(&config),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(
        bind_addr,
        engine,
        HostRouter::new(Arc::clone(&table)),
        shutdown_rx.clone(),
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = scanner_handle.await;
    })
    .await;

    drop(pid_file);
    info!("Shutdown complete");
    Ok(())
}

/// PID file, locked for the life of the process and removed on drop
struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // Truncate only once locked, so a running instance keeps its PID
        lock_exclusive(&file)?;
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            anyhow::bail!("PID file is locked by another running instance");
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File) -> anyhow::Result<()> {
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        wait_for_context_secs = config.provisioning.wait_for_context_secs,
        time_between_creations_ms = config.provisioning.time_between_creations_ms,
        max_creations = config.provisioning.max_creations,
        scan_dependency_paths = config.provisioning.scan_dependency_paths,
        shared_key = config.provisioning.shared_key().is_some(),
        logging_enabled = config.provisioning.logging_enabled,
        "Provisioning settings"
    );
    info!(
        base_dir = %config.runtime.base_dir,
        engine = %config.runtime.engine_name,
        app_base = %config.runtime.app_base,
        default_host = %config.runtime.default_host,
        "Runtime layout"
    );
}
