//! Waiting for, and performing, deployment of written descriptors
//!
//! The host runtime picks descriptors up asynchronously. The engine uses
//! [`DeploymentWaiter`] to block until the runtime has caught up, bounded by
//! a timeout. [`DeploymentScanner`] is the gateway's own runtime side: a
//! background loop that deploys descriptors for registered hosts.

use crate::artifacts::{parse_doc_base, ArtifactPaths, HostLayout};
use crate::registry::{HostSpec, HostTable};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a wait for deployment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Waiting is disabled
    Skipped,
    /// All artifacts were observed
    Ready { attempts: u32 },
    /// The budget ran out first
    TimedOut { attempts: u32 },
}

/// Bounded sleep-poll for the runtime to materialize a host's artifacts
#[derive(Debug, Clone, Copy)]
pub struct DeploymentWaiter {
    timeout: Duration,
    interval: Duration,
}

impl DeploymentWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            // A zero interval would spin
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Check the config dir, descriptor and work dir afresh each attempt
    pub fn is_deployed(paths: &ArtifactPaths) -> bool {
        paths.config_dir.is_dir() && paths.descriptor.is_file() && paths.work_dir.is_dir()
    }

    /// Block the calling thread until the artifacts exist or the timeout
    /// elapses. Never waits longer than the timeout plus one interval.
    pub fn wait(&self, paths: &ArtifactPaths) -> WaitOutcome {
        if self.timeout.is_zero() {
            return WaitOutcome::Skipped;
        }

        // A timeout too large for the clock has no deadline
        let deadline = Instant::now().checked_add(self.timeout);
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            if Self::is_deployed(paths) {
                return WaitOutcome::Ready { attempts };
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut { attempts };
                    }
                    self.interval.min(deadline - now)
                }
                None => self.interval,
            };
            debug!(
                attempt = attempts,
                path = %paths.config_dir.display(),
                "Waiting for host deployment"
            );
            std::thread::sleep(pause);
        }
    }
}

/// Background deployer for hosts registered in a [`HostTable`]
pub struct DeploymentScanner {
    table: Arc<HostTable>,
    layout: HostLayout,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl DeploymentScanner {
    pub fn new(
        table: Arc<HostTable>,
        layout: HostLayout,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            table,
            layout,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            base = %self.layout.base_dir().display(),
            "Deployment scanner started"
        );

        self.scan(scan_startup).await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.scan(scan_once).await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Deployment scanner shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn scan(&self, pass: fn(&HostTable, &HostLayout) -> Vec<String>) {
        let table = Arc::clone(&self.table);
        let layout = self.layout.clone();
        match tokio::task::spawn_blocking(move || pass(&table, &layout)).await {
            Ok(hosts) if !hosts.is_empty() => debug!(hosts = ?hosts, "Deployment scan finished"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Deployment scan task failed"),
        }
    }
}

/// Deploy every auto-deploying host whose descriptor is present and that
/// is not deployed yet. Returns the names deployed in this pass.
pub fn scan_once(table: &HostTable, layout: &HostLayout) -> Vec<String> {
    deploy_pending(table, layout, |spec| spec.auto_deploy)
}

/// The scanner's first pass: deploy hosts marked to deploy on startup,
/// whether or not they auto-deploy afterwards
pub fn scan_startup(table: &HostTable, layout: &HostLayout) -> Vec<String> {
    deploy_pending(table, layout, |spec| spec.deploy_on_startup)
}

fn deploy_pending(
    table: &HostTable,
    layout: &HostLayout,
    eligible: impl Fn(&HostSpec) -> bool,
) -> Vec<String> {
    let mut deployed = Vec::new();

    for host in table.hosts() {
        let spec = host.spec();
        if !eligible(spec) || !spec.deploy_descriptors || host.deployed_doc_root().is_some() {
            continue;
        }

        if !HostLayout::is_host_segment(host.name()) {
            warn!(host = host.name(), "Host name is not a single path segment, skipping");
            continue;
        }

        let paths = layout.paths(host.name());
        let contents = match std::fs::read_to_string(&paths.descriptor) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        let Some(doc_base) = parse_doc_base(&contents) else {
            warn!(host = host.name(), path = %paths.descriptor.display(), "Descriptor has no docBase");
            continue;
        };

        if let Err(e) = std::fs::create_dir_all(&paths.work_dir) {
            warn!(host = host.name(), error = %e, "Failed to create work directory");
            continue;
        }

        if table.mark_deployed(host.name(), PathBuf::from(&doc_base)).is_ok() {
            info!(host = host.name(), doc_root = %doc_base, "Host deployed");
            deployed.push(host.name().to_string());
        }
    }

    deployed
}
