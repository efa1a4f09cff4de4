//! On-demand virtual host provisioning
//!
//! [`ProvisioningEngine::handle`] runs once per inbound request, inline on
//! the calling thread. It decides whether the request names a host that
//! already exists, an alias of an existing host, or a brand-new host, and
//! for the latter two makes the host exist before asking the client to
//! retry the same URL.
//!
//! Two locking rules hold:
//! - The already-exists check and alias attachment run without the
//!   creation lock and may overlap an in-progress creation.
//! - New-host creation (re-check, slot reservation, artifacts, registry
//!   insert, counter increment) runs entirely under the throttle's lock, so
//!   at most one creation is in flight per process.

use crate::artifacts::{ArtifactPaths, ArtifactWriter, HostLayout};
use crate::config::Config;
use crate::deploy::{DeploymentWaiter, WaitOutcome};
use crate::error::GatewayErrorCode;
use crate::hostname;
use crate::redirect::redirect_target;
use crate::registry::{HostHandle, HostRegistry, HostSpec, RegistryEntry, RegistryError};
use crate::throttle::{ThrottleController, ThrottleDenial};
use hyper::{HeaderMap, Uri};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Header carrying the document root the new host should serve
pub const DOC_ROOT_HEADER: &str = "x-tomcat-docroot";
/// Header naming the web server's virtual host the request arrived through
pub const CONTEXT_HEADER: &str = "x-webserver-context";
/// Header carrying the shared key set on the web server
pub const SHARED_KEY_HEADER: &str = "x-modcfml-sharedkey";

/// Provisioning inputs derived from one inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub doc_root: Option<String>,
    pub raw_host: Option<String>,
    pub context_host: Option<String>,
    pub shared_key: Option<String>,
    /// Request path as received
    pub uri: String,
    pub query: Option<String>,
}

impl ProvisionRequest {
    pub fn new(raw_host: impl Into<String>, doc_root: impl Into<String>) -> Self {
        Self {
            doc_root: Some(doc_root.into()),
            raw_host: Some(raw_host.into()),
            uri: "/".to_string(),
            ..Default::default()
        }
    }

    /// Extract the provisioning fields from request headers and URI
    pub fn from_parts(headers: &HeaderMap, uri: &Uri) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };

        // HTTP/2 requests carry the host in the URI authority
        let raw_host = header(hyper::header::HOST.as_str())
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()));

        Self {
            doc_root: header(DOC_ROOT_HEADER),
            raw_host,
            context_host: header(CONTEXT_HEADER),
            shared_key: header(SHARED_KEY_HEADER),
            uri: uri.path().to_string(),
            query: uri.query().map(String::from),
        }
    }

    pub fn with_context(mut self, context_host: impl Into<String>) -> Self {
        self.context_host = Some(context_host.into());
        self
    }

    pub fn with_shared_key(mut self, key: impl Into<String>) -> Self {
        self.shared_key = Some(key.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>, query: Option<&str>) -> Self {
        self.uri = uri.into();
        self.query = query.map(String::from);
        self
    }
}

/// Why a request was not provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingHost,
    MissingDocRoot,
    /// Host or context normalized to a name that cannot key a host
    InvalidHost,
    DocRootNotDirectory(PathBuf),
    SharedKeyMismatch,
    Throttled(ThrottleDenial),
    /// The context name is held by something that is not a host
    Misconfigured { name: String, kind: String },
    RegistrationFailed(RegistryError),
}

/// What happened to the host named by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    AlreadyExists,
    CreatedNew,
    AddedAlias,
    Rejected(RejectReason),
}

/// What the caller should do with the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Continue with ordinary request handling, unmodified
    PassThrough,
    /// Send a redirect to this location
    Redirect(String),
    /// Send an error response
    Reject {
        code: GatewayErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub outcome: HostOutcome,
    pub disposition: Disposition,
}

impl ProvisionResult {
    fn pass(outcome: HostOutcome) -> Self {
        Self {
            outcome,
            disposition: Disposition::PassThrough,
        }
    }

    fn redirect(outcome: HostOutcome, location: String) -> Self {
        Self {
            outcome,
            disposition: Disposition::Redirect(location),
        }
    }

    fn reject(reason: RejectReason, code: GatewayErrorCode, message: String) -> Self {
        Self {
            outcome: HostOutcome::Rejected(reason),
            disposition: Disposition::Reject { code, message },
        }
    }
}

/// Engine tunables, usually built from [`Config`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub logging_enabled: bool,
    pub wait_for_context: Duration,
    pub wait_poll_interval: Duration,
    pub time_between_creations: Duration,
    pub max_creations: u32,
    pub scan_dependency_paths: bool,
    pub shared_key: Option<String>,
    pub app_base: String,
    pub layout: HostLayout,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let provisioning = &config.provisioning;
        Self {
            logging_enabled: provisioning.logging_enabled,
            wait_for_context: provisioning.wait_for_context(),
            wait_poll_interval: provisioning.wait_poll_interval(),
            time_between_creations: provisioning.time_between_creations(),
            max_creations: provisioning.max_creations,
            scan_dependency_paths: provisioning.scan_dependency_paths,
            shared_key: provisioning.shared_key().map(String::from),
            app_base: config.runtime.app_base.clone(),
            layout: HostLayout::new(config.runtime.base_dir(), config.runtime.engine_name.clone()),
        }
    }
}

/// Result of the locked creation sequence
enum Creation {
    /// Another request created the host while this one waited for the lock
    AlreadyCreated,
    /// The context host appeared meanwhile; only the alias was attached
    Aliased,
    /// A new host was registered
    Created(ArtifactPaths),
}

pub struct ProvisioningEngine {
    registry: Arc<dyn HostRegistry>,
    throttle: ThrottleController,
    writer: ArtifactWriter,
    waiter: DeploymentWaiter,
    shared_key_digest: Option<[u8; 32]>,
    app_base: String,
    logging_enabled: bool,
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl ProvisioningEngine {
    pub fn new(registry: Arc<dyn HostRegistry>, settings: EngineSettings) -> Self {
        Self {
            registry,
            throttle: ThrottleController::new(
                settings.time_between_creations,
                settings.max_creations,
            ),
            writer: ArtifactWriter::new(settings.layout, settings.scan_dependency_paths),
            waiter: DeploymentWaiter::new(settings.wait_for_context, settings.wait_poll_interval),
            shared_key_digest: settings.shared_key.as_deref().map(digest),
            app_base: settings.app_base,
            logging_enabled: settings.logging_enabled,
        }
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    pub fn layout(&self) -> &HostLayout {
        self.writer.layout()
    }

    /// Decide and, where needed, provision the host for one request.
    ///
    /// Blocks the calling thread for filesystem work, for the creation lock
    /// and while waiting for deployment.
    pub fn handle(&self, request: &ProvisionRequest) -> ProvisionResult {
        if let Some(expected) = &self.shared_key_digest {
            let provided = request.shared_key.as_deref().map(digest);
            if provided.as_ref() != Some(expected) {
                warn!(host = ?request.raw_host, "Shared key mismatch, rejecting request");
                return ProvisionResult::reject(
                    RejectReason::SharedKeyMismatch,
                    GatewayErrorCode::SharedKeyMismatch,
                    "Request authentication failed".to_string(),
                );
            }
        }

        let Some(raw_host) = non_blank(request.raw_host.as_deref()) else {
            self.diag(|| debug!("Skipping request without host"));
            return ProvisionResult::pass(HostOutcome::Rejected(RejectReason::MissingHost));
        };

        let Some(doc_root) = non_blank(request.doc_root.as_deref()) else {
            self.diag(|| debug!(host = raw_host, "Skipping request without document root"));
            return ProvisionResult::pass(HostOutcome::Rejected(RejectReason::MissingDocRoot));
        };

        let host = hostname::normalize(raw_host);
        let context = hostname::normalize(
            non_blank(request.context_host.as_deref()).unwrap_or(raw_host),
        );
        if !HostLayout::is_host_segment(&host) || !HostLayout::is_host_segment(&context) {
            self.diag(|| debug!(host = raw_host, "Host normalized to an unusable name"));
            return ProvisionResult::pass(HostOutcome::Rejected(RejectReason::InvalidHost));
        }

        self.diag(|| {
            info!(
                host = %host,
                requested = %hostname::denormalize(&host),
                context = %context,
                doc_root,
                uri = %request.uri,
                query = ?request.query,
                "Provisioning check"
            )
        });

        if self.registry.find_host(&host).is_some() {
            return ProvisionResult::pass(HostOutcome::AlreadyExists);
        }

        let location = redirect_target(&request.uri, request.query.as_deref());

        if host != context {
            match self.registry.find_host(&context) {
                Some(RegistryEntry::Host(main)) => {
                    return self.attach_alias(&main, &host, location);
                }
                Some(RegistryEntry::Other { kind }) => {
                    return self.misconfigured(&context, kind);
                }
                None => {}
            }
        }

        let doc_root = match std::fs::canonicalize(doc_root) {
            Ok(path) if path.is_dir() => path,
            _ => {
                self.diag(|| {
                    warn!(
                        doc_root,
                        "Document root is not a directory or is not accessible"
                    )
                });
                return ProvisionResult::pass(HostOutcome::Rejected(
                    RejectReason::DocRootNotDirectory(PathBuf::from(doc_root)),
                ));
            }
        };

        match self.create_host(&host, &context, &doc_root) {
            Ok(Creation::AlreadyCreated) => {
                ProvisionResult::redirect(HostOutcome::AlreadyExists, location)
            }
            Ok(Creation::Aliased) => ProvisionResult::redirect(HostOutcome::AddedAlias, location),
            Ok(Creation::Created(paths)) => {
                match self.waiter.wait(&paths) {
                    WaitOutcome::TimedOut { attempts } => warn!(
                        host = %context,
                        attempts,
                        "Host not deployed before wait budget ran out, redirecting anyway"
                    ),
                    outcome => self.diag(|| debug!(host = %context, ?outcome, "Deployment wait finished")),
                }
                self.diag(|| info!(host = %host, location = %location, "Redirecting to new host"));
                ProvisionResult::redirect(HostOutcome::CreatedNew, location)
            }
            Err(result) => result,
        }
    }

    /// The creation sequence, entirely under the throttle lock
    fn create_host(
        &self,
        host: &str,
        context: &str,
        doc_root: &Path,
    ) -> Result<Creation, ProvisionResult> {
        let mut guard = self.throttle.lock();

        // Lookups before the lock may be stale
        if self.registry.find_host(host).is_some() {
            self.diag(|| debug!(host, "Host created by a concurrent request"));
            return Ok(Creation::AlreadyCreated);
        }

        if host != context {
            match self.registry.find_host(context) {
                Some(RegistryEntry::Host(main)) => {
                    return match self.registry.add_alias(&main, host) {
                        Ok(()) => Ok(Creation::Aliased),
                        Err(e) => Err(self.registration_failed(host, e)),
                    };
                }
                Some(RegistryEntry::Other { kind }) => {
                    return Err(self.misconfigured(context, kind));
                }
                None => {}
            }
        }

        if let Err(denial) = guard.try_reserve(Instant::now()) {
            warn!(host, reason = %denial, "Host creation throttled");
            return Err(ProvisionResult::reject(
                RejectReason::Throttled(denial),
                GatewayErrorCode::from(&denial),
                denial.to_string(),
            ));
        }

        let report = self.writer.prepare(context, doc_root);
        if !report.is_clean() {
            warn!(
                host = context,
                failures = report.failures.len(),
                "Host artifacts only partially written"
            );
        }

        let mut spec = HostSpec::auto_deploying(context, self.app_base.as_str());
        if host != context {
            spec = spec.with_alias(host);
        }

        if let Err(e) = self.registry.add_host(spec) {
            return Err(self.registration_failed(context, e));
        }

        let created = guard.record_created();
        info!(
            host = context,
            alias = (host != context).then_some(host),
            doc_root = %doc_root.display(),
            created,
            "Host created"
        );

        Ok(Creation::Created(self.writer.layout().paths(context)))
    }

    fn attach_alias(&self, main: &HostHandle, alias: &str, location: String) -> ProvisionResult {
        match self.registry.add_alias(main, alias) {
            Ok(()) => {
                info!(host = main.name(), alias, "Alias attached");
                ProvisionResult::redirect(HostOutcome::AddedAlias, location)
            }
            Err(e) => self.registration_failed(alias, e),
        }
    }

    fn misconfigured(&self, name: &str, kind: String) -> ProvisionResult {
        error!(
            name,
            kind = %kind,
            "Context name is occupied by a non-host entry, operator attention required"
        );
        ProvisionResult::pass(HostOutcome::Rejected(RejectReason::Misconfigured {
            name: name.to_string(),
            kind,
        }))
    }

    fn registration_failed(&self, name: &str, e: RegistryError) -> ProvisionResult {
        error!(name, error = %e, "Host registration failed");
        ProvisionResult::pass(HostOutcome::Rejected(RejectReason::RegistrationFailed(e)))
    }

    /// Run a per-request diagnostic only when logging is enabled
    fn diag(&self, log: impl FnOnce()) {
        if self.logging_enabled {
            log();
        }
    }
}
