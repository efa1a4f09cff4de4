//! Host registry capability
//!
//! The engine only needs three operations from the runtime that owns the
//! live hosts: look a name up, add a host, attach an alias. [`HostRegistry`]
//! is that seam. [`HostTable`] is the in-process implementation the gateway
//! binary runs on.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by a registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a host named '{0}' is already registered")]
    NameCollision(String),
    #[error("'{alias}' is already in use and cannot alias '{host}'")]
    AliasCollision { host: String, alias: String },
    #[error("no host named '{0}' is registered")]
    UnknownHost(String),
    #[error("'{name}' is occupied by an incompatible {kind} entry")]
    IncompatibleEntry { name: String, kind: String },
}

/// Opaque reference to a registered host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostHandle {
    name: String,
}

impl HostHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of a registry lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEntry {
    /// A host the engine can attach aliases to
    Host(HostHandle),
    /// Something else occupies the name
    Other { kind: String },
}

/// Everything needed to register a new host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    /// Directory, relative to the runtime base, applications deploy from
    pub app_base: String,
    /// Aliases attached from creation time
    pub aliases: Vec<String>,
    pub auto_deploy: bool,
    pub deploy_on_startup: bool,
    /// Honor descriptor files in the host's config directory
    pub deploy_descriptors: bool,
}

impl HostSpec {
    /// Spec for an auto-deploying host that reads its descriptor
    pub fn auto_deploying(name: impl Into<String>, app_base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app_base: app_base.into(),
            aliases: Vec::new(),
            auto_deploy: true,
            deploy_on_startup: true,
            deploy_descriptors: true,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// Operations the provisioning engine needs from the host runtime
pub trait HostRegistry: Send + Sync {
    /// Look up a host by name or alias
    fn find_host(&self, name: &str) -> Option<RegistryEntry>;

    /// Register a new host
    fn add_host(&self, spec: HostSpec) -> Result<HostHandle, RegistryError>;

    /// Attach an alias to an existing host
    fn add_alias(&self, host: &HostHandle, alias: &str) -> Result<(), RegistryError>;
}

/// A registered host and its deployment state
#[derive(Debug)]
pub struct VirtualHost {
    spec: HostSpec,
    aliases: RwLock<Vec<String>>,
    deployed_doc_root: RwLock<Option<PathBuf>>,
}

impl VirtualHost {
    fn new(spec: HostSpec) -> Self {
        let aliases = spec.aliases.clone();
        Self {
            spec,
            aliases: RwLock::new(aliases),
            deployed_doc_root: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn aliases(&self) -> Vec<String> {
        self.aliases.read().clone()
    }

    pub fn deployed_doc_root(&self) -> Option<PathBuf> {
        self.deployed_doc_root.read().clone()
    }
}

enum Slot {
    Host(Arc<VirtualHost>),
    /// Points at the host name the alias belongs to
    Alias(String),
    Other(String),
}

/// In-process host registry.
///
/// Host names and aliases share one namespace, so a name can never be both
/// a host and an alias.
#[derive(Default)]
pub struct HostTable {
    names: DashMap<String, Slot>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy `name` with a non-host entry of the given kind
    pub fn reserve_other(&self, name: &str, kind: &str) -> Result<(), RegistryError> {
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::NameCollision(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Other(kind.to_string()));
                Ok(())
            }
        }
    }

    /// Resolve a name or alias to its host
    pub fn resolve(&self, name: &str) -> Option<Arc<VirtualHost>> {
        let target = match self.names.get(name)?.value() {
            Slot::Host(host) => return Some(Arc::clone(host)),
            Slot::Alias(target) => target.clone(),
            Slot::Other(_) => return None,
        };
        match self.names.get(&target)?.value() {
            Slot::Host(host) => Some(Arc::clone(host)),
            _ => None,
        }
    }

    /// All registered hosts
    pub fn hosts(&self) -> Vec<Arc<VirtualHost>> {
        self.names
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Host(host) => Some(Arc::clone(host)),
                _ => None,
            })
            .collect()
    }

    /// Record that the runtime finished deploying `name` from `doc_root`
    pub fn mark_deployed(&self, name: &str, doc_root: PathBuf) -> Result<(), RegistryError> {
        let host = self
            .resolve(name)
            .ok_or_else(|| RegistryError::UnknownHost(name.to_string()))?;
        *host.deployed_doc_root.write() = Some(doc_root);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Host(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostRegistry for HostTable {
    fn find_host(&self, name: &str) -> Option<RegistryEntry> {
        let slot = self.names.get(name)?;
        match slot.value() {
            Slot::Host(host) => Some(RegistryEntry::Host(HostHandle::new(host.name()))),
            Slot::Alias(target) => Some(RegistryEntry::Host(HostHandle::new(target.as_str()))),
            Slot::Other(kind) => Some(RegistryEntry::Other { kind: kind.clone() }),
        }
    }

    fn add_host(&self, spec: HostSpec) -> Result<HostHandle, RegistryError> {
        for alias in &spec.aliases {
            if alias == &spec.name || self.names.contains_key(alias) {
                return Err(RegistryError::AliasCollision {
                    host: spec.name.clone(),
                    alias: alias.clone(),
                });
            }
        }

        let name = spec.name.clone();
        let aliases = spec.aliases.clone();
        match self.names.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::NameCollision(name)),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Host(Arc::new(VirtualHost::new(spec))));
            }
        }

        // An alias can only have been claimed concurrently; the host insert
        // above already succeeded, so a lost race just drops that alias.
        for alias in aliases {
            if let Entry::Vacant(vacant) = self.names.entry(alias.clone()) {
                vacant.insert(Slot::Alias(name.clone()));
            } else {
                debug!(host = %name, alias = %alias, "Alias claimed concurrently, skipping");
            }
        }

        debug!(host = %name, "Host registered");
        Ok(HostHandle::new(name))
    }

    fn add_alias(&self, host: &HostHandle, alias: &str) -> Result<(), RegistryError> {
        let target = match self.names.get(host.name()).as_deref() {
            Some(Slot::Host(target)) => Arc::clone(target),
            Some(Slot::Other(kind)) => {
                return Err(RegistryError::IncompatibleEntry {
                    name: host.name().to_string(),
                    kind: kind.clone(),
                })
            }
            Some(Slot::Alias(_)) | None => {
                return Err(RegistryError::UnknownHost(host.name().to_string()))
            }
        };

        match self.names.entry(alias.to_string()) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Alias(existing) if existing == host.name() => Ok(()),
                _ => Err(RegistryError::AliasCollision {
                    host: host.name().to_string(),
                    alias: alias.to_string(),
                }),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Alias(host.name().to_string()));
                target.aliases.write().push(alias.to_string());
                debug!(host = %host.name(), alias, "Alias attached");
                Ok(())
            }
        }
    }
}
