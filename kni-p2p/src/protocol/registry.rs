//! Protocol registry and version negotiation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};
use crate::protocol::ProtocolHandler;

/// One version of one protocol, as advertised in the hello message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Protocol name.
    pub name: String,
    /// Protocol version (positive).
    pub version: u32,
    /// Number of message codes this version defines.
    pub message_capacity: u64,
}

impl ProtocolDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, version: u32, message_capacity: u64) -> Self {
        Self {
            name: name.into(),
            version,
            message_capacity,
        }
    }
}

/// A protocol both sides agreed to speak on a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    /// Protocol name.
    pub name: String,
    /// Highest version both sides support.
    pub version: u32,
    /// Message codes `0..message_capacity` are valid on this session.
    pub message_capacity: u64,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Pick, per protocol name present on both sides, the highest common version.
///
/// Names without a common version are dropped. The result is sorted by name
/// and does not depend on the order of either input. Capacities come from
/// the local side, since they bound what the local node accepts.
pub fn negotiate(local: &[ProtocolDescriptor], remote: &[ProtocolDescriptor]) -> Vec<Capability> {
    let mut ours: BTreeMap<&str, BTreeMap<u32, u64>> = BTreeMap::new();
    for d in local {
        // Conflicting duplicates resolve to the smaller capacity.
        ours.entry(d.name.as_str())
            .or_default()
            .entry(d.version)
            .and_modify(|cap| *cap = (*cap).min(d.message_capacity))
            .or_insert(d.message_capacity);
    }

    let mut theirs: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
    for d in remote {
        theirs.entry(d.name.as_str()).or_default().insert(d.version);
    }

    ours.into_iter()
        .filter_map(|(name, versions)| {
            let remote_versions = theirs.get(name)?;
            versions
                .iter()
                .rev()
                .find(|(version, _)| remote_versions.contains(*version))
                .map(|(&version, &message_capacity)| Capability {
                    name: name.to_string(),
                    version,
                    message_capacity,
                })
        })
        .collect()
}

#[derive(Clone)]
struct ProtocolEntry {
    versions: BTreeMap<u32, u64>,
    handler: Arc<dyn ProtocolHandler>,
}

/// The protocols this node speaks, with the handler for each.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, ProtocolEntry>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with `(version, message_capacity)` pairs.
    ///
    /// Registering a name again replaces the previous versions and handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        versions: impl IntoIterator<Item = (u32, u64)>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> P2pResult<()> {
        let name = name.into();
        let invalid = |reason: &str| P2pError::InvalidProtocol {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("empty name"));
        }

        let mut table = BTreeMap::new();
        for (version, capacity) in versions {
            if version == 0 {
                return Err(invalid("version must be positive"));
            }
            if capacity == 0 {
                return Err(invalid("message capacity must be positive"));
            }
            table.insert(version, capacity);
        }
        if table.is_empty() {
            return Err(invalid("no versions"));
        }

        if self.protocols.contains_key(&name) {
            tracing::debug!(protocol = %name, "Replacing protocol registration");
        }
        self.protocols.insert(
            name,
            ProtocolEntry {
                versions: table,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a protocol. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.protocols.remove(name).is_some()
    }

    /// Every registered (name, version), sorted by name then version.
    pub fn descriptors(&self) -> Vec<ProtocolDescriptor> {
        self.protocols
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .versions
                    .iter()
                    .map(move |(&version, &capacity)| ProtocolDescriptor::new(name.clone(), version, capacity))
            })
            .collect()
    }

    /// Negotiate against a remote peer's advertised protocols.
    pub fn negotiate_with(&self, remote: &[ProtocolDescriptor]) -> Vec<Capability> {
        negotiate(&self.descriptors(), remote)
    }

    /// Handler registered for `name`.
    pub fn handler(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.protocols.get(name).map(|entry| entry.handler.clone())
    }

    /// Registered protocol names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    /// Number of registered protocol names.
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.protocols
                    .iter()
                    .map(|(name, entry)| (name, entry.versions.keys().collect::<Vec<_>>())),
            )
            .finish()
    }
}
