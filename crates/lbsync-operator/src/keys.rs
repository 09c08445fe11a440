//! Work-queue key formats
//!
//! Two layers of keys flow through the pipeline:
//!
//! - ingestion keys, `{Kind}/{namespace}/{name}` (or `{Kind}/{name}` for
//!   cluster-scoped kinds), produced by the watchers
//! - tenant-qualified keys, `{tenant}/{name}`, used by the graph store, the
//!   convergence engine and the backend cache
//!
//! The graph builder is the only component translating between the two.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Kind prefix for LoadBalancer Services
pub const L4_SERVICE_KIND: &str = "L4LBService";
/// Kind prefix for Nodes feeding the VRF static routes
pub const NODE_KIND: &str = "Node";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed key '{0}'")]
    Malformed(String),
    #[error("unknown kind in key '{0}'")]
    UnknownKind(String),
}

/// Key produced at ingestion, identifying one cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IngestionKey {
    L4Service { namespace: String, name: String },
    Node { name: String },
}

impl IngestionKey {
    pub fn l4_service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::L4Service {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self::Node { name: name.into() }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let mut parts = key.splitn(3, '/');
        let kind = parts.next().unwrap_or_default();
        match kind {
            L4_SERVICE_KIND => match (parts.next(), parts.next()) {
                (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                    Ok(Self::l4_service(ns, name))
                }
                _ => Err(KeyError::Malformed(key.to_string())),
            },
            NODE_KIND => match (parts.next(), parts.next()) {
                (Some(name), None) if !name.is_empty() => Ok(Self::node(name)),
                _ => Err(KeyError::Malformed(key.to_string())),
            },
            _ => Err(KeyError::UnknownKind(key.to_string())),
        }
    }

    /// Namespace of namespaced kinds
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::L4Service { namespace, .. } => Some(namespace),
            Self::Node { .. } => None,
        }
    }
}

impl fmt::Display for IngestionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L4Service { namespace, name } => {
                write!(f, "{L4_SERVICE_KIND}/{namespace}/{name}")
            }
            Self::Node { name } => write!(f, "{NODE_KIND}/{name}"),
        }
    }
}

/// Tenant-qualified key of a backend object or of a desired-state model
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectKey {
    pub tenant: String,
    pub name: String,
}

/// Key of one desired-state graph; same shape as the key of its root object
pub type ModelKey = ObjectKey;

impl ObjectKey {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        match key.split_once('/') {
            Some((tenant, name)) if !tenant.is_empty() && !name.is_empty() => {
                Ok(Self::new(tenant, name))
            }
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}

/// Shard selector for ingestion keys: the namespace, or the kind for
/// cluster-scoped resources.
pub fn ingestion_shard_key(key: &str) -> &str {
    let mut parts = key.splitn(3, '/');
    let kind = parts.next().unwrap_or(key);
    match (parts.next(), parts.next()) {
        (Some(namespace), Some(_)) => namespace,
        _ => kind,
    }
}

/// Shard selector for model keys: the tenant.
pub fn model_shard_key(key: &str) -> &str {
    key.split_once('/').map(|(tenant, _)| tenant).unwrap_or(key)
}
