//! Backend controller REST client
//!
//! The backend exposes resource-oriented endpoints of the form
//! `/api/<type>[/<uuid>]`. Collections are read with filtered queries, writes
//! go through POST (create), PUT (update) and DELETE on a single object.
//! Every request carries the tenant it operates in.
//!
//! Bodies cross the trait boundary as `serde_json::Value`; the typed wire
//! structs live in [`models`].

pub mod models;
mod rest;

pub use rest::{ClientSettings, RestBackendClient};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Tenant header value selecting every tenant on collection reads
pub const ALL_TENANTS: &str = "*";

/// Object types the operator reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    VirtualService,
    VsVip,
    Pool,
    L4PolicySet,
    VrfContext,
    HealthMonitor,
}

impl ObjectType {
    /// Types created and owned by the operator
    pub const MANAGED: [ObjectType; 4] = [
        ObjectType::VsVip,
        ObjectType::Pool,
        ObjectType::L4PolicySet,
        ObjectType::VirtualService,
    ];

    /// URL path segment
    pub fn path(&self) -> &'static str {
        match self {
            Self::VirtualService => "virtualservice",
            Self::VsVip => "vsvip",
            Self::Pool => "pool",
            Self::L4PolicySet => "l4policyset",
            Self::VrfContext => "vrfcontext",
            Self::HealthMonitor => "healthmonitor",
        }
    }

    /// Whether objects of this type are created by the operator (and
    /// therefore filtered by `created_by` on reads)
    pub fn is_managed(&self) -> bool {
        Self::MANAGED.contains(self)
    }

    /// Whether objects of this type are placed in a cloud
    pub fn is_cloud_scoped(&self) -> bool {
        matches!(self, Self::VirtualService | Self::VsVip | Self::Pool)
    }

    /// Reference to an object of this type by uuid, as used inside bodies
    pub fn reference(&self, uuid: &str) -> String {
        format!("/api/{}/{}", self.path(), uuid)
    }

    /// Extract the uuid from a reference produced by [`ObjectType::reference`]
    /// or returned by the backend (`https://host/api/pool/pool-uuid#name`).
    pub fn uuid_from_reference(reference: &str) -> Option<&str> {
        let without_name = reference.split('#').next().unwrap_or(reference);
        without_name
            .rsplit('/')
            .next()
            .filter(|uuid| !uuid.is_empty())
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Errors returned by the backend client
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport failure: timeout, connection refused, TLS
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("Backend API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Failed to parse a backend response
    #[error("failed to parse backend response: {0}")]
    Parse(String),

    /// Invalid client configuration
    #[error("client configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// HTTP status of an API error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Message returned by the backend, empty for transport errors
    pub fn message(&self) -> &str {
        match self {
            Self::Api { message, .. } => message,
            _ => "",
        }
    }
}

/// Operations on the backend controller
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// List every object of a type visible in `tenant` (use [`ALL_TENANTS`]
    /// for all). Managed types are filtered to objects created by this cluster.
    async fn list(&self, object_type: ObjectType, tenant: &str) -> Result<Vec<Value>, BackendError>;

    /// Read one object by uuid. `Ok(None)` if it does not exist.
    async fn get(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<Option<Value>, BackendError>;

    /// Read one object by name. `Ok(None)` if it does not exist.
    async fn get_by_name(
        &self,
        object_type: ObjectType,
        tenant: &str,
        name: &str,
    ) -> Result<Option<Value>, BackendError>;

    /// Create an object and return the stored representation
    async fn create(
        &self,
        object_type: ObjectType,
        tenant: &str,
        body: Value,
    ) -> Result<Value, BackendError>;

    /// Replace an object and return the stored representation
    async fn update(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
        body: Value,
    ) -> Result<Value, BackendError>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<(), BackendError>;

    /// Check whether the controller is reachable and serving requests
    async fn check_readiness(&self) -> Result<bool, BackendError>;
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: BackendClient + ?Sized> BackendClient for Arc<T> {
    async fn list(&self, object_type: ObjectType, tenant: &str) -> Result<Vec<Value>, BackendError> {
        (**self).list(object_type, tenant).await
    }

    async fn get(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<Option<Value>, BackendError> {
        (**self).get(object_type, tenant, uuid).await
    }

    async fn get_by_name(
        &self,
        object_type: ObjectType,
        tenant: &str,
        name: &str,
    ) -> Result<Option<Value>, BackendError> {
        (**self).get_by_name(object_type, tenant, name).await
    }

    async fn create(
        &self,
        object_type: ObjectType,
        tenant: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        (**self).create(object_type, tenant, body).await
    }

    async fn update(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        (**self).update(object_type, tenant, uuid, body).await
    }

    async fn delete(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<(), BackendError> {
        (**self).delete(object_type, tenant, uuid).await
    }

    async fn check_readiness(&self) -> Result<bool, BackendError> {
        (**self).check_readiness().await
    }
}
