//! CRD and configuration types

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lbsync_common::{validate_cluster_name, validate_tenant_name, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid clusterName: {0}")]
    ClusterName(ValidationError),
    #[error("Invalid tenant: {0}")]
    Tenant(ValidationError),
    #[error("Invalid queue configuration: {0}")]
    Queues(String),
    #[error("Invalid fullSync configuration: {0}")]
    FullSync(String),
}

/// Reference to a Kubernetes Secret
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Backend controller connection settings
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Base URL of the controller REST API (e.g. `https://10.0.0.10`)
    pub endpoint: String,
    /// Secret holding `token` and optionally `ca.crt`
    pub credentials_secret_ref: SecretReference,
    /// Cloud the managed objects are placed in
    #[serde(default = "default_cloud_name")]
    pub cloud_name: String,
    /// API version sent with every request
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Client-side timeout for a single REST call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u32,
}

fn default_cloud_name() -> String {
    "Default-Cloud".to_string()
}

fn default_api_version() -> String {
    "22.1.3".to_string()
}

fn default_request_timeout() -> u32 {
    30
}

/// VRF / static route settings
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VrfConfig {
    /// VRF context the cluster's routes live in
    #[serde(default = "default_vrf_name")]
    pub name: String,
    /// Publish pod CIDR static routes for every node
    #[serde(default = "default_true")]
    pub static_routes: bool,
}

impl Default for VrfConfig {
    fn default() -> Self {
        Self {
            name: default_vrf_name(),
            static_routes: true,
        }
    }
}

fn default_vrf_name() -> String {
    "global".to_string()
}

fn default_true() -> bool {
    true
}

/// Work-queue sizing; each shard is drained by a single worker
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_shards")]
    pub ingestion_shards: usize,
    #[serde(default = "default_shards")]
    pub graph_shards: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ingestion_shards: default_shards(),
            graph_shards: default_shards(),
        }
    }
}

fn default_shards() -> usize {
    8
}

/// Retry tiers
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_fast_base_delay")]
    pub fast_base_delay_millis: u64,
    #[serde(default = "default_fast_max_delay")]
    pub fast_max_delay_seconds: u64,
    #[serde(default = "default_fast_max_attempts")]
    pub fast_max_attempts: u32,
    #[serde(default = "default_slow_interval")]
    pub slow_interval_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fast_base_delay_millis: default_fast_base_delay(),
            fast_max_delay_seconds: default_fast_max_delay(),
            fast_max_attempts: default_fast_max_attempts(),
            slow_interval_seconds: default_slow_interval(),
        }
    }
}

fn default_fast_base_delay() -> u64 {
    500
}

fn default_fast_max_delay() -> u64 {
    30
}

fn default_fast_max_attempts() -> u32 {
    10
}

fn default_slow_interval() -> u64 {
    120
}

/// Full sync cadence
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncConfig {
    /// Interval between periodic full syncs, 0 disables them
    #[serde(default = "default_full_sync_interval")]
    pub interval_seconds: u64,
    /// Upper bound on waiting for the VRF model before publishing the rest
    #[serde(default = "default_vrf_settle")]
    pub vrf_settle_seconds: u64,
    /// Upper bound on waiting for a queue to drain; the stale sweep is
    /// skipped when ingestion does not settle in time
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_full_sync_interval(),
            vrf_settle_seconds: default_vrf_settle(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

fn default_full_sync_interval() -> u64 {
    1800
}

fn default_vrf_settle() -> u64 {
    20
}

fn default_idle_timeout() -> u64 {
    300
}

/// Deletion confirmation polling
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeletionConfig {
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_millis: u64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_interval_millis: default_poll_interval(),
        }
    }
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval() -> u64 {
    500
}

fn default_tenant() -> String {
    "admin".to_string()
}

/// LbSyncConfig spec
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lbsync.io",
    version = "v1alpha1",
    kind = "LbSyncConfig",
    plural = "lbsyncconfigs",
    shortname = "lbc",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LbSyncConfigSpec {
    /// Prefix for every managed object; must be unique per backend
    pub cluster_name: String,
    /// Backend controller connection
    pub controller: ControllerConfig,
    /// Tenant used when a namespace has no mapping
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    /// Static namespace → tenant mapping
    #[serde(default)]
    pub namespace_tenants: BTreeMap<String, String>,
    #[serde(default)]
    pub vrf: VrfConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub full_sync: FullSyncConfig,
    #[serde(default)]
    pub deletion: DeletionConfig,
}

impl LbSyncConfigSpec {
    /// Check the values every other component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cluster_name(&self.cluster_name).map_err(ConfigError::ClusterName)?;
        validate_tenant_name(&self.default_tenant).map_err(ConfigError::Tenant)?;
        for tenant in self.namespace_tenants.values() {
            validate_tenant_name(tenant).map_err(ConfigError::Tenant)?;
        }
        if self.queues.ingestion_shards == 0 || self.queues.graph_shards == 0 {
            return Err(ConfigError::Queues("shard counts must be positive".to_string()));
        }
        if self.full_sync.idle_timeout_seconds == 0 {
            return Err(ConfigError::FullSync(
                "idleTimeoutSeconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.request_timeout_seconds as u64)
    }

    pub fn full_sync_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.full_sync.idle_timeout_seconds)
    }

    /// Full sync interval, `None` when the periodic pass is disabled
    pub fn full_sync_interval(&self) -> Option<Duration> {
        match self.full_sync.interval_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Annotations used by the operator
pub mod annotations {
    /// Namespace-level tenant override
    pub const TENANT: &str = "lbsync.io/tenant";
    /// Requested VIP address for a Service
    pub const LOAD_BALANCER_IP: &str = "lbsync.io/load-balancer-ip";
    /// Comma-separated health monitors attached to every pool of a Service
    pub const HEALTH_MONITORS: &str = "lbsync.io/health-monitors";
    /// Hostname published on the VIP
    pub const FQDN: &str = "lbsync.io/fqdn";
}
