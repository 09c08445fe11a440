//! Service status write-back
//!
//! After a virtual service converges, the backend-assigned address is written
//! to the Service's `status.loadBalancer.ingress` together with a
//! `LoadBalancerSynced` condition. Rejections only update the condition.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::graph::ServiceRef;

/// Condition type owned by the operator
pub const SYNCED_CONDITION: &str = "LoadBalancerSynced";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result of handling a Service, as reported on its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Accepted { addresses: Vec<String> },
    Rejected { reason: String },
}

/// Kubernetes-style condition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False"
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn synced(success: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: SYNCED_CONDITION.to_string(),
            status: if success { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    fn from_outcome(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Accepted { .. } => {
                Self::synced(true, "Accepted", "Load balancer configured")
            }
            SyncOutcome::Rejected { reason } => Self::synced(false, "Rejected", reason),
        }
    }
}

/// Replace our condition in `existing`, keeping the previous transition time
/// when the status did not flip
pub fn merge_conditions(existing: &[Condition], mut condition: Condition) -> Vec<Condition> {
    let mut merged: Vec<Condition> = Vec::with_capacity(existing.len() + 1);
    for current in existing {
        if current.type_ == condition.type_ {
            if current.status == condition.status {
                condition.last_transition_time = current.last_transition_time.clone();
            }
        } else {
            merged.push(current.clone());
        }
    }
    merged.push(condition);
    merged
}

/// Build the status merge patch for an outcome
pub fn status_patch(existing: &[Condition], outcome: &SyncOutcome) -> serde_json::Value {
    let conditions = merge_conditions(existing, Condition::from_outcome(outcome));
    match outcome {
        SyncOutcome::Accepted { addresses } => {
            let ingress: Vec<serde_json::Value> = addresses
                .iter()
                .map(|ip| serde_json::json!({ "ip": ip }))
                .collect();
            serde_json::json!({
                "status": {
                    "loadBalancer": { "ingress": ingress },
                    "conditions": conditions,
                }
            })
        }
        SyncOutcome::Rejected { .. } => serde_json::json!({
            "status": { "conditions": conditions }
        }),
    }
}

/// Writes sync outcomes back to Services
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, service: &ServiceRef, outcome: SyncOutcome) -> Result<(), StatusError>;
}

/// Status writer backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    #[instrument(skip(self, outcome), fields(service = %service))]
    async fn write(&self, service: &ServiceRef, outcome: SyncOutcome) -> Result<(), StatusError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);

        // A Service deleted in the meantime has nothing to report on
        let Some(current) = api.get_opt(&service.name).await? else {
            debug!("Service gone, skipping status update");
            return Ok(());
        };
        let existing: Vec<Condition> = current
            .status
            .and_then(|status| status.conditions)
            .unwrap_or_default()
            .into_iter()
            .map(|c| Condition {
                type_: c.type_,
                status: c.status,
                last_transition_time: c.last_transition_time.0.to_rfc3339(),
                reason: c.reason,
                message: c.message,
            })
            .collect();

        let patch = status_patch(&existing, &outcome);
        api.patch_status(&service.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Updated Service status");
        Ok(())
    }
}
