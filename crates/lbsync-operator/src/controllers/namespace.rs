//! Namespace watcher and tenant resolution

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use lbsync_common::validate_tenant_name;
use tracing::warn;

use super::{watch, Dispatcher, ResourceChange};
use crate::config::annotations;

/// Maps namespaces to backend tenants
///
/// Precedence: the namespace's `lbsync.io/tenant` annotation, then the
/// configured `namespaceTenants` entry, then the default tenant.
#[derive(Clone)]
pub struct TenantResolver {
    namespaces: Store<Namespace>,
    mapping: BTreeMap<String, String>,
    default_tenant: String,
}

impl TenantResolver {
    pub fn new(
        namespaces: Store<Namespace>,
        mapping: BTreeMap<String, String>,
        default_tenant: String,
    ) -> Self {
        Self {
            namespaces,
            mapping,
            default_tenant,
        }
    }

    pub fn resolve(&self, namespace: &str) -> String {
        let annotated = self
            .namespaces
            .get(&ObjectRef::new(namespace))
            .and_then(|ns| {
                ns.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(annotations::TENANT))
                    .map(|t| t.trim().to_string())
            })
            .filter(|t| !t.is_empty());
        if let Some(tenant) = annotated {
            match validate_tenant_name(&tenant) {
                Ok(()) => return tenant,
                Err(e) => warn!(namespace, error = %e, "Ignoring invalid tenant annotation"),
            }
        }
        self.mapping
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| self.default_tenant.clone())
    }
}

fn namespace_change(namespace: &Namespace) -> Option<ResourceChange> {
    Some(ResourceChange::Namespace {
        name: namespace.metadata.name.clone()?,
    })
}

pub async fn run(client: Client, writer: Writer<Namespace>, dispatcher: Arc<Dispatcher>) {
    watch(Api::<Namespace>::all(client), writer, dispatcher, namespace_change).await;
}
