//! Cluster watchers and the ingestion dispatcher
//!
//! Each watcher feeds a reflector store (read by the graph builder) and turns
//! every touched object into a [`ResourceChange`]. The [`Dispatcher`] maps
//! changes to ingestion keys.

pub mod namespace;
pub mod node;
pub mod service;

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use lbsync_common::{validate_hostname, validate_ip_address, validate_port, validate_protocol};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::annotations;
use crate::graph::{BuildError, ClusterView, GraphStore};
use crate::keys::IngestionKey;
use crate::workqueue::WorkQueue;

/// A watched object was created, updated or deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    Service { namespace: String, name: String },
    Endpoints { namespace: String, name: String },
    Node { name: String },
    Namespace { name: String },
}

/// Turns resource changes into ingestion keys
pub struct Dispatcher {
    view: ClusterView,
    store: Arc<GraphStore>,
    ingestion_queue: Arc<WorkQueue>,
}

impl Dispatcher {
    pub fn new(view: ClusterView, store: Arc<GraphStore>, ingestion_queue: Arc<WorkQueue>) -> Self {
        Self {
            view,
            store,
            ingestion_queue,
        }
    }

    pub fn dispatch(&self, change: ResourceChange) {
        match change {
            ResourceChange::Service { namespace, name }
            | ResourceChange::Endpoints { namespace, name } => {
                let key = IngestionKey::l4_service(&namespace, &name);
                let intent = self
                    .view
                    .service(&namespace, &name)
                    .is_some_and(|svc| is_load_balancer(&svc));
                // A model that exists must see the change that removes its intent
                if intent || self.store.source_model(&key).is_some() {
                    self.enqueue(key);
                }
            }
            ResourceChange::Node { name } => self.enqueue(IngestionKey::node(name)),
            ResourceChange::Namespace { name } => {
                let sources = self.store.sources_in_namespace(&name);
                debug!(namespace = %name, count = sources.len(), "Re-enqueueing namespace sources");
                for key in sources {
                    self.enqueue(key);
                }
            }
        }
    }

    fn enqueue(&self, key: IngestionKey) {
        if self.ingestion_queue.add(key.to_string()) {
            debug!(key = %key, "Enqueued ingestion key");
        }
    }
}

/// Whether a Service asks for a load balancer
pub fn is_load_balancer(service: &Service) -> bool {
    service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
}

/// One validated service port
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePortSpec {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: &'static str,
    pub target_port: Option<IntOrString>,
}

/// Validated load-balancer request of a Service
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceIntent {
    pub ports: Vec<ServicePortSpec>,
    pub requested_address: Option<String>,
    pub fqdn: Option<String>,
    pub health_monitors: Vec<String>,
}

fn annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Accept or reject a Service before any graph is built
pub fn validate_service(service: &Service) -> Result<ServiceIntent, BuildError> {
    let spec_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();
    if spec_ports.is_empty() {
        return Err(BuildError::NoPorts);
    }
    let mut ports = Vec::with_capacity(spec_ports.len());
    for port in spec_ports {
        ports.push(ServicePortSpec {
            name: port.name.clone().filter(|n| !n.is_empty()),
            port: validate_port(port.port)?,
            protocol: validate_protocol(port.protocol.as_deref().unwrap_or_default())?,
            target_port: port.target_port.clone(),
        });
    }

    let requested = annotation(service, annotations::LOAD_BALANCER_IP).or_else(|| {
        service
            .spec
            .as_ref()
            .and_then(|s| s.load_balancer_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    });
    let requested_address = match requested {
        Some(ip) => Some(validate_ip_address(ip)?.to_string()),
        None => None,
    };

    let fqdn = match annotation(service, annotations::FQDN) {
        Some(host) => Some(validate_hostname(host)?),
        None => None,
    };

    let mut seen = HashSet::new();
    let health_monitors: Vec<String> = annotation(service, annotations::HEALTH_MONITORS)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty() && seen.insert(*name))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if health_monitors.iter().any(|name| name.contains('/')) {
        return Err(BuildError::Annotation {
            annotation: annotations::HEALTH_MONITORS,
            message: "health monitor names cannot contain '/'".to_string(),
        });
    }

    Ok(ServiceIntent {
        ports,
        requested_address,
        fqdn,
        health_monitors,
    })
}

/// Watch `api` into `writer`, dispatching a change for every touched object
pub async fn watch<K, F>(api: Api<K>, writer: Writer<K>, dispatcher: Arc<Dispatcher>, to_change: F)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    F: Fn(&K) -> Option<ResourceChange>,
{
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects();
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(object) => {
                if let Some(change) = to_change(&object) {
                    dispatcher.dispatch(change);
                }
            }
            Err(e) => warn!(error = %e, "Watch stream error"),
        }
    }
}
