//! Cluster resources to desired-state graphs
//!
//! The builder handles ingestion keys. Every key triggers a full rebuild of
//! the affected model from the reflector stores; the result replaces the
//! stored graph and the model key is published to the graph queue even when
//! the checksum did not change, so a stalled convergence gets another chance.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, Namespace, Node, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::reflector::{ObjectRef, Store};
use lbsync_common::{validate_ip_address, validate_object_name, NameBuilder, ValidationError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::node::{
    ChildNode, L4PolicySetNode, L4RuleNode, Listener, ModelGraph, NetworkProfile, PoolNode,
    PoolServer, ServiceRef, StaticRouteNode, VipNode, VirtualServiceNode, VrfNode,
};
use super::store::{GraphStore, SaveOutcome};
use crate::config::VrfConfig;
use crate::controllers::namespace::TenantResolver;
use crate::controllers::{is_load_balancer, validate_service, ServiceIntent, ServicePortSpec};
use crate::keys::{IngestionKey, KeyError, ModelKey};
use crate::leader::LeaderGate;
use crate::metrics;
use crate::status::{StatusWriter, SyncOutcome};
use crate::workqueue::{HandlerError, KeyHandler, WorkQueue};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Service has no ports")]
    NoPorts,

    #[error("invalid annotation {annotation}: {message}")]
    Annotation {
        annotation: &'static str,
        message: String,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Read access to the reflector stores
#[derive(Clone)]
pub struct ClusterView {
    pub services: Store<Service>,
    pub endpoints: Store<Endpoints>,
    pub nodes: Store<Node>,
    pub namespaces: Store<Namespace>,
}

impl ClusterView {
    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoints.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(&ObjectRef::new(name))
    }

    /// Nodes sorted by name
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes = self.nodes.state();
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        nodes
    }

    /// Ingestion keys for every resource with load-balancer intent, sorted
    pub fn ingestion_keys(&self) -> Vec<IngestionKey> {
        let mut keys: Vec<IngestionKey> = self
            .services
            .state()
            .iter()
            .filter(|svc| is_load_balancer(svc))
            .filter_map(|svc| {
                let namespace = svc.metadata.namespace.as_deref()?;
                let name = svc.metadata.name.as_deref()?;
                Some(IngestionKey::l4_service(namespace, name))
            })
            .collect();
        keys.sort();
        if let Some(name) = self.nodes().first().and_then(|node| node.metadata.name.clone()) {
            keys.push(IngestionKey::node(name));
        }
        keys
    }
}

/// Settings of the graph builder
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub names: NameBuilder,
    pub vrf: VrfConfig,
    /// Tenant owning the VRF context the static routes live in
    pub vrf_tenant: String,
}

pub struct GraphBuilder {
    view: ClusterView,
    tenants: TenantResolver,
    settings: BuilderSettings,
    store: Arc<GraphStore>,
    graph_queue: Arc<WorkQueue>,
    status: Arc<dyn StatusWriter>,
    leader: Arc<LeaderGate>,
}

impl GraphBuilder {
    pub fn new(
        view: ClusterView,
        tenants: TenantResolver,
        settings: BuilderSettings,
        store: Arc<GraphStore>,
        graph_queue: Arc<WorkQueue>,
        status: Arc<dyn StatusWriter>,
        leader: Arc<LeaderGate>,
    ) -> Self {
        Self {
            view,
            tenants,
            settings,
            store,
            graph_queue,
            status,
            leader,
        }
    }

    /// Key of the VRF model
    pub fn vrf_key(&self) -> ModelKey {
        ModelKey::new(self.settings.vrf_tenant.as_str(), self.settings.vrf.name.as_str())
    }

    fn publish(&self, key: &ModelKey) {
        self.graph_queue.add(key.to_string());
        metrics::set_graph_models(self.store.len());
    }

    /// Tombstone a model and publish it so the engine deletes its objects
    fn retire(&self, key: &ModelKey) {
        self.store.save(key, None);
        info!(model_key = %key, "Tombstoned model");
        self.publish(key);
    }

    /// Rebuild the model of one LoadBalancer Service
    pub async fn build_l4_service(&self, namespace: &str, name: &str) -> Result<(), BuildError> {
        let source = IngestionKey::l4_service(namespace, name);
        let previous = self.store.source_model(&source);

        let service = self.view.service(namespace, name).filter(|svc| is_load_balancer(svc));
        let Some(service) = service else {
            match previous {
                Some(previous) => {
                    self.store.unbind_source(&source);
                    self.retire(&previous);
                }
                None => debug!(key = %source, "No load-balancer intent"),
            }
            return Ok(());
        };

        let tenant = self.tenants.resolve(namespace);
        let intent = match validate_service(&service) {
            Ok(intent) => intent,
            Err(e) => {
                self.reject(namespace, name, &e).await;
                return Err(e);
            }
        };
        let node = match self.translate(namespace, name, &tenant, &intent) {
            Ok(node) => node,
            Err(e) => {
                self.reject(namespace, name, &e).await;
                return Err(e);
            }
        };

        let graph = ModelGraph::virtual_service(node);
        let key = graph.key.clone();
        if let Some(old) = self.store.bind_source(&source, &key) {
            info!(old = %old, new = %key, "Tenant changed, retiring old model");
            self.retire(&old);
        }
        match self.store.save(&key, Some(graph)) {
            SaveOutcome::Unchanged => debug!(model_key = %key, "Model unchanged"),
            outcome => info!(model_key = %key, ?outcome, "Saved model"),
        }
        self.publish(&key);
        Ok(())
    }

    async fn reject(&self, namespace: &str, name: &str, err: &BuildError) {
        error!(namespace, name, error = %err, "Service rejected, keeping previous model");
        metrics::record_validation_rejection();
        if !self.leader.is_leader() {
            return;
        }
        let service = ServiceRef::new(namespace, name);
        let outcome = SyncOutcome::Rejected {
            reason: err.to_string(),
        };
        if let Err(e) = self.status.write(&service, outcome).await {
            warn!(service = %service, error = %e, "Failed to update Service status");
        }
    }

    /// Translate a validated Service into its virtual service tree
    pub fn translate(
        &self,
        namespace: &str,
        name: &str,
        tenant: &str,
        intent: &ServiceIntent,
    ) -> Result<VirtualServiceNode, BuildError> {
        let names = &self.settings.names;
        let vrf = self.settings.vrf.name.clone();
        let vs_name = names.l4_vs(namespace, name);
        validate_object_name(&vs_name)?;

        let endpoints = self.view.endpoints(namespace, name);
        let subsets = endpoints
            .as_ref()
            .and_then(|ep| ep.subsets.as_deref())
            .unwrap_or_default();

        let mut pools = Vec::with_capacity(intent.ports.len());
        let mut rules = Vec::with_capacity(intent.ports.len());
        for port in &intent.ports {
            let pool_name = names.l4_pool(namespace, name, port.protocol, port.port);
            validate_object_name(&pool_name)?;
            rules.push(L4RuleNode {
                port: port.port,
                protocol: port.protocol.to_string(),
                pool: pool_name.clone(),
            });
            pools.push(PoolNode {
                name: pool_name,
                tenant: tenant.to_string(),
                vrf: vrf.clone(),
                port: port.port,
                protocol: port.protocol.to_string(),
                servers: pool_servers(port, intent.ports.len(), subsets),
                health_monitors: intent.health_monitors.clone(),
            });
        }

        let vip = VipNode {
            name: names.l4_vip(namespace, name),
            tenant: tenant.to_string(),
            vrf: vrf.clone(),
            requested_address: intent.requested_address.clone(),
            fqdn: intent.fqdn.clone(),
        };
        let policy_set = L4PolicySetNode {
            name: names.l4_policy_set(namespace, name),
            tenant: tenant.to_string(),
            rules,
        };

        let mut children = Vec::with_capacity(pools.len() + 2);
        children.push(ChildNode::Vip(vip));
        children.extend(pools.into_iter().map(ChildNode::Pool));
        children.push(ChildNode::L4PolicySet(policy_set));

        Ok(VirtualServiceNode {
            name: vs_name,
            tenant: tenant.to_string(),
            vrf,
            service: ServiceRef::new(namespace, name),
            network_profile: NetworkProfile::for_protocols(intent.ports.iter().map(|p| p.protocol)),
            listeners: intent
                .ports
                .iter()
                .map(|p| Listener {
                    port: p.port,
                    protocol: p.protocol.to_string(),
                })
                .collect(),
            children,
        })
    }

    /// Rebuild the VRF static routes from every Node
    pub fn build_vrf(&self) -> Result<(), BuildError> {
        if !self.settings.vrf.static_routes {
            debug!("Static routes disabled");
            return Ok(());
        }
        let node = self.vrf_node();
        let key = self.vrf_key();
        match self.store.save(&key, Some(ModelGraph::vrf(node))) {
            SaveOutcome::Unchanged => debug!(model_key = %key, "VRF model unchanged"),
            outcome => info!(model_key = %key, ?outcome, "Saved VRF model"),
        }
        self.publish(&key);
        Ok(())
    }

    /// Static routes to every pod CIDR via the owning node's InternalIP
    pub fn vrf_node(&self) -> VrfNode {
        let mut targets: Vec<(String, String, String)> = Vec::new();
        for node in self.view.nodes() {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let internal_ip = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
                .map(|a| a.address.clone());
            let Some(next_hop) = internal_ip else {
                debug!(node = %name, "Node has no InternalIP, skipping routes");
                continue;
            };
            if let Err(e) = validate_ip_address(&next_hop) {
                warn!(node = %name, error = %e, "Skipping node with invalid address");
                continue;
            }
            let spec = node.spec.as_ref();
            let mut cidrs: Vec<String> = spec
                .and_then(|s| s.pod_cidrs.clone())
                .filter(|cidrs| !cidrs.is_empty())
                .or_else(|| spec.and_then(|s| s.pod_cidr.clone()).map(|c| vec![c]))
                .unwrap_or_default();
            cidrs.sort();
            cidrs.dedup();
            for cidr in cidrs {
                targets.push((name.clone(), cidr, next_hop.clone()));
            }
        }
        targets.sort();

        let names = &self.settings.names;
        let routes = targets
            .into_iter()
            .enumerate()
            .map(|(index, (node, prefix, next_hop))| StaticRouteNode {
                route_id: names.static_route_id(index),
                prefix,
                next_hop,
                node,
            })
            .collect();
        VrfNode {
            name: self.settings.vrf.name.clone(),
            tenant: self.settings.vrf_tenant.clone(),
            routes,
        }
    }
}

/// Endpoint addresses serving one service port, sorted and deduplicated
fn pool_servers(port: &ServicePortSpec, port_count: usize, subsets: &[EndpointSubset]) -> Vec<PoolServer> {
    let mut servers = Vec::new();
    for subset in subsets {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let matched = ports.iter().find(|ep| {
            let protocol = ep.protocol.as_deref().unwrap_or("TCP");
            if protocol != port.protocol {
                return false;
            }
            match (&port.name, &ep.name) {
                (Some(want), Some(have)) => want == have,
                _ => match &port.target_port {
                    Some(IntOrString::Int(target)) => ep.port == *target,
                    _ => port_count == 1 && ports.len() == 1,
                },
            }
        });
        let Some(target) = matched.and_then(|ep| u16::try_from(ep.port).ok()) else {
            continue;
        };
        for address in subset.addresses.as_deref().unwrap_or_default() {
            servers.push(PoolServer {
                ip: address.ip.clone(),
                port: target,
            });
        }
    }
    servers.sort();
    servers.dedup();
    servers
}

#[async_trait]
impl KeyHandler for GraphBuilder {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        let ingestion_key = match IngestionKey::parse(key) {
            Ok(k) => k,
            Err(e) => {
                error!(error = %e, "Dropping malformed ingestion key");
                return Ok(());
            }
        };
        let result = match &ingestion_key {
            IngestionKey::L4Service { namespace, name } => self.build_l4_service(namespace, name).await,
            IngestionKey::Node { .. } => self.build_vrf(),
        };
        // Rejections are final until the resource changes
        if let Err(e) = result {
            debug!(error = %e, "Build rejected");
        }
        Ok(())
    }
}
