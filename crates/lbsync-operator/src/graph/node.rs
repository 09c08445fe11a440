//! Typed desired-state nodes
//!
//! A [`ModelGraph`] is rebuilt from cluster state on every ingestion event.
//! Each object node carries its own checksum (stored on the backend as
//! `cloud_config_cksum`); the graph checksum covers the full recursive content.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::keys::ModelKey;

/// Hex sha256 over the canonical JSON encoding of `value`
pub fn checksum_of<T: Serialize + ?Sized>(value: &T) -> String {
    // Plain structs with string keys always serialize
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Originating Service of a virtual service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkProfile {
    TcpProxy,
    UdpFastPath,
    SctpProxy,
}

impl NetworkProfile {
    /// Profile for a set of listener protocols: TCP wins, then UDP, then SCTP
    pub fn for_protocols<'a>(protocols: impl IntoIterator<Item = &'a str>) -> Self {
        let protocols: Vec<&str> = protocols.into_iter().collect();
        if protocols.contains(&"TCP") {
            Self::TcpProxy
        } else if protocols.contains(&"UDP") {
            Self::UdpFastPath
        } else if protocols.contains(&"SCTP") {
            Self::SctpProxy
        } else {
            Self::TcpProxy
        }
    }

    pub fn for_protocol(protocol: &str) -> Self {
        Self::for_protocols([protocol])
    }

    /// Name of the system profile on the backend
    pub fn profile_name(&self) -> &'static str {
        match self {
            Self::TcpProxy => "System-TCP-Proxy",
            Self::UdpFastPath => "System-UDP-Fast-Path",
            Self::SctpProxy => "System-SCTP-Proxy",
        }
    }
}

/// One listening port of a virtual service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VipNode {
    pub name: String,
    pub tenant: String,
    pub vrf: String,
    /// Static address request; auto-allocated when absent
    pub requested_address: Option<String>,
    pub fqdn: Option<String>,
}

impl VipNode {
    pub fn checksum(&self) -> String {
        checksum_of(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PoolServer {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolNode {
    pub name: String,
    pub tenant: String,
    pub vrf: String,
    /// Service port this pool backs
    pub port: u16,
    pub protocol: String,
    /// Sorted by address, then port
    pub servers: Vec<PoolServer>,
    /// Health monitor names, resolved against the cache at convergence
    pub health_monitors: Vec<String>,
}

impl PoolNode {
    pub fn checksum(&self) -> String {
        checksum_of(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L4RuleNode {
    pub port: u16,
    pub protocol: String,
    /// Name of the pool selected by this rule
    pub pool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L4PolicySetNode {
    pub name: String,
    pub tenant: String,
    pub rules: Vec<L4RuleNode>,
}

impl L4PolicySetNode {
    pub fn checksum(&self) -> String {
        checksum_of(self)
    }

    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.pool.as_str())
    }
}

/// Child of a virtual service, in convergence order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChildNode {
    Vip(VipNode),
    Pool(PoolNode),
    L4PolicySet(L4PolicySetNode),
}

impl ChildNode {
    pub fn name(&self) -> &str {
        match self {
            Self::Vip(node) => &node.name,
            Self::Pool(node) => &node.name,
            Self::L4PolicySet(node) => &node.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualServiceNode {
    pub name: String,
    pub tenant: String,
    pub vrf: String,
    pub service: ServiceRef,
    pub network_profile: NetworkProfile,
    pub listeners: Vec<Listener>,
    pub children: Vec<ChildNode>,
}

/// Fields of the virtual service object itself; children contribute only
/// their names so a pool membership change leaves the VS untouched
#[derive(Serialize)]
struct VirtualServiceDigest<'a> {
    name: &'a str,
    tenant: &'a str,
    vrf: &'a str,
    service: &'a ServiceRef,
    network_profile: NetworkProfile,
    listeners: &'a [Listener],
    children: Vec<&'a str>,
}

impl VirtualServiceNode {
    pub fn checksum(&self) -> String {
        checksum_of(&VirtualServiceDigest {
            name: &self.name,
            tenant: &self.tenant,
            vrf: &self.vrf,
            service: &self.service,
            network_profile: self.network_profile,
            listeners: &self.listeners,
            children: self.children.iter().map(ChildNode::name).collect(),
        })
    }

    pub fn vip(&self) -> Option<&VipNode> {
        self.children.iter().find_map(|child| match child {
            ChildNode::Vip(node) => Some(node),
            _ => None,
        })
    }

    pub fn pools(&self) -> impl Iterator<Item = &PoolNode> {
        self.children.iter().filter_map(|child| match child {
            ChildNode::Pool(node) => Some(node),
            _ => None,
        })
    }

    pub fn policy_sets(&self) -> impl Iterator<Item = &L4PolicySetNode> {
        self.children.iter().filter_map(|child| match child {
            ChildNode::L4PolicySet(node) => Some(node),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticRouteNode {
    pub route_id: String,
    /// Pod CIDR
    pub prefix: String,
    pub next_hop: String,
    /// Node the route points at
    pub node: String,
}

/// Static routes the operator maintains on a shared VRF context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VrfNode {
    pub name: String,
    pub tenant: String,
    pub routes: Vec<StaticRouteNode>,
}

impl VrfNode {
    pub fn checksum(&self) -> String {
        routes_checksum(
            self.routes
                .iter()
                .map(|r| (r.route_id.as_str(), r.prefix.as_str(), r.next_hop.as_str())),
        )
    }
}

/// Checksum over `(route_id, prefix, next_hop)` triples, computable from
/// both desired nodes and routes read back from the backend
pub fn routes_checksum<'a>(routes: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>) -> String {
    let routes: Vec<(&str, &str, &str)> = routes.into_iter().collect();
    checksum_of(&routes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RootNode {
    VirtualService(VirtualServiceNode),
    Vrf(VrfNode),
}

/// Desired state for one model key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelGraph {
    pub key: ModelKey,
    pub root: RootNode,
}

impl ModelGraph {
    pub fn virtual_service(node: VirtualServiceNode) -> Self {
        Self {
            key: ModelKey::new(node.tenant.clone(), node.name.clone()),
            root: RootNode::VirtualService(node),
        }
    }

    pub fn vrf(node: VrfNode) -> Self {
        Self {
            key: ModelKey::new(node.tenant.clone(), node.name.clone()),
            root: RootNode::Vrf(node),
        }
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn tenant(&self) -> &str {
        &self.key.tenant
    }

    pub fn is_vrf(&self) -> bool {
        matches!(self.root, RootNode::Vrf(_))
    }

    /// Checksum over the full recursive content
    pub fn checksum(&self) -> String {
        checksum_of(&self.root)
    }

    pub fn as_virtual_service(&self) -> Option<&VirtualServiceNode> {
        match &self.root {
            RootNode::VirtualService(node) => Some(node),
            RootNode::Vrf(_) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_vs(servers: &[(&str, u16)]) -> VirtualServiceNode {
        let pool = PoolNode {
            name: "prod--default-web-TCP-80".to_string(),
            tenant: "admin".to_string(),
            vrf: "global".to_string(),
            port: 80,
            protocol: "TCP".to_string(),
            servers: servers
                .iter()
                .map(|(ip, port)| PoolServer {
                    ip: ip.to_string(),
                    port: *port,
                })
                .collect(),
            health_monitors: vec![],
        };
        VirtualServiceNode {
            name: "prod--default-web".to_string(),
            tenant: "admin".to_string(),
            vrf: "global".to_string(),
            service: ServiceRef::new("default", "web"),
            network_profile: NetworkProfile::TcpProxy,
            listeners: vec![Listener {
                port: 80,
                protocol: "TCP".to_string(),
            }],
            children: vec![
                ChildNode::Vip(VipNode {
                    name: "prod--default-web".to_string(),
                    tenant: "admin".to_string(),
                    vrf: "global".to_string(),
                    requested_address: None,
                    fqdn: None,
                }),
                ChildNode::L4PolicySet(L4PolicySetNode {
                    name: "prod--default-web".to_string(),
                    tenant: "admin".to_string(),
                    rules: vec![L4RuleNode {
                        port: 80,
                        protocol: "TCP".to_string(),
                        pool: pool.name.clone(),
                    }],
                }),
                ChildNode::Pool(pool),
            ],
        }
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = ModelGraph::virtual_service(sample_vs(&[("10.0.0.1", 8080)]));
        let b = ModelGraph::virtual_service(sample_vs(&[("10.0.0.1", 8080)]));
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_graph_checksum_covers_children() {
        let a = ModelGraph::virtual_service(sample_vs(&[("10.0.0.1", 8080)]));
        let b = ModelGraph::virtual_service(sample_vs(&[("10.0.0.2", 8080)]));
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_vs_checksum_ignores_pool_members() {
        let a = sample_vs(&[("10.0.0.1", 8080)]);
        let b = sample_vs(&[("10.0.0.1", 8080), ("10.0.0.2", 8080)]);
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(
            a.pools().next().unwrap().checksum(),
            b.pools().next().unwrap().checksum()
        );
    }

    #[test]
    fn test_vs_checksum_tracks_child_names() {
        let a = sample_vs(&[]);
        let mut b = sample_vs(&[]);
        b.children.retain(|child| !matches!(child, ChildNode::L4PolicySet(_)));
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_child_accessors() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        assert_eq!(vs.vip().unwrap().name, "prod--default-web");
        assert_eq!(vs.pools().count(), 1);
        let policy = vs.policy_sets().next().unwrap();
        assert_eq!(policy.pool_names().collect::<Vec<_>>(), vec!["prod--default-web-TCP-80"]);
    }

    #[test]
    fn test_graph_key_from_root() {
        let graph = ModelGraph::vrf(VrfNode {
            name: "global".to_string(),
            tenant: "admin".to_string(),
            routes: vec![],
        });
        assert!(graph.is_vrf());
        assert_eq!(graph.key.to_string(), "admin/global");
        assert!(graph.as_virtual_service().is_none());
    }

    #[test]
    fn test_network_profile_selection() {
        assert_eq!(NetworkProfile::for_protocols(["UDP", "TCP"]), NetworkProfile::TcpProxy);
        assert_eq!(NetworkProfile::for_protocols(["UDP"]), NetworkProfile::UdpFastPath);
        assert_eq!(NetworkProfile::for_protocols(["SCTP"]), NetworkProfile::SctpProxy);
        assert_eq!(NetworkProfile::UdpFastPath.profile_name(), "System-UDP-Fast-Path");
    }

    #[test]
    fn test_service_ref_parse() {
        assert_eq!(ServiceRef::parse("default/web"), Some(ServiceRef::new("default", "web")));
        assert_eq!(ServiceRef::parse("default"), None);
        assert_eq!(ServiceRef::parse("a/b/c"), None);
        assert_eq!(ServiceRef::new("ns", "svc").to_string(), "ns/svc");
    }
}
