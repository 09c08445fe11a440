//! Wire representations of backend objects
//!
//! Only the fields the operator reads or writes are modelled. Unknown fields
//! returned by the backend are ignored on read; objects we do not own (VRF
//! contexts) are edited as raw JSON so foreign fields survive a PUT.

use serde::{Deserialize, Serialize};

use super::{BackendError, ObjectType};

/// Key/value label attached to managed objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Marker {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            values: vec![value.to_string()],
        }
    }
}

/// Address as encoded by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddr {
    pub addr: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl IpAddr {
    pub fn new(addr: &str) -> Self {
        let kind = if addr.contains(':') { "V6" } else { "V4" };
        Self {
            addr: addr.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Address prefix as encoded by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPrefix {
    pub ip_addr: IpAddr,
    pub mask: u8,
}

impl IpPrefix {
    /// Parse `10.244.1.0/24`
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, mask) = cidr.split_once('/')?;
        let mask = mask.parse().ok()?;
        Some(Self {
            ip_addr: IpAddr::new(addr),
            mask,
        })
    }

    pub fn to_cidr(&self) -> String {
        format!("{}/{}", self.ip_addr.addr, self.mask)
    }
}

/// Listener port on a virtual service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub port: u16,
    /// Set for UDP-only listeners on a mixed-protocol service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_network_profile_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_ref: Option<String>,
    #[serde(default)]
    pub cloud_config_cksum: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsvip_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_context_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_profile_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_profile_ref: Option<String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4_policies: Option<Vec<L4Policy>>,
    /// JSON-encoded [`ServiceMetadata`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_metadata: Option<String>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Policy {
    pub l4_policy_set_ref: String,
    pub index: u32,
}

/// Originating Service, stored on the virtual service so status can be
/// restored after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(default)]
    pub namespace_svc_name: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VsVip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_ref: Option<String>,
    #[serde(default)]
    pub cloud_config_cksum: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_context_ref: Option<String>,
    #[serde(default)]
    pub vip: Vec<Vip>,
    #[serde(default)]
    pub dns_info: Vec<DnsInfo>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vip {
    pub vip_id: String,
    #[serde(default)]
    pub auto_allocate_ip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsInfo {
    pub fqdn: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_ref: Option<String>,
    #[serde(default)]
    pub cloud_config_cksum: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_ref: Option<String>,
    #[serde(default)]
    pub default_server_port: u16,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub health_monitor_refs: Vec<String>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct L4PolicySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
    #[serde(default)]
    pub cloud_config_cksum: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub l4_connection_policy: L4ConnectionPolicy,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4ConnectionPolicy {
    #[serde(default)]
    pub rules: Vec<L4Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Rule {
    pub name: String,
    pub index: u32,
    #[serde(rename = "match")]
    pub rule_match: L4RuleMatch,
    pub action: L4RuleAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4RuleMatch {
    pub port: L4RulePorts,
    pub protocol: L4RuleProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4RulePorts {
    pub match_criteria: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4RuleProtocol {
    pub match_criteria: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4RuleAction {
    pub select_pool: L4SelectPool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4SelectPool {
    pub action_type: String,
    pub pool_ref: String,
}

/// VRF context; only the fields touched by static route sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VrfContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub route_id: String,
    pub prefix: IpPrefix,
    pub next_hop: IpAddr,
}

/// Health monitor; read-only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<String>,
}

/// Paginated collection response
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Error body returned with non-success statuses
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: Option<String>,
}

/// Tenant name from a `tenant_ref` such as `https://ctrl/api/tenant/t-uuid#admin`
///
/// Falls back to the last path segment when the reference carries no name.
pub fn tenant_from_ref(tenant_ref: Option<&str>) -> Option<String> {
    let reference = tenant_ref?;
    if let Some((_, name)) = reference.rsplit_once('#') {
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    reference
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Deserialize a JSON value into a wire struct
pub fn decode<T: serde::de::DeserializeOwned>(
    object_type: ObjectType,
    value: serde_json::Value,
) -> Result<T, BackendError> {
    serde_json::from_value(value)
        .map_err(|e| BackendError::Parse(format!("invalid {object_type} object: {e}")))
}

/// Serialize a wire struct into a JSON body
pub fn encode<T: Serialize>(object_type: ObjectType, object: &T) -> Result<serde_json::Value, BackendError> {
    serde_json::to_value(object)
        .map_err(|e| BackendError::Parse(format!("failed to encode {object_type}: {e}")))
}
