//! Desired nodes to backend request bodies
//!
//! References between objects are by uuid, so a body can only be rendered
//! once the objects it points at exist in the cache.

use serde_json::Value;

use super::ConvergeError;
use crate::backend::models::{
    self, DnsInfo, IpAddr, L4ConnectionPolicy, L4Policy, L4Rule, L4RuleAction, L4RuleMatch,
    L4RulePorts, L4RuleProtocol, L4SelectPool, Marker, Server, ServiceMetadata, Vip,
};
use crate::backend::ObjectType;
use crate::cache::BackendCache;
use crate::graph::{L4PolicySetNode, NetworkProfile, PoolNode, VipNode, VirtualServiceNode};
use crate::keys::ObjectKey;

const APPLICATION_PROFILE: &str = "System-L4-Application";

/// Context shared by all renderers
pub struct RenderContext<'a> {
    pub cache: &'a BackendCache,
    pub cluster: &'a str,
    /// Tenant searched for shared objects (VRF contexts, health monitors)
    /// not found in the object's own tenant
    pub default_tenant: &'a str,
}

impl RenderContext<'_> {
    fn markers(&self, vs: &VirtualServiceNode) -> Vec<Marker> {
        vec![
            Marker::new("clustername", self.cluster),
            Marker::new("Namespace", &vs.service.namespace),
            Marker::new("ServiceName", &vs.service.name),
        ]
    }

    fn vrf_ref(&self, tenant: &str, vrf: &str) -> Option<String> {
        self.cache
            .vrfs
            .get_in(tenant, self.default_tenant, vrf)
            .map(|entry| ObjectType::VrfContext.reference(&entry.uuid))
    }

    /// Reference to a child that must already exist
    fn dependency(
        &self,
        object_type: ObjectType,
        tenant: &str,
        name: &str,
    ) -> Result<String, ConvergeError> {
        let key = ObjectKey::new(tenant, name);
        let uuid = match object_type {
            ObjectType::VsVip => self.cache.vips.get(&key).map(|e| e.uuid),
            ObjectType::Pool => self.cache.pools.get(&key).map(|e| e.uuid),
            ObjectType::L4PolicySet => self.cache.policy_sets.get(&key).map(|e| e.uuid),
            _ => None,
        };
        uuid.filter(|uuid| !uuid.is_empty())
            .map(|uuid| object_type.reference(&uuid))
            .ok_or_else(|| ConvergeError::DependencyMissing {
                object_type,
                name: name.to_string(),
            })
    }
}

fn profile_ref(profile: NetworkProfile) -> String {
    format!("/api/networkprofile/?name={}", profile.profile_name())
}

fn encode<T: serde::Serialize>(object_type: ObjectType, object: &T) -> Result<Value, ConvergeError> {
    models::encode(object_type, object).map_err(|e| ConvergeError::InvalidResponse {
        object_type,
        message: e.to_string(),
    })
}

pub fn render_vip(
    ctx: &RenderContext<'_>,
    vs: &VirtualServiceNode,
    node: &VipNode,
) -> Result<Value, ConvergeError> {
    let vip = models::VsVip {
        name: node.name.clone(),
        cloud_config_cksum: node.checksum(),
        vrf_context_ref: ctx.vrf_ref(&node.tenant, &node.vrf),
        vip: vec![Vip {
            vip_id: "0".to_string(),
            auto_allocate_ip: node.requested_address.is_none(),
            ip_address: node.requested_address.as_deref().map(IpAddr::new),
        }],
        dns_info: node
            .fqdn
            .iter()
            .map(|fqdn| DnsInfo { fqdn: fqdn.clone() })
            .collect(),
        markers: ctx.markers(vs),
        ..Default::default()
    };
    encode(ObjectType::VsVip, &vip)
}

pub fn render_pool(
    ctx: &RenderContext<'_>,
    vs: &VirtualServiceNode,
    node: &PoolNode,
) -> Result<Value, ConvergeError> {
    let health_monitor_refs = node
        .health_monitors
        .iter()
        .map(|name| {
            ctx.cache
                .health_monitors
                .get_in(&node.tenant, ctx.default_tenant, name)
                .map(|entry| ObjectType::HealthMonitor.reference(&entry.uuid))
                .ok_or_else(|| ConvergeError::MissingReference {
                    object_type: ObjectType::HealthMonitor,
                    name: name.clone(),
                    owner: node.name.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pool = models::Pool {
        name: node.name.clone(),
        cloud_config_cksum: node.checksum(),
        vrf_ref: ctx.vrf_ref(&node.tenant, &node.vrf),
        default_server_port: node.servers.first().map(|s| s.port).unwrap_or(node.port),
        servers: node
            .servers
            .iter()
            .map(|server| Server {
                ip: IpAddr::new(&server.ip),
                port: server.port,
            })
            .collect(),
        health_monitor_refs,
        markers: ctx.markers(vs),
        ..Default::default()
    };
    encode(ObjectType::Pool, &pool)
}

pub fn render_policy_set(
    ctx: &RenderContext<'_>,
    vs: &VirtualServiceNode,
    node: &L4PolicySetNode,
) -> Result<Value, ConvergeError> {
    let rules = node
        .rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            let pool_ref = ctx.dependency(ObjectType::Pool, &node.tenant, &rule.pool)?;
            Ok(L4Rule {
                name: format!("rule-{}-{}", rule.protocol, rule.port),
                index: index as u32,
                rule_match: L4RuleMatch {
                    port: L4RulePorts {
                        match_criteria: "IS_IN".to_string(),
                        ports: vec![rule.port],
                    },
                    protocol: L4RuleProtocol {
                        match_criteria: "IS_IN".to_string(),
                        protocol: format!("PROTOCOL_{}", rule.protocol),
                    },
                },
                action: L4RuleAction {
                    select_pool: L4SelectPool {
                        action_type: "L4_RULE_ACTION_SELECT_POOL".to_string(),
                        pool_ref,
                    },
                },
            })
        })
        .collect::<Result<Vec<_>, ConvergeError>>()?;

    let policy = models::L4PolicySet {
        name: node.name.clone(),
        cloud_config_cksum: node.checksum(),
        l4_connection_policy: L4ConnectionPolicy { rules },
        markers: ctx.markers(vs),
        ..Default::default()
    };
    encode(ObjectType::L4PolicySet, &policy)
}

pub fn render_virtual_service(
    ctx: &RenderContext<'_>,
    vs: &VirtualServiceNode,
) -> Result<Value, ConvergeError> {
    let vsvip_ref = match vs.vip() {
        Some(vip) => Some(ctx.dependency(ObjectType::VsVip, &vs.tenant, &vip.name)?),
        None => None,
    };
    let l4_policies = vs
        .policy_sets()
        .enumerate()
        .map(|(index, policy)| {
            Ok(L4Policy {
                l4_policy_set_ref: ctx.dependency(ObjectType::L4PolicySet, &vs.tenant, &policy.name)?,
                index: index as u32,
            })
        })
        .collect::<Result<Vec<_>, ConvergeError>>()?;

    let services = vs
        .listeners
        .iter()
        .map(|listener| {
            let own = NetworkProfile::for_protocol(&listener.protocol);
            models::Service {
                port: listener.port,
                // Mixed TCP/UDP services listen for UDP on the fast path
                override_network_profile_ref: (own != vs.network_profile).then(|| profile_ref(own)),
            }
        })
        .collect();

    let metadata = ServiceMetadata {
        namespace_svc_name: vec![vs.service.to_string()],
    };
    let service_metadata = serde_json::to_string(&metadata).map_err(|e| {
        ConvergeError::InvalidResponse {
            object_type: ObjectType::VirtualService,
            message: e.to_string(),
        }
    })?;

    let virtual_service = models::VirtualService {
        name: vs.name.clone(),
        cloud_config_cksum: vs.checksum(),
        vsvip_ref,
        vrf_context_ref: ctx.vrf_ref(&vs.tenant, &vs.vrf),
        network_profile_ref: Some(profile_ref(vs.network_profile)),
        application_profile_ref: Some(format!("/api/applicationprofile/?name={APPLICATION_PROFILE}")),
        services,
        l4_policies: Some(l4_policies),
        service_metadata: Some(service_metadata),
        markers: ctx.markers(vs),
        ..Default::default()
    };
    encode(ObjectType::VirtualService, &virtual_service)
}
