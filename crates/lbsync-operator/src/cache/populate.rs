//! Loading the cache from the backend

use std::collections::{BTreeMap, HashMap, HashSet};

use lbsync_common::NameBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{
    BackendCache, CacheError, HealthMonitorCacheEntry, PolicySetCacheEntry, PoolCacheEntry,
    VipCacheEntry, VrfCacheEntry, VsCacheEntry, DUMMY_VS_NAME,
};
use crate::backend::models::{self, tenant_from_ref, ServiceMetadata};
use crate::backend::{BackendClient, ObjectType, ALL_TENANTS};
use crate::graph::{routes_checksum, ServiceRef};
use crate::keys::ObjectKey;

/// Object counts loaded by [`BackendCache::populate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateSummary {
    pub virtual_services: usize,
    pub vips: usize,
    pub pools: usize,
    pub policy_sets: usize,
    pub vrfs: usize,
    pub health_monitors: usize,
    /// Owned children referenced by no virtual service
    pub orphans: usize,
}

async fn list(client: &dyn BackendClient, object_type: ObjectType) -> Result<Vec<Value>, CacheError> {
    client
        .list(object_type, ALL_TENANTS)
        .await
        .map_err(|source| CacheError::Backend {
            object_type,
            source,
        })
}

/// Decode listed objects, skipping (and logging) malformed ones
fn decode_all<T: DeserializeOwned>(object_type: ObjectType, values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match models::decode(object_type, value) {
            Ok(object) => Some(object),
            Err(e) => {
                warn!(object_type = %object_type, error = %e, "Skipping malformed backend object");
                None
            }
        })
        .collect()
}

fn tenant_or(tenant_ref: Option<&str>, default_tenant: &str) -> String {
    tenant_from_ref(tenant_ref).unwrap_or_else(|| default_tenant.to_string())
}

fn ref_uuid(reference: &str) -> Option<String> {
    ObjectType::uuid_from_reference(reference).map(str::to_string)
}

/// Owned objects with a uuid, keyed by `(tenant, name)`, plus a uuid -> key index
struct Loaded<E> {
    entries: HashMap<ObjectKey, E>,
    by_uuid: HashMap<String, ObjectKey>,
}

impl<E> Loaded<E> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_uuid: HashMap::new(),
        }
    }

    fn insert(&mut self, key: ObjectKey, uuid: String, entry: E) {
        self.by_uuid.insert(uuid, key.clone());
        self.entries.insert(key, entry);
    }

    fn name_of(&self, uuid: &str) -> Option<String> {
        self.by_uuid.get(uuid).map(|key| key.name.clone())
    }
}

impl BackendCache {
    /// Load every owned object from the backend, replacing the cache content
    ///
    /// Failure is fatal at boot: the cache would not reflect the backend and
    /// the stale sweep could not run safely.
    #[instrument(skip_all, fields(cluster = %names.cluster()))]
    pub async fn populate(
        &self,
        client: &dyn BackendClient,
        names: &NameBuilder,
        default_tenant: &str,
    ) -> Result<PopulateSummary, CacheError> {
        let mut vips = Loaded::new();
        for vip in decode_all::<models::VsVip>(ObjectType::VsVip, list(client, ObjectType::VsVip).await?) {
            let Some(uuid) = vip.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            if !names.owns(&vip.name) {
                continue;
            }
            let tenant = tenant_or(vip.tenant_ref.as_deref(), default_tenant);
            let entry = VipCacheEntry {
                name: vip.name.clone(),
                tenant: tenant.clone(),
                uuid: uuid.clone(),
                checksum: vip.cloud_config_cksum.clone(),
                addresses: vip
                    .vip
                    .iter()
                    .filter_map(|v| v.ip_address.as_ref().map(|ip| ip.addr.clone()))
                    .collect(),
            };
            vips.insert(ObjectKey::new(tenant, vip.name), uuid, entry);
        }

        let mut pools = Loaded::new();
        for pool in decode_all::<models::Pool>(ObjectType::Pool, list(client, ObjectType::Pool).await?) {
            let Some(uuid) = pool.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            if !names.owns(&pool.name) {
                continue;
            }
            let tenant = tenant_or(pool.tenant_ref.as_deref(), default_tenant);
            let entry = PoolCacheEntry {
                name: pool.name.clone(),
                tenant: tenant.clone(),
                uuid: uuid.clone(),
                checksum: pool.cloud_config_cksum.clone(),
                server_count: pool.servers.len(),
            };
            pools.insert(ObjectKey::new(tenant, pool.name), uuid, entry);
        }

        let mut policy_sets = Loaded::new();
        let policy_values = list(client, ObjectType::L4PolicySet).await?;
        for policy in decode_all::<models::L4PolicySet>(ObjectType::L4PolicySet, policy_values) {
            let Some(uuid) = policy.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            if !names.owns(&policy.name) {
                continue;
            }
            let tenant = tenant_or(policy.tenant_ref.as_deref(), default_tenant);
            let pool_refs = policy
                .l4_connection_policy
                .rules
                .iter()
                .filter_map(|rule| ref_uuid(&rule.action.select_pool.pool_ref))
                .filter_map(|uuid| pools.name_of(&uuid))
                .collect();
            let entry = PolicySetCacheEntry {
                name: policy.name.clone(),
                tenant: tenant.clone(),
                uuid: uuid.clone(),
                checksum: policy.cloud_config_cksum.clone(),
                pool_refs,
            };
            policy_sets.insert(ObjectKey::new(tenant, policy.name), uuid, entry);
        }

        let mut virtual_services = HashMap::new();
        let vs_values = list(client, ObjectType::VirtualService).await?;
        for vs in decode_all::<models::VirtualService>(ObjectType::VirtualService, vs_values) {
            let Some(uuid) = vs.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            if !names.owns(&vs.name) {
                continue;
            }
            let tenant = tenant_or(vs.tenant_ref.as_deref(), default_tenant);
            let vip_refs: Vec<String> = vs
                .vsvip_ref
                .as_deref()
                .and_then(ref_uuid)
                .and_then(|uuid| vips.name_of(&uuid))
                .into_iter()
                .collect();
            let policy_set_refs: Vec<String> = vs
                .l4_policies
                .iter()
                .flatten()
                .filter_map(|policy| ref_uuid(&policy.l4_policy_set_ref))
                .filter_map(|uuid| policy_sets.name_of(&uuid))
                .collect();
            let mut pool_refs: Vec<String> = Vec::new();
            for policy_name in &policy_set_refs {
                let key = ObjectKey::new(tenant.clone(), policy_name.clone());
                if let Some(policy) = policy_sets.entries.get(&key) {
                    for pool in &policy.pool_refs {
                        if !pool_refs.contains(pool) {
                            pool_refs.push(pool.clone());
                        }
                    }
                }
            }
            let service = vs
                .service_metadata
                .as_deref()
                .and_then(|raw| serde_json::from_str::<ServiceMetadata>(raw).ok())
                .and_then(|meta| meta.namespace_svc_name.first().and_then(|s| ServiceRef::parse(s)));

            let entry = VsCacheEntry {
                name: vs.name.clone(),
                tenant: tenant.clone(),
                uuid,
                checksum: vs.cloud_config_cksum.clone(),
                vip_refs,
                pool_refs,
                policy_set_refs,
                service,
            };
            virtual_services.insert(ObjectKey::new(tenant, vs.name), entry);
        }

        // Children no virtual service points at, grouped per tenant into a
        // cache-only marker the boot full sync tears down
        let referenced: HashSet<(String, String)> = virtual_services
            .values()
            .flat_map(|vs: &VsCacheEntry| {
                vs.vip_refs
                    .iter()
                    .chain(&vs.pool_refs)
                    .chain(&vs.policy_set_refs)
                    .map(move |name| (vs.tenant.clone(), name.clone()))
            })
            .collect();
        let mut dummies: BTreeMap<String, VsCacheEntry> = BTreeMap::new();
        let mut orphans = 0;
        let mut orphan = |tenant: &str, name: &str, pick: fn(&mut VsCacheEntry) -> &mut Vec<String>| {
            if referenced.contains(&(tenant.to_string(), name.to_string())) {
                return;
            }
            let dummy = dummies.entry(tenant.to_string()).or_insert_with(|| VsCacheEntry {
                name: DUMMY_VS_NAME.to_string(),
                tenant: tenant.to_string(),
                ..Default::default()
            });
            pick(dummy).push(name.to_string());
            orphans += 1;
        };
        for key in vips.entries.keys() {
            orphan(&key.tenant, &key.name, |vs| &mut vs.vip_refs);
        }
        for key in pools.entries.keys() {
            orphan(&key.tenant, &key.name, |vs| &mut vs.pool_refs);
        }
        for key in policy_sets.entries.keys() {
            orphan(&key.tenant, &key.name, |vs| &mut vs.policy_set_refs);
        }
        for (tenant, mut dummy) in dummies {
            dummy.vip_refs.sort();
            dummy.pool_refs.sort();
            dummy.policy_set_refs.sort();
            virtual_services.insert(ObjectKey::new(tenant, DUMMY_VS_NAME), dummy);
        }

        let mut summary = PopulateSummary {
            virtual_services: virtual_services.len(),
            vips: vips.entries.len(),
            pools: pools.entries.len(),
            policy_sets: policy_sets.entries.len(),
            orphans,
            ..Default::default()
        };

        self.vips.replace_all(vips.entries);
        self.pools.replace_all(pools.entries);
        self.policy_sets.replace_all(policy_sets.entries);
        self.virtual_services.replace_all(virtual_services);

        self.refresh(client, names, default_tenant).await?;
        summary.vrfs = self.vrfs.len();
        summary.health_monitors = self.health_monitors.len();
        self.update_metrics();

        info!(
            virtual_services = summary.virtual_services,
            vips = summary.vips,
            pools = summary.pools,
            policy_sets = summary.policy_sets,
            vrfs = summary.vrfs,
            health_monitors = summary.health_monitors,
            orphans = summary.orphans,
            "Populated backend cache"
        );
        Ok(summary)
    }

    /// Re-read cluster-level objects (VRF contexts, health monitors)
    ///
    /// Entries for owned objects are untouched. On error the previous
    /// content is kept.
    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        client: &dyn BackendClient,
        names: &NameBuilder,
        default_tenant: &str,
    ) -> Result<(), CacheError> {
        let vrf_values = list(client, ObjectType::VrfContext).await?;
        let monitor_values = list(client, ObjectType::HealthMonitor).await?;

        let mut vrfs = HashMap::new();
        for vrf in decode_all::<models::VrfContext>(ObjectType::VrfContext, vrf_values) {
            let Some(uuid) = vrf.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            let tenant = tenant_or(vrf.tenant_ref.as_deref(), default_tenant);
            let owned: Vec<(String, String, String)> = vrf
                .static_routes
                .iter()
                .filter(|route| names.owns_route(&route.route_id))
                .map(|route| (route.route_id.clone(), route.prefix.to_cidr(), route.next_hop.addr.clone()))
                .collect();
            let entry = VrfCacheEntry {
                name: vrf.name.clone(),
                tenant: tenant.clone(),
                uuid,
                checksum: routes_checksum(
                    owned.iter().map(|(id, prefix, hop)| (id.as_str(), prefix.as_str(), hop.as_str())),
                ),
                route_count: owned.len(),
            };
            vrfs.insert(ObjectKey::new(tenant, vrf.name), entry);
        }

        let mut monitors = HashMap::new();
        for monitor in decode_all::<models::HealthMonitor>(ObjectType::HealthMonitor, monitor_values) {
            let Some(uuid) = monitor.uuid.clone().filter(|u| !u.is_empty()) else { continue };
            let tenant = tenant_or(monitor.tenant_ref.as_deref(), default_tenant);
            let entry = HealthMonitorCacheEntry {
                name: monitor.name.clone(),
                tenant: tenant.clone(),
                uuid,
            };
            monitors.insert(ObjectKey::new(tenant, monitor.name), entry);
        }

        self.vrfs.replace_all(vrfs);
        self.health_monitors.replace_all(monitors);
        Ok(())
    }
}
