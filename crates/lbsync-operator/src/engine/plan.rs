//! Ordering of backend calls
//!
//! Upserts create or update children before the virtual service that
//! references them (VIP, pools, then L4 policy sets, which reference pools),
//! and only delete children the virtual service stopped referencing after
//! the virtual service itself was updated. References are by uuid, so a
//! recreated pool forces an update of the policy sets selecting it and a
//! recreated child of any kind forces an update of the virtual service. Deletions run the other way round:
//! the virtual service first, then policy sets, pools and VIPs.

use crate::backend::ObjectType;
use crate::cache::{BackendCache, CacheObject, TypedCache, VsCacheEntry};
use crate::graph::VirtualServiceNode;
use crate::keys::ObjectKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Update { uuid: String },
    Delete { uuid: String },
}

/// One backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub object_type: ObjectType,
    pub key: ObjectKey,
    pub action: Action,
}

impl Step {
    fn new(object_type: ObjectType, key: ObjectKey, action: Action) -> Self {
        Self {
            object_type,
            key,
            action,
        }
    }

    pub fn is_create(&self) -> bool {
        self.action == Action::Create
    }

    pub fn operation(&self) -> &'static str {
        match self.action {
            Action::Create => "create",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }
}

/// Cached state of one object as seen by the planner
trait Cached {
    fn state(&self, key: &ObjectKey) -> Option<(String, String)>;
}

macro_rules! cached_with_checksum {
    ($($entry:ty),*) => {
        $(
            impl Cached for TypedCache<$entry> {
                fn state(&self, key: &ObjectKey) -> Option<(String, String)> {
                    self.get(key).map(|e| (e.uuid().to_string(), e.checksum.clone()))
                }
            }
        )*
    };
}

cached_with_checksum!(
    crate::cache::VipCacheEntry,
    crate::cache::PoolCacheEntry,
    crate::cache::PolicySetCacheEntry
);

/// Create when absent, update when the checksum differs, nothing otherwise
fn upsert_step(
    object_type: ObjectType,
    key: ObjectKey,
    checksum: &str,
    cached: Option<(String, String)>,
) -> Option<Step> {
    match cached {
        Some((uuid, _)) if uuid.is_empty() => Some(Step::new(object_type, key, Action::Create)),
        None => Some(Step::new(object_type, key, Action::Create)),
        Some((uuid, cached_checksum)) if cached_checksum != checksum => {
            Some(Step::new(object_type, key, Action::Update { uuid }))
        }
        Some(_) => None,
    }
}

fn delete_step<E: CacheObject>(
    cache: &TypedCache<E>,
    object_type: ObjectType,
    tenant: &str,
    name: &str,
) -> Option<Step> {
    let key = ObjectKey::new(tenant, name);
    let entry = cache.get(&key)?;
    if entry.uuid().is_empty() {
        return None;
    }
    let uuid = entry.uuid().to_string();
    Some(Step::new(object_type, key, Action::Delete { uuid }))
}

/// Calls converging the backend to `vs`; empty when nothing changed
pub fn plan_upsert(vs: &VirtualServiceNode, cache: &BackendCache) -> Vec<Step> {
    let tenant = vs.tenant.as_str();
    let mut steps = Vec::new();

    if let Some(vip) = vs.vip() {
        let key = ObjectKey::new(tenant, &vip.name);
        let cached = cache.vips.state(&key);
        steps.extend(upsert_step(ObjectType::VsVip, key, &vip.checksum(), cached));
    }
    let mut recreated_pools: Vec<&str> = Vec::new();
    for pool in vs.pools() {
        let key = ObjectKey::new(tenant, &pool.name);
        let cached = cache.pools.state(&key);
        let step = upsert_step(ObjectType::Pool, key, &pool.checksum(), cached);
        if step.as_ref().is_some_and(Step::is_create) {
            recreated_pools.push(pool.name.as_str());
        }
        steps.extend(step);
    }
    for policy in vs.policy_sets() {
        let key = ObjectKey::new(tenant, &policy.name);
        let cached = cache.policy_sets.state(&key);
        let selects_recreated = policy.pool_names().any(|name| recreated_pools.contains(&name));
        let checksum = policy.checksum();
        let step = match upsert_step(ObjectType::L4PolicySet, key.clone(), &checksum, cached.clone()) {
            None if selects_recreated => cached.map(|(uuid, _)| {
                Step::new(ObjectType::L4PolicySet, key, Action::Update { uuid })
            }),
            step => step,
        };
        steps.extend(step);
    }

    let vs_key = ObjectKey::new(tenant, &vs.name);
    let cached_vs = cache.virtual_services.get(&vs_key);
    let recreated_child = steps.iter().any(Step::is_create);
    match cached_vs.as_ref().filter(|entry| !entry.uuid.is_empty()) {
        None => steps.push(Step::new(ObjectType::VirtualService, vs_key, Action::Create)),
        // A recreated child has a new uuid the virtual service must point at
        Some(entry) if entry.checksum != vs.checksum() || recreated_child => {
            steps.push(Step::new(
                ObjectType::VirtualService,
                vs_key,
                Action::Update {
                    uuid: entry.uuid.clone(),
                },
            ));
        }
        Some(_) => {}
    }

    if let Some(entry) = cached_vs {
        let desired: Vec<&str> = vs.children.iter().map(|child| child.name()).collect();
        let dropped = |refs: &[String]| -> Vec<String> {
            refs.iter()
                .filter(|name| !desired.contains(&name.as_str()))
                .cloned()
                .collect()
        };
        for name in dropped(&entry.policy_set_refs) {
            steps.extend(delete_step(&cache.policy_sets, ObjectType::L4PolicySet, tenant, &name));
        }
        for name in dropped(&entry.pool_refs) {
            steps.extend(delete_step(&cache.pools, ObjectType::Pool, tenant, &name));
        }
        for name in dropped(&entry.vip_refs) {
            steps.extend(delete_step(&cache.vips, ObjectType::VsVip, tenant, &name));
        }
    }
    steps
}

/// Calls removing a virtual service and every child it references
pub fn plan_delete(key: &ObjectKey, entry: &VsCacheEntry, cache: &BackendCache) -> Vec<Step> {
    let tenant = key.tenant.as_str();
    let mut steps = Vec::new();
    if !entry.uuid.is_empty() {
        steps.push(Step::new(
            ObjectType::VirtualService,
            key.clone(),
            Action::Delete {
                uuid: entry.uuid.clone(),
            },
        ));
    }
    for name in &entry.policy_set_refs {
        steps.extend(delete_step(&cache.policy_sets, ObjectType::L4PolicySet, tenant, name));
    }
    for name in &entry.pool_refs {
        steps.extend(delete_step(&cache.pools, ObjectType::Pool, tenant, name));
    }
    for name in &entry.vip_refs {
        steps.extend(delete_step(&cache.vips, ObjectType::VsVip, tenant, name));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PolicySetCacheEntry, PoolCacheEntry, VipCacheEntry};
    use crate::graph::node::tests::sample_vs;

    const TENANT: &str = "admin";
    const VS: &str = "prod--default-web";
    const POOL: &str = "prod--default-web-TCP-80";

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(TENANT, name)
    }

    /// Cache mirroring `vs` exactly
    fn converged(vs: &VirtualServiceNode) -> BackendCache {
        let cache = BackendCache::new();
        let vip = vs.vip().unwrap();
        cache.vips.add(
            key(&vip.name),
            VipCacheEntry {
                name: vip.name.clone(),
                tenant: TENANT.to_string(),
                uuid: "vip-1".to_string(),
                checksum: vip.checksum(),
                addresses: vec!["192.0.2.10".to_string()],
            },
        );
        for (i, pool) in vs.pools().enumerate() {
            cache.pools.add(
                key(&pool.name),
                PoolCacheEntry {
                    name: pool.name.clone(),
                    tenant: TENANT.to_string(),
                    uuid: format!("pool-{i}"),
                    checksum: pool.checksum(),
                    server_count: pool.servers.len(),
                },
            );
        }
        for policy in vs.policy_sets() {
            cache.policy_sets.add(
                key(&policy.name),
                PolicySetCacheEntry {
                    name: policy.name.clone(),
                    tenant: TENANT.to_string(),
                    uuid: "l4-1".to_string(),
                    checksum: policy.checksum(),
                    pool_refs: policy.pool_names().map(str::to_string).collect(),
                },
            );
        }
        cache.virtual_services.add(
            key(&vs.name),
            VsCacheEntry {
                name: vs.name.clone(),
                tenant: TENANT.to_string(),
                uuid: "vs-1".to_string(),
                checksum: vs.checksum(),
                vip_refs: vec![vip.name.clone()],
                pool_refs: vs.pools().map(|p| p.name.clone()).collect(),
                policy_set_refs: vs.policy_sets().map(|p| p.name.clone()).collect(),
                service: Some(vs.service.clone()),
            },
        );
        cache
    }

    fn summary(steps: &[Step]) -> Vec<(ObjectType, &'static str)> {
        steps.iter().map(|s| (s.object_type, s.operation())).collect()
    }

    #[test]
    fn test_fresh_create_orders_children_first() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        let steps = plan_upsert(&vs, &BackendCache::new());
        assert_eq!(
            summary(&steps),
            vec![
                (ObjectType::VsVip, "create"),
                (ObjectType::Pool, "create"),
                (ObjectType::L4PolicySet, "create"),
                (ObjectType::VirtualService, "create"),
            ]
        );
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        let cache = converged(&vs);
        assert!(plan_upsert(&vs, &cache).is_empty());
    }

    #[test]
    fn test_pool_member_change_updates_only_pool() {
        let old = sample_vs(&[("10.0.0.1", 8080)]);
        let cache = converged(&old);
        let new = sample_vs(&[("10.0.0.1", 8080), ("10.0.0.2", 8080)]);

        let steps = plan_upsert(&new, &cache);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].object_type, ObjectType::Pool);
        assert_eq!(
            steps[0].action,
            Action::Update {
                uuid: "pool-0".to_string()
            }
        );
    }

    #[test]
    fn test_missing_child_forces_vs_update() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        let cache = converged(&vs);
        cache.vips.delete(&key(VS));

        let steps = plan_upsert(&vs, &cache);
        assert_eq!(
            summary(&steps),
            vec![
                (ObjectType::VsVip, "create"),
                (ObjectType::VirtualService, "update"),
            ]
        );
    }

    #[test]
    fn test_recreated_pool_updates_policy_set() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        let cache = converged(&vs);
        cache.pools.delete(&key(POOL));

        let steps = plan_upsert(&vs, &cache);
        assert_eq!(
            summary(&steps),
            vec![
                (ObjectType::Pool, "create"),
                (ObjectType::L4PolicySet, "update"),
                (ObjectType::VirtualService, "update"),
            ]
        );
        assert_eq!(
            steps[1].action,
            Action::Update {
                uuid: "l4-1".to_string()
            }
        );
    }

    #[test]
    fn test_dropped_pool_deleted_after_vs_update() {
        let mut old = sample_vs(&[("10.0.0.1", 8080)]);
        let mut extra = old.pools().next().unwrap().clone();
        extra.name = "prod--default-web-UDP-53".to_string();
        extra.port = 53;
        old.children.push(crate::graph::ChildNode::Pool(extra));
        let cache = converged(&old);

        let new = sample_vs(&[("10.0.0.1", 8080)]);
        let steps = plan_upsert(&new, &cache);
        assert_eq!(
            summary(&steps),
            vec![
                (ObjectType::VirtualService, "update"),
                (ObjectType::Pool, "delete"),
            ]
        );
        assert_eq!(steps[1].key, key("prod--default-web-UDP-53"));
    }

    #[test]
    fn test_placeholder_vs_entry_plans_create() {
        let vs = sample_vs(&[]);
        let cache = converged(&vs);
        let mut entry = cache.virtual_services.get(&key(VS)).unwrap();
        entry.uuid.clear();
        cache.virtual_services.add(key(VS), entry);

        let steps = plan_upsert(&vs, &cache);
        assert_eq!(summary(&steps), vec![(ObjectType::VirtualService, "create")]);
    }

    #[test]
    fn test_delete_orders_vs_first() {
        let vs = sample_vs(&[("10.0.0.1", 8080)]);
        let cache = converged(&vs);
        let entry = cache.virtual_services.get(&key(VS)).unwrap();

        let steps = plan_delete(&key(VS), &entry, &cache);
        assert_eq!(
            summary(&steps),
            vec![
                (ObjectType::VirtualService, "delete"),
                (ObjectType::L4PolicySet, "delete"),
                (ObjectType::Pool, "delete"),
                (ObjectType::VsVip, "delete"),
            ]
        );
        assert_eq!(
            steps[2].action,
            Action::Delete {
                uuid: "pool-0".to_string()
            }
        );
        assert_eq!(steps[2].key, key(POOL));
    }

    #[test]
    fn test_delete_of_marker_skips_vs_call() {
        let vs = sample_vs(&[]);
        let cache = converged(&vs);
        let marker = VsCacheEntry {
            name: crate::cache::DUMMY_VS_NAME.to_string(),
            tenant: TENANT.to_string(),
            pool_refs: vec![POOL.to_string(), "prod--already-gone-TCP-1".to_string()],
            ..Default::default()
        };
        let steps = plan_delete(&key(crate::cache::DUMMY_VS_NAME), &marker, &cache);
        assert_eq!(summary(&steps), vec![(ObjectType::Pool, "delete")]);
    }
}
