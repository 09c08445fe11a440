//! Backend object cache
//!
//! Mirrors what exists on the backend, keyed by `(tenant, name)`, one typed
//! map per object type. Populated once at boot (fatal on failure), then kept
//! current by the convergence engine after every successful call. Cluster
//! level objects the operator does not own (VRF contexts, health monitors)
//! are re-read on every full sync.

pub mod entry;
mod populate;

pub use entry::{
    CacheObject, HealthMonitorCacheEntry, PolicySetCacheEntry, PoolCacheEntry, VipCacheEntry,
    VrfCacheEntry, VsCacheEntry,
};
pub use populate::PopulateSummary;

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::backend::{BackendError, ObjectType};
use crate::keys::ObjectKey;
use crate::metrics;

/// Name of the cache-only virtual service collecting orphaned children
pub const DUMMY_VS_NAME: &str = "DummyVSForStaleData";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read {object_type} objects: {source}")]
    Backend {
        object_type: ObjectType,
        #[source]
        source: BackendError,
    },
}

/// Thread-safe map for one object type
#[derive(Debug)]
pub struct TypedCache<E> {
    entries: RwLock<HashMap<ObjectKey, E>>,
}

impl<E> Default for TypedCache<E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<E: CacheObject> TypedCache<E> {
    pub fn get(&self, key: &ObjectKey) -> Option<E> {
        self.entries.read().get(key).cloned()
    }

    /// Insert or replace an entry
    pub fn add(&self, key: ObjectKey, entry: E) {
        self.entries.write().insert(key, entry);
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<E> {
        self.entries.write().remove(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Keys, sorted
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entries(&self) -> Vec<(ObjectKey, E)> {
        let mut entries: Vec<(ObjectKey, E)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replace every entry at once
    pub fn replace_all(&self, entries: HashMap<ObjectKey, E>) {
        *self.entries.write() = entries;
    }

    /// Entry for a name within a tenant, falling back to another tenant
    pub fn get_in(&self, tenant: &str, fallback_tenant: &str, name: &str) -> Option<E> {
        self.get(&ObjectKey::new(tenant, name))
            .or_else(|| self.get(&ObjectKey::new(fallback_tenant, name)))
    }
}

/// Mirror of the backend objects relevant to this cluster
#[derive(Debug, Default)]
pub struct BackendCache {
    pub virtual_services: TypedCache<VsCacheEntry>,
    pub vips: TypedCache<VipCacheEntry>,
    pub pools: TypedCache<PoolCacheEntry>,
    pub policy_sets: TypedCache<PolicySetCacheEntry>,
    pub vrfs: TypedCache<VrfCacheEntry>,
    pub health_monitors: TypedCache<HealthMonitorCacheEntry>,
}

impl BackendCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is the stale-data marker of its tenant
    pub fn is_dummy(key: &ObjectKey) -> bool {
        key.name == DUMMY_VS_NAME
    }

    /// Stale-data marker keys present in the cache
    pub fn dummy_keys(&self) -> Vec<ObjectKey> {
        self.virtual_services
            .keys()
            .into_iter()
            .filter(Self::is_dummy)
            .collect()
    }

    /// Publish per-type object counts
    pub fn update_metrics(&self) {
        metrics::set_cache_objects(ObjectType::VirtualService.path(), self.virtual_services.len());
        metrics::set_cache_objects(ObjectType::VsVip.path(), self.vips.len());
        metrics::set_cache_objects(ObjectType::Pool.path(), self.pools.len());
        metrics::set_cache_objects(ObjectType::L4PolicySet.path(), self.policy_sets.len());
        metrics::set_cache_objects(ObjectType::VrfContext.path(), self.vrfs.len());
        metrics::set_cache_objects(ObjectType::HealthMonitor.path(), self.health_monitors.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, uuid: &str) -> PoolCacheEntry {
        PoolCacheEntry {
            name: name.to_string(),
            tenant: "admin".to_string(),
            uuid: uuid.to_string(),
            checksum: "c1".to_string(),
            server_count: 2,
        }
    }

    #[test]
    fn test_typed_cache_add_get_delete() {
        let cache = BackendCache::new();
        let key = ObjectKey::new("admin", "prod--default-web-TCP-80");
        cache.pools.add(key.clone(), pool(&key.name, "pool-1"));

        assert!(cache.pools.contains(&key));
        assert_eq!(cache.pools.get(&key).unwrap().uuid, "pool-1");
        assert_eq!(cache.pools.len(), 1);

        let removed = cache.pools.delete(&key).unwrap();
        assert_eq!(removed.uuid(), "pool-1");
        assert!(cache.pools.is_empty());
        assert!(cache.pools.delete(&key).is_none());
    }

    #[test]
    fn test_typed_cache_tenant_fallback() {
        let cache = BackendCache::new();
        cache.health_monitors.add(
            ObjectKey::new("admin", "System-TCP"),
            HealthMonitorCacheEntry {
                name: "System-TCP".to_string(),
                tenant: "admin".to_string(),
                uuid: "hm-1".to_string(),
            },
        );
        assert!(cache
            .health_monitors
            .get_in("team-a", "admin", "System-TCP")
            .is_some());
        assert!(cache
            .health_monitors
            .get_in("team-a", "team-b", "System-TCP")
            .is_none());
    }

    #[test]
    fn test_replace_all_and_sorted_keys() {
        let cache = BackendCache::new();
        cache.pools.add(ObjectKey::new("admin", "old"), pool("old", "pool-0"));

        let mut fresh = HashMap::new();
        fresh.insert(ObjectKey::new("team-a", "b"), pool("b", "pool-2"));
        fresh.insert(ObjectKey::new("admin", "a"), pool("a", "pool-1"));
        cache.pools.replace_all(fresh);

        assert_eq!(
            cache.pools.keys(),
            vec![ObjectKey::new("admin", "a"), ObjectKey::new("team-a", "b")]
        );
        assert_eq!(cache.pools.entries()[1].1.uuid, "pool-2");
    }

    #[test]
    fn test_dummy_keys() {
        let cache = BackendCache::new();
        let dummy = ObjectKey::new("admin", DUMMY_VS_NAME);
        cache.virtual_services.add(
            dummy.clone(),
            VsCacheEntry {
                name: DUMMY_VS_NAME.to_string(),
                tenant: "admin".to_string(),
                ..Default::default()
            },
        );
        cache.virtual_services.add(
            ObjectKey::new("admin", "prod--default-web"),
            VsCacheEntry {
                name: "prod--default-web".to_string(),
                tenant: "admin".to_string(),
                uuid: "vs-1".to_string(),
                ..Default::default()
            },
        );
        assert!(BackendCache::is_dummy(&dummy));
        assert_eq!(cache.dummy_keys(), vec![dummy]);
    }
}
