//! Cache entry types
//!
//! An entry mirrors one backend object. A non-empty `uuid` means the object
//! exists on the backend; the only entries with an empty uuid are the
//! stale-data markers built at populate.

use crate::backend::ObjectType;
use crate::graph::ServiceRef;

/// Common view over cache entries
pub trait CacheObject: Clone + Send + Sync + 'static {
    const OBJECT_TYPE: ObjectType;

    fn name(&self) -> &str;
    fn uuid(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VsCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    pub checksum: String,
    /// Child object names
    pub vip_refs: Vec<String>,
    pub pool_refs: Vec<String>,
    pub policy_set_refs: Vec<String>,
    pub service: Option<ServiceRef>,
}

impl VsCacheEntry {
    pub fn has_children(&self) -> bool {
        !(self.vip_refs.is_empty() && self.pool_refs.is_empty() && self.policy_set_refs.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VipCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    pub checksum: String,
    /// Addresses assigned by the backend
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    pub checksum: String,
    pub server_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySetCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    pub checksum: String,
    pub pool_refs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VrfCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
    /// Checksum of the routes owned by this cluster
    pub checksum: String,
    pub route_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthMonitorCacheEntry {
    pub name: String,
    pub tenant: String,
    pub uuid: String,
}

macro_rules! cache_object {
    ($entry:ty, $object_type:expr) => {
        impl CacheObject for $entry {
            const OBJECT_TYPE: ObjectType = $object_type;

            fn name(&self) -> &str {
                &self.name
            }

            fn uuid(&self) -> &str {
                &self.uuid
            }
        }
    };
}

cache_object!(VsCacheEntry, ObjectType::VirtualService);
cache_object!(VipCacheEntry, ObjectType::VsVip);
cache_object!(PoolCacheEntry, ObjectType::Pool);
cache_object!(PolicySetCacheEntry, ObjectType::L4PolicySet);
cache_object!(VrfCacheEntry, ObjectType::VrfContext);
cache_object!(HealthMonitorCacheEntry, ObjectType::HealthMonitor);
