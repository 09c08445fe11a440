//! Backend object naming
//!
//! Every object the operator creates is prefixed with `{cluster}--` so that
//! several clusters can share one backend tenant without colliding, and so
//! that ownership can be recognized when the backend is read back at boot.

/// Separator between the cluster name and the rest of an object name
pub const NAME_SEPARATOR: &str = "--";

/// Prefix shared by every object created for `cluster`
pub fn name_prefix(cluster: &str) -> String {
    format!("{cluster}{NAME_SEPARATOR}")
}

/// Value of the `created_by` field stamped on every managed object
pub fn created_by(cluster: &str) -> String {
    format!("lbsync-{cluster}")
}

/// Generates object names for one cluster
#[derive(Debug, Clone)]
pub struct NameBuilder {
    cluster: String,
    prefix: String,
}

impl NameBuilder {
    pub fn new(cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        let prefix = name_prefix(&cluster);
        Self { cluster, prefix }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Virtual service for a LoadBalancer Service
    pub fn l4_vs(&self, namespace: &str, service: &str) -> String {
        format!("{}{}-{}", self.prefix, namespace, service)
    }

    /// VIP object backing an L4 virtual service
    pub fn l4_vip(&self, namespace: &str, service: &str) -> String {
        self.l4_vs(namespace, service)
    }

    /// L4 policy set routing listener ports to pools
    pub fn l4_policy_set(&self, namespace: &str, service: &str) -> String {
        self.l4_vs(namespace, service)
    }

    /// Pool for one service port
    pub fn l4_pool(&self, namespace: &str, service: &str, protocol: &str, port: u16) -> String {
        format!(
            "{}{}-{}-{}-{}",
            self.prefix, namespace, service, protocol, port
        )
    }

    /// Identifier of the n-th static route in the cluster VRF
    pub fn static_route_id(&self, index: usize) -> String {
        format!("{}-{}", self.cluster, index)
    }

    /// Whether `name` was generated for this cluster
    pub fn owns(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    /// Whether a static route id was generated by [`NameBuilder::static_route_id`]
    pub fn owns_route(&self, route_id: &str) -> bool {
        route_id
            .strip_prefix(&self.cluster)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
    }
}
