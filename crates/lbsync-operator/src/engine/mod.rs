//! Convergence engine
//!
//! Handles model keys from the graph queue. For each key the desired graph
//! is compared with the backend cache, the difference is turned into an
//! ordered list of calls ([`plan`]) and executed one call at a time. The
//! cache is updated after every successful call, so a pass that fails half
//! way leaves the cache describing exactly what exists and the retry picks
//! up from there.

pub mod plan;
mod render;

pub use plan::{plan_delete, plan_upsert, Action, Step};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lbsync_common::NameBuilder;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::models::{self, IpAddr, IpPrefix, StaticRoute};
use crate::backend::{BackendClient, BackendError, ObjectType};
use crate::cache::{
    BackendCache, PolicySetCacheEntry, PoolCacheEntry, VipCacheEntry, VrfCacheEntry, VsCacheEntry,
};
use crate::graph::{GraphStore, RootNode, ServiceRef, VirtualServiceNode, VrfNode};
use crate::keys::{KeyError, ModelKey, ObjectKey};
use crate::leader::LeaderGate;
use crate::retry::{RetryClassifier, RetryDecision};
use crate::status::{StatusWriter, SyncOutcome};
use crate::workqueue::{HandlerError, KeyHandler};
use render::RenderContext;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("{operation} {object_type} '{name}' failed: {source}")]
    Backend {
        object_type: ObjectType,
        operation: &'static str,
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("{object_type} '{name}' referenced by '{owner}' does not exist")]
    MissingReference {
        object_type: ObjectType,
        name: String,
        owner: String,
    },

    #[error("{object_type} '{name}' is not in the cache yet")]
    DependencyMissing { object_type: ObjectType, name: String },

    #[error("VRF context '{0}' not found on the backend")]
    VrfUnavailable(String),

    #[error("{object_type} '{name}' still present after delete")]
    DeletePending { object_type: ObjectType, name: String },

    #[error("invalid {object_type} response: {message}")]
    InvalidResponse {
        object_type: ObjectType,
        message: String,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl ConvergeError {
    fn backend(step: &Step, source: BackendError) -> Self {
        Self::Backend {
            object_type: step.object_type,
            operation: step.operation(),
            name: step.key.name.clone(),
            source,
        }
    }
}

/// Result of one convergence pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Backend already matched the desired state
    Unchanged,
    /// Number of calls issued to reach the desired state
    Applied(usize),
    /// Number of calls issued to remove the model
    Deleted(usize),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub names: NameBuilder,
    pub default_tenant: String,
    /// Reads after a virtual service delete before giving up
    pub delete_poll_attempts: u32,
    pub delete_poll_interval: Duration,
}

pub struct ConvergenceEngine {
    client: Arc<dyn BackendClient>,
    cache: Arc<BackendCache>,
    store: Arc<GraphStore>,
    retry: Arc<RetryClassifier>,
    status: Arc<dyn StatusWriter>,
    leader: Arc<LeaderGate>,
    settings: EngineSettings,
}

impl ConvergenceEngine {
    pub fn new(
        client: Arc<dyn BackendClient>,
        cache: Arc<BackendCache>,
        store: Arc<GraphStore>,
        retry: Arc<RetryClassifier>,
        status: Arc<dyn StatusWriter>,
        leader: Arc<LeaderGate>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            client,
            cache,
            store,
            retry,
            status,
            leader,
            settings,
        }
    }

    fn render_context(&self) -> RenderContext<'_> {
        RenderContext {
            cache: &self.cache,
            cluster: self.settings.names.cluster(),
            default_tenant: &self.settings.default_tenant,
        }
    }

    /// Bring the backend in line with the stored graph for `key`
    pub async fn converge(&self, key: &ModelKey) -> Result<Outcome, ConvergeError> {
        if BackendCache::is_dummy(key) {
            return self.converge_deletion(key).await;
        }
        match self.store.graph(key) {
            Some(graph) => match &graph.root {
                RootNode::VirtualService(vs) => self.converge_virtual_service(key, vs).await,
                RootNode::Vrf(vrf) => self.converge_vrf(key, vrf).await,
            },
            None => self.converge_deletion(key).await,
        }
    }

    async fn converge_virtual_service(
        &self,
        key: &ModelKey,
        vs: &VirtualServiceNode,
    ) -> Result<Outcome, ConvergeError> {
        let steps = plan_upsert(vs, &self.cache);
        if steps.is_empty() {
            debug!(model_key = %key, "Backend matches desired state");
            return Ok(Outcome::Unchanged);
        }

        // Until the virtual service exists, track the children it will own so
        // a deletion before the first successful pass still finds them
        let cached = self.cache.virtual_services.get(key);
        if cached.as_ref().map_or(true, |entry| entry.uuid.is_empty()) {
            let mut placeholder = cached.unwrap_or_else(|| VsCacheEntry {
                name: vs.name.clone(),
                tenant: vs.tenant.clone(),
                ..Default::default()
            });
            link_children(&mut placeholder, vs);
            placeholder.service = Some(vs.service.clone());
            self.cache.virtual_services.add(key.clone(), placeholder);
        }

        self.execute(key, &steps, Some(vs)).await?;
        info!(model_key = %key, calls = steps.len(), "Converged virtual service");
        Ok(Outcome::Applied(steps.len()))
    }

    async fn converge_deletion(&self, key: &ModelKey) -> Result<Outcome, ConvergeError> {
        let Some(entry) = self.cache.virtual_services.get(key) else {
            debug!(model_key = %key, "Nothing to delete");
            return Ok(Outcome::Unchanged);
        };
        let steps = plan_delete(key, &entry, &self.cache);
        self.execute(key, &steps, None).await?;
        self.cache.virtual_services.delete(key);
        info!(model_key = %key, calls = steps.len(), "Deleted virtual service");
        Ok(Outcome::Deleted(steps.len()))
    }

    async fn execute(
        &self,
        owner: &ModelKey,
        steps: &[Step],
        vs: Option<&VirtualServiceNode>,
    ) -> Result<(), ConvergeError> {
        for step in steps {
            match (&step.action, vs) {
                (Action::Delete { uuid }, _) => self.delete_object(owner, step, uuid).await?,
                (_, Some(vs)) => self.write_object(step, vs).await?,
                (_, None) => {
                    return Err(ConvergeError::DependencyMissing {
                        object_type: step.object_type,
                        name: step.key.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Render and send a create or update
    async fn write_object(&self, step: &Step, vs: &VirtualServiceNode) -> Result<(), ConvergeError> {
        let ctx = self.render_context();
        let missing = || ConvergeError::DependencyMissing {
            object_type: step.object_type,
            name: step.key.name.clone(),
        };
        let name = step.key.name.as_str();
        let body = match step.object_type {
            ObjectType::VsVip => {
                let node = vs.vip().filter(|n| n.name == name).ok_or_else(missing)?;
                render::render_vip(&ctx, vs, node)?
            }
            ObjectType::Pool => {
                let node = vs.pools().find(|n| n.name == name).ok_or_else(missing)?;
                render::render_pool(&ctx, vs, node)?
            }
            ObjectType::L4PolicySet => {
                let node = vs.policy_sets().find(|n| n.name == name).ok_or_else(missing)?;
                render::render_policy_set(&ctx, vs, node)?
            }
            ObjectType::VirtualService => render::render_virtual_service(&ctx, vs)?,
            ObjectType::VrfContext | ObjectType::HealthMonitor => return Err(missing()),
        };
        let checksum = body
            .get("cloud_config_cksum")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tenant = step.key.tenant.as_str();

        let stored = match &step.action {
            Action::Create => match self.client.create(step.object_type, tenant, body.clone()).await {
                Ok(stored) => stored,
                Err(e) if e.is_conflict() => self.adopt(step, body, &checksum, e).await?,
                Err(e) => return Err(ConvergeError::backend(step, e)),
            },
            Action::Update { uuid } => {
                match self.client.update(step.object_type, tenant, uuid, body).await {
                    Ok(stored) => stored,
                    Err(e) if e.is_not_found() => {
                        // Removed behind our back; the retry recreates it
                        warn!(object_type = %step.object_type, name = %name, uuid = %uuid, "Object vanished, dropping from cache");
                        self.evict(step);
                        return Err(ConvergeError::backend(step, e));
                    }
                    Err(e) => return Err(ConvergeError::backend(step, e)),
                }
            }
            Action::Delete { .. } => return Err(missing()),
        };

        self.record(step, &stored, &checksum, vs)?;
        debug!(object_type = %step.object_type, name = %name, operation = step.operation(), "Wrote object");
        Ok(())
    }

    /// Take over an object that already exists under our name
    async fn adopt(
        &self,
        step: &Step,
        body: Value,
        checksum: &str,
        conflict: BackendError,
    ) -> Result<Value, ConvergeError> {
        let tenant = step.key.tenant.as_str();
        let existing = self
            .client
            .get_by_name(step.object_type, tenant, &step.key.name)
            .await
            .map_err(|e| ConvergeError::backend(step, e))?;
        let Some(existing) = existing else {
            return Err(ConvergeError::backend(step, conflict));
        };
        let uuid = object_uuid(step.object_type, &existing)?;
        if existing.get("cloud_config_cksum").and_then(Value::as_str) == Some(checksum) {
            info!(object_type = %step.object_type, name = %step.key.name, uuid = %uuid, "Adopted existing object");
            return Ok(existing);
        }
        info!(object_type = %step.object_type, name = %step.key.name, uuid = %uuid, "Updating conflicting object");
        self.client
            .update(step.object_type, tenant, &uuid, body)
            .await
            .map_err(|e| ConvergeError::backend(step, e))
    }

    /// Mirror a stored object into the cache
    fn record(
        &self,
        step: &Step,
        stored: &Value,
        checksum: &str,
        vs: &VirtualServiceNode,
    ) -> Result<(), ConvergeError> {
        let uuid = object_uuid(step.object_type, stored)?;
        let key = step.key.clone();
        let name = key.name.clone();
        let tenant = key.tenant.clone();
        let checksum = checksum.to_string();
        match step.object_type {
            ObjectType::VsVip => {
                let addresses = models::decode::<models::VsVip>(ObjectType::VsVip, stored.clone())
                    .map(|vip| {
                        vip.vip
                            .into_iter()
                            .filter_map(|v| v.ip_address.map(|ip| ip.addr))
                            .collect()
                    })
                    .unwrap_or_default();
                self.cache.vips.add(
                    key,
                    VipCacheEntry {
                        name,
                        tenant,
                        uuid,
                        checksum,
                        addresses,
                    },
                );
            }
            ObjectType::Pool => {
                let server_count = vs
                    .pools()
                    .find(|pool| pool.name == name)
                    .map_or(0, |pool| pool.servers.len());
                self.cache.pools.add(
                    key,
                    PoolCacheEntry {
                        name,
                        tenant,
                        uuid,
                        checksum,
                        server_count,
                    },
                );
            }
            ObjectType::L4PolicySet => {
                let pool_refs = vs
                    .policy_sets()
                    .find(|policy| policy.name == name)
                    .map(|policy| policy.pool_names().map(str::to_string).collect())
                    .unwrap_or_default();
                self.cache.policy_sets.add(
                    key,
                    PolicySetCacheEntry {
                        name,
                        tenant,
                        uuid,
                        checksum,
                        pool_refs,
                    },
                );
            }
            ObjectType::VirtualService => {
                let previous = self.cache.virtual_services.get(&key);
                let mut entry = VsCacheEntry {
                    name,
                    tenant,
                    uuid,
                    checksum,
                    service: Some(vs.service.clone()),
                    ..Default::default()
                };
                link_children(&mut entry, vs);
                // Children dropped from the graph stay linked until deleted
                if let Some(previous) = previous {
                    self.keep_pending(&mut entry, &previous);
                }
                self.cache.virtual_services.add(key, entry);
            }
            ObjectType::VrfContext | ObjectType::HealthMonitor => {}
        }
        Ok(())
    }

    fn keep_pending(&self, entry: &mut VsCacheEntry, previous: &VsCacheEntry) {
        let tenant = previous.tenant.clone();
        let exists = |object_type: ObjectType, name: &str| {
            let key = ObjectKey::new(tenant.as_str(), name);
            match object_type {
                ObjectType::VsVip => self.cache.vips.contains(&key),
                ObjectType::Pool => self.cache.pools.contains(&key),
                _ => self.cache.policy_sets.contains(&key),
            }
        };
        for name in &previous.vip_refs {
            if !entry.vip_refs.contains(name) && exists(ObjectType::VsVip, name) {
                entry.vip_refs.push(name.clone());
            }
        }
        for name in &previous.pool_refs {
            if !entry.pool_refs.contains(name) && exists(ObjectType::Pool, name) {
                entry.pool_refs.push(name.clone());
            }
        }
        for name in &previous.policy_set_refs {
            if !entry.policy_set_refs.contains(name) && exists(ObjectType::L4PolicySet, name) {
                entry.policy_set_refs.push(name.clone());
            }
        }
    }

    async fn delete_object(&self, owner: &ModelKey, step: &Step, uuid: &str) -> Result<(), ConvergeError> {
        let tenant = step.key.tenant.as_str();
        self.client
            .delete(step.object_type, tenant, uuid)
            .await
            .map_err(|e| ConvergeError::backend(step, e))?;

        if step.object_type == ObjectType::VirtualService {
            self.confirm_deleted(step, uuid).await?;
            // Keep the entry (and its child links) until the children are gone
            if let Some(mut entry) = self.cache.virtual_services.get(&step.key) {
                entry.uuid.clear();
                self.cache.virtual_services.add(step.key.clone(), entry);
            }
        } else {
            self.evict(step);
            if let Some(mut entry) = self.cache.virtual_services.get(owner) {
                let name = &step.key.name;
                entry.vip_refs.retain(|n| n != name);
                entry.pool_refs.retain(|n| n != name);
                entry.policy_set_refs.retain(|n| n != name);
                self.cache.virtual_services.add(owner.clone(), entry);
            }
        }
        debug!(object_type = %step.object_type, name = %step.key.name, uuid = %uuid, "Deleted object");
        Ok(())
    }

    /// Poll until a deleted virtual service is gone; children cannot be
    /// removed while it still references them
    async fn confirm_deleted(&self, step: &Step, uuid: &str) -> Result<(), ConvergeError> {
        let tenant = step.key.tenant.as_str();
        for attempt in 0..self.settings.delete_poll_attempts.max(1) {
            let found = self
                .client
                .get(step.object_type, tenant, uuid)
                .await
                .map_err(|e| ConvergeError::backend(step, e))?;
            if found.is_none() {
                return Ok(());
            }
            debug!(name = %step.key.name, attempt, "Waiting for virtual service removal");
            tokio::time::sleep(self.settings.delete_poll_interval).await;
        }
        Err(ConvergeError::DeletePending {
            object_type: step.object_type,
            name: step.key.name.clone(),
        })
    }

    fn evict(&self, step: &Step) {
        match step.object_type {
            ObjectType::VsVip => {
                self.cache.vips.delete(&step.key);
            }
            ObjectType::Pool => {
                self.cache.pools.delete(&step.key);
            }
            ObjectType::L4PolicySet => {
                self.cache.policy_sets.delete(&step.key);
            }
            ObjectType::VirtualService => {
                if let Some(mut entry) = self.cache.virtual_services.get(&step.key) {
                    entry.uuid.clear();
                    self.cache.virtual_services.add(step.key.clone(), entry);
                }
            }
            ObjectType::VrfContext => {
                self.cache.vrfs.delete(&step.key);
            }
            ObjectType::HealthMonitor => {}
        }
    }

    /// Replace the routes owned by this cluster on a shared VRF context
    async fn converge_vrf(&self, key: &ModelKey, node: &VrfNode) -> Result<Outcome, ConvergeError> {
        let Some(entry) = self.cache.vrfs.get(key) else {
            return Err(ConvergeError::VrfUnavailable(key.to_string()));
        };
        let checksum = node.checksum();
        if entry.checksum == checksum {
            debug!(model_key = %key, "VRF routes unchanged");
            return Ok(Outcome::Unchanged);
        }

        let step = Step {
            object_type: ObjectType::VrfContext,
            key: key.clone(),
            action: Action::Update {
                uuid: entry.uuid.clone(),
            },
        };
        let current = self
            .client
            .get(ObjectType::VrfContext, &key.tenant, &entry.uuid)
            .await
            .map_err(|e| ConvergeError::backend(&step, e))?;
        let Some(mut current) = current else {
            self.evict(&step);
            return Err(ConvergeError::VrfUnavailable(key.to_string()));
        };

        let names = &self.settings.names;
        let mut routes: Vec<Value> = current
            .get("static_routes")
            .and_then(Value::as_array)
            .map(|routes| {
                routes
                    .iter()
                    .filter(|route| {
                        let id = route.get("route_id").and_then(Value::as_str).unwrap_or_default();
                        !names.owns_route(id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for route in &node.routes {
            let Some(prefix) = IpPrefix::parse(&route.prefix) else {
                warn!(route_id = %route.route_id, prefix = %route.prefix, "Skipping route with invalid prefix");
                continue;
            };
            let route = StaticRoute {
                route_id: route.route_id.clone(),
                prefix,
                next_hop: IpAddr::new(&route.next_hop),
            };
            routes.push(models::encode(ObjectType::VrfContext, &route).map_err(|e| {
                ConvergeError::InvalidResponse {
                    object_type: ObjectType::VrfContext,
                    message: e.to_string(),
                }
            })?);
        }
        match current.as_object_mut() {
            Some(object) => {
                object.insert("static_routes".to_string(), Value::Array(routes));
            }
            None => {
                return Err(ConvergeError::InvalidResponse {
                    object_type: ObjectType::VrfContext,
                    message: "VRF context is not an object".to_string(),
                })
            }
        }

        match self
            .client
            .update(ObjectType::VrfContext, &key.tenant, &entry.uuid, current)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.evict(&step);
                return Err(ConvergeError::VrfUnavailable(key.to_string()));
            }
            Err(e) => return Err(ConvergeError::backend(&step, e)),
        }
        self.cache.vrfs.add(
            key.clone(),
            VrfCacheEntry {
                checksum,
                route_count: node.routes.len(),
                ..entry
            },
        );
        info!(model_key = %key, routes = node.routes.len(), "Updated VRF static routes");
        Ok(Outcome::Applied(1))
    }

    async fn write_status(&self, service: &ServiceRef, outcome: SyncOutcome) {
        if let Err(e) = self.status.write(service, outcome).await {
            warn!(service = %service, error = %e, "Failed to update Service status");
        }
    }

    /// Publish the assigned address of a converged virtual service
    pub async fn sync_status(&self, key: &ModelKey) {
        let Some(entry) = self.cache.virtual_services.get(key) else {
            return;
        };
        let Some(service) = entry.service.clone() else {
            return;
        };
        if entry.uuid.is_empty() {
            return;
        }
        let addresses = entry
            .vip_refs
            .iter()
            .filter_map(|name| self.cache.vips.get(&ObjectKey::new(key.tenant.as_str(), name.as_str())))
            .flat_map(|vip| vip.addresses)
            .collect();
        self.write_status(&service, SyncOutcome::Accepted { addresses }).await;
    }

    async fn on_success(&self, key: &ModelKey, outcome: Outcome) {
        self.store.reset_retry(key);
        match outcome {
            Outcome::Applied(_) => self.sync_status(key).await,
            Outcome::Deleted(_) | Outcome::Unchanged => {
                if self.store.remove_tombstone(key) {
                    debug!(model_key = %key, "Removed converged tombstone");
                }
            }
        }
    }

    async fn on_failure(&self, key: &ModelKey, err: &ConvergeError) {
        let decision = self.retry.schedule(key, err);
        if decision != RetryDecision::Reject {
            return;
        }
        let service = self
            .store
            .graph(key)
            .and_then(|graph| graph.as_virtual_service().map(|vs| vs.service.clone()));
        if let Some(service) = service {
            let reason = err.to_string();
            self.write_status(&service, SyncOutcome::Rejected { reason }).await;
        }
    }
}

/// Set the child links of `entry` to include every child of `vs`
fn link_children(entry: &mut VsCacheEntry, vs: &VirtualServiceNode) {
    fn push(refs: &mut Vec<String>, name: &str) {
        if !refs.iter().any(|n| n == name) {
            refs.push(name.to_string());
        }
    }
    if let Some(vip) = vs.vip() {
        push(&mut entry.vip_refs, &vip.name);
    }
    for pool in vs.pools() {
        push(&mut entry.pool_refs, &pool.name);
    }
    for policy in vs.policy_sets() {
        push(&mut entry.policy_set_refs, &policy.name);
    }
}

fn object_uuid(object_type: ObjectType, object: &Value) -> Result<String, ConvergeError> {
    object
        .get("uuid")
        .and_then(Value::as_str)
        .filter(|uuid| !uuid.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConvergeError::InvalidResponse {
            object_type,
            message: "missing uuid".to_string(),
        })
}

#[async_trait]
impl KeyHandler for ConvergenceEngine {
    #[instrument(skip(self, key), fields(model_key = %key))]
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        if !self.leader.is_leader() {
            debug!("Not leader, skipping convergence");
            return Ok(());
        }
        let model_key = match ModelKey::parse(key) {
            Ok(model_key) => model_key,
            Err(e) => {
                error!(error = %e, "Dropping malformed model key");
                return Ok(());
            }
        };
        match self.converge(&model_key).await {
            Ok(outcome) => self.on_success(&model_key, outcome).await,
            Err(err) => self.on_failure(&model_key, &err).await,
        }
        Ok(())
    }
}
