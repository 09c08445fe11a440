//! Scenario tests driving builder → engine → cache against an in-memory
//! backend controller
//!
//! The fake backend enforces the referential rules of the real controller:
//! an object cannot be created before the objects it points at, and cannot
//! be deleted while another object still points at it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Node, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use lbsync_common::NameBuilder;
use parking_lot::Mutex;
use serde_json::{json, Value};

use lbsync_operator::backend::{BackendClient, BackendError, ObjectType};
use lbsync_operator::cache::BackendCache;
use lbsync_operator::config::VrfConfig;
use lbsync_operator::controllers::namespace::TenantResolver;
use lbsync_operator::engine::{ConvergenceEngine, EngineSettings, Outcome};
use lbsync_operator::fullsync::{FullSync, FullSyncSettings, SyncTrigger};
use lbsync_operator::graph::builder::BuilderSettings;
use lbsync_operator::graph::{ClusterView, GraphBuilder, GraphStore, ServiceRef};
use lbsync_operator::keys::{ingestion_shard_key, model_shard_key, ModelKey};
use lbsync_operator::leader::LeaderGate;
use lbsync_operator::retry::{RetryClassifier, RetryPolicy};
use lbsync_operator::status::{StatusError, StatusWriter, SyncOutcome};
use lbsync_operator::workqueue::WorkQueue;

const VS: &str = "prod--default-web";
const POOL: &str = "prod--default-web-TCP-80";

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct FakeBackend {
    /// uuid -> (type path, object)
    objects: Mutex<HashMap<String, (&'static str, Value)>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

/// Object types whose references are checked on write and delete
const REFERENCED: [ObjectType; 3] = [ObjectType::VsVip, ObjectType::Pool, ObjectType::L4PolicySet];

fn tenant_ref(tenant: &str) -> String {
    format!("https://ctrl/api/tenant/{tenant}-uuid#{tenant}")
}

/// Every `/api/{type}/{uuid}` reference to a checked type inside `value`
fn references(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for object_type in REFERENCED {
                let prefix = format!("/api/{}/", object_type.path());
                if let Some(uuid) = s.strip_prefix(&prefix) {
                    found.push(uuid.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| references(item, found)),
        Value::Object(map) => map.values().for_each(|item| references(item, found)),
        _ => {}
    }
}

fn api_error(status: u16, message: &str) -> BackendError {
    BackendError::Api {
        status,
        message: message.to_string(),
    }
}

impl FakeBackend {
    fn seeded() -> Arc<Self> {
        let backend = Arc::new(Self::default());
        backend.insert(
            ObjectType::VrfContext,
            json!({"uuid": "vrf-1", "name": "global", "tenant_ref": tenant_ref("admin"), "static_routes": []}),
        );
        backend
    }

    fn insert(&self, object_type: ObjectType, object: Value) {
        let uuid = object["uuid"].as_str().unwrap_or_default().to_string();
        self.objects.lock().insert(uuid, (object_type.path(), object));
    }

    fn names(&self, object_type: ObjectType) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .values()
            .filter(|(path, _)| *path == object_type.path())
            .filter_map(|(_, object)| object["name"].as_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn uuid_of(&self, object_type: ObjectType, name: &str) -> Option<String> {
        self.objects
            .lock()
            .iter()
            .find(|(_, (path, object))| *path == object_type.path() && object["name"] == name)
            .map(|(uuid, _)| uuid.clone())
    }

    fn remove(&self, uuid: &str) {
        self.objects.lock().remove(uuid);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, operation: &str, object_type: ObjectType, name: &str) {
        self.calls
            .lock()
            .push(format!("{operation} {} {name}", object_type.path()));
    }

    fn check_references(&self, body: &Value) -> Result<(), BackendError> {
        let mut found = Vec::new();
        references(body, &mut found);
        let objects = self.objects.lock();
        match found.iter().find(|uuid| !objects.contains_key(uuid.as_str())) {
            Some(missing) => Err(api_error(400, &format!("referenced object {missing} not found"))),
            None => Ok(()),
        }
    }

    fn stored(&self, object_type: ObjectType, tenant: &str, uuid: &str, mut body: Value) -> Value {
        if let Some(object) = body.as_object_mut() {
            object.insert("uuid".to_string(), Value::String(uuid.to_string()));
            object
                .entry("tenant_ref")
                .or_insert_with(|| Value::String(tenant_ref(tenant)));
        }
        if object_type == ObjectType::VsVip {
            if let Some(vips) = body["vip"].as_array_mut() {
                for vip in vips {
                    if vip.get("ip_address").is_none() {
                        vip["ip_address"] = json!({"addr": "192.0.2.10", "type": "V4"});
                    }
                }
            }
        }
        body
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn list(&self, object_type: ObjectType, _tenant: &str) -> Result<Vec<Value>, BackendError> {
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|(path, _)| *path == object_type.path())
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn get(
        &self,
        _object_type: ObjectType,
        _tenant: &str,
        uuid: &str,
    ) -> Result<Option<Value>, BackendError> {
        Ok(self.objects.lock().get(uuid).map(|(_, object)| object.clone()))
    }

    async fn get_by_name(
        &self,
        object_type: ObjectType,
        _tenant: &str,
        name: &str,
    ) -> Result<Option<Value>, BackendError> {
        let uuid = self.uuid_of(object_type, name);
        Ok(uuid.and_then(|uuid| self.objects.lock().get(&uuid).map(|(_, o)| o.clone())))
    }

    async fn create(
        &self,
        object_type: ObjectType,
        tenant: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        self.record("create", object_type, &name);
        if self.uuid_of(object_type, &name).is_some() {
            return Err(api_error(409, "object with this name already exist"));
        }
        self.check_references(&body)?;
        let uuid = format!(
            "{}-{}",
            object_type.path(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let stored = self.stored(object_type, tenant, &uuid, body);
        self.insert(object_type, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        self.record("update", object_type, &name);
        if !self.objects.lock().contains_key(uuid) {
            return Err(api_error(404, "object not found"));
        }
        self.check_references(&body)?;
        let stored = self.stored(object_type, tenant, uuid, body);
        self.insert(object_type, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, object_type: ObjectType, _tenant: &str, uuid: &str) -> Result<(), BackendError> {
        let name = self
            .objects
            .lock()
            .get(uuid)
            .and_then(|(_, object)| object["name"].as_str().map(str::to_string))
            .unwrap_or_else(|| uuid.to_string());
        self.record("delete", object_type, &name);

        let referenced = self.objects.lock().values().any(|(_, object)| {
            let mut found = Vec::new();
            references(object, &mut found);
            found.iter().any(|r| r == uuid)
        });
        if referenced {
            return Err(api_error(412, "object is referred by other objects"));
        }
        // The REST client maps 404 on delete to success
        self.remove(uuid);
        Ok(())
    }

    async fn check_readiness(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct RecordingStatus(Mutex<Vec<(ServiceRef, SyncOutcome)>>);

#[async_trait]
impl StatusWriter for RecordingStatus {
    async fn write(&self, service: &ServiceRef, outcome: SyncOutcome) -> Result<(), StatusError> {
        self.0.lock().push((service.clone(), outcome));
        Ok(())
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn lb_service(name: &str) -> Service {
    Service {
        metadata: meta("default", name),
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![ServicePort {
                port: 80,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints(name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: meta("default", name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                port: 8080,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

struct Harness {
    backend: Arc<FakeBackend>,
    cache: Arc<BackendCache>,
    store: Arc<GraphStore>,
    services: Writer<Service>,
    endpoints: Writer<Endpoints>,
    _nodes: Writer<Node>,
    _namespaces: Writer<Namespace>,
    view: ClusterView,
    builder: Arc<GraphBuilder>,
    engine: Arc<ConvergenceEngine>,
    ingestion_queue: Arc<WorkQueue>,
    graph_queue: Arc<WorkQueue>,
    status: Arc<RecordingStatus>,
}

impl Harness {
    /// Operator instance booted against `backend`
    async fn boot(backend: Arc<FakeBackend>) -> Self {
        let names = NameBuilder::new("prod");
        let cache = Arc::new(BackendCache::new());
        cache
            .populate(backend.as_ref(), &names, "admin")
            .await
            .expect("populate");

        let store = Arc::new(GraphStore::new());
        let services: Writer<Service> = Writer::default();
        let endpoints: Writer<Endpoints> = Writer::default();
        let nodes: Writer<Node> = Writer::default();
        let namespaces: Writer<Namespace> = Writer::default();
        let view = ClusterView {
            services: services.as_reader(),
            endpoints: endpoints.as_reader(),
            nodes: nodes.as_reader(),
            namespaces: namespaces.as_reader(),
        };

        let ingestion_queue = WorkQueue::new("ingestion", 2, ingestion_shard_key);
        let graph_queue = WorkQueue::new("graph", 2, model_shard_key);
        let status = Arc::new(RecordingStatus::default());
        let leader = Arc::new(LeaderGate::always_leader());

        let builder = Arc::new(GraphBuilder::new(
            view.clone(),
            TenantResolver::new(view.namespaces.clone(), BTreeMap::new(), "admin".to_string()),
            BuilderSettings {
                names: names.clone(),
                vrf: VrfConfig::default(),
                vrf_tenant: "admin".to_string(),
            },
            store.clone(),
            graph_queue.clone(),
            status.clone(),
            leader.clone(),
        ));
        let retry = Arc::new(RetryClassifier::new(
            RetryPolicy {
                fast_base_delay: Duration::from_millis(10),
                fast_max_delay: Duration::from_millis(50),
                fast_max_attempts: 3,
                slow_interval: Duration::from_secs(60),
            },
            store.clone(),
            WorkQueue::new("fast-retry", 1, model_shard_key),
            WorkQueue::new("slow-retry", 1, model_shard_key),
        ));
        let engine = Arc::new(ConvergenceEngine::new(
            backend.clone(),
            cache.clone(),
            store.clone(),
            retry,
            status.clone(),
            leader,
            EngineSettings {
                names,
                default_tenant: "admin".to_string(),
                delete_poll_attempts: 3,
                delete_poll_interval: Duration::from_millis(1),
            },
        ));

        Self {
            backend,
            cache,
            store,
            services,
            endpoints,
            _nodes: nodes,
            _namespaces: namespaces,
            view,
            builder,
            engine,
            ingestion_queue,
            graph_queue,
            status,
        }
    }

    fn apply_web(&mut self) {
        self.services.apply_watcher_event(&Event::Apply(lb_service("web")));
        self.endpoints
            .apply_watcher_event(&Event::Apply(endpoints("web", &["10.0.0.1", "10.0.0.2"])));
    }

    fn full_sync(&self) -> FullSync {
        self.full_sync_waiting(Duration::from_secs(5))
    }

    fn full_sync_waiting(&self, idle_timeout: Duration) -> FullSync {
        FullSync::new(
            self.backend.clone(),
            self.cache.clone(),
            self.store.clone(),
            self.view.clone(),
            self.ingestion_queue.clone(),
            self.graph_queue.clone(),
            self.engine.clone(),
            FullSyncSettings {
                names: NameBuilder::new("prod"),
                default_tenant: "admin".to_string(),
                vrf_key: Some(ModelKey::new("admin", "global")),
                vrf_settle: Duration::from_secs(2),
                idle_timeout,
                interval: None,
            },
        )
    }
}

fn web_key() -> ModelKey {
    ModelKey::new("admin", VS)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_service_converges_in_dependency_order() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();

    h.builder.build_l4_service("default", "web").await.unwrap();
    let outcome = h.engine.converge(&web_key()).await.unwrap();

    assert_eq!(outcome, Outcome::Applied(4));
    assert_eq!(
        h.backend.calls(),
        vec![
            format!("create vsvip {VS}"),
            format!("create pool {POOL}"),
            format!("create l4policyset {VS}"),
            format!("create virtualservice {VS}"),
        ]
    );
    assert_eq!(h.backend.names(ObjectType::VirtualService), vec![VS.to_string()]);
    assert_eq!(
        h.cache.vips.get(&web_key()).map(|vip| vip.addresses),
        Some(vec!["192.0.2.10".to_string()])
    );
}

#[tokio::test]
async fn test_unchanged_intent_issues_no_calls() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();
    h.builder.build_l4_service("default", "web").await.unwrap();
    h.engine.converge(&web_key()).await.unwrap();
    h.backend.clear_calls();

    // Same event again
    h.builder.build_l4_service("default", "web").await.unwrap();
    assert_eq!(h.engine.converge(&web_key()).await.unwrap(), Outcome::Unchanged);
    assert!(h.backend.calls().is_empty());

    // Restart: the checksums read back from the backend match the new models
    let mut restarted = Harness::boot(h.backend.clone()).await;
    restarted.apply_web();
    restarted.builder.build_l4_service("default", "web").await.unwrap();
    assert_eq!(
        restarted.engine.converge(&web_key()).await.unwrap(),
        Outcome::Unchanged
    );
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_endpoint_change_updates_pool_only() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();
    h.builder.build_l4_service("default", "web").await.unwrap();
    h.engine.converge(&web_key()).await.unwrap();
    h.backend.clear_calls();

    h.endpoints
        .apply_watcher_event(&Event::Apply(endpoints("web", &["10.0.0.1", "10.0.0.3"])));
    h.builder.build_l4_service("default", "web").await.unwrap();
    h.engine.converge(&web_key()).await.unwrap();

    assert_eq!(h.backend.calls(), vec![format!("update pool {POOL}")]);
}

#[tokio::test]
async fn test_recreated_pool_is_repointed_by_policy_set() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();
    h.builder.build_l4_service("default", "web").await.unwrap();
    h.engine.converge(&web_key()).await.unwrap();
    let old_pool = h.backend.uuid_of(ObjectType::Pool, POOL).unwrap();

    // Pool removed behind the operator's back, then the endpoints change
    h.backend.remove(&old_pool);
    h.endpoints
        .apply_watcher_event(&Event::Apply(endpoints("web", &["10.0.0.1", "10.0.0.3"])));
    h.builder.build_l4_service("default", "web").await.unwrap();

    // The update hits 404 and evicts the pool; the next pass recreates it
    assert!(h.engine.converge(&web_key()).await.is_err());
    h.backend.clear_calls();
    h.engine.converge(&web_key()).await.unwrap();

    assert_eq!(
        h.backend.calls(),
        vec![
            format!("create pool {POOL}"),
            format!("update l4policyset {VS}"),
            format!("update virtualservice {VS}"),
        ]
    );
    let new_pool = h.backend.uuid_of(ObjectType::Pool, POOL).unwrap();
    assert_ne!(new_pool, old_pool);
    let policy_uuid = h.backend.uuid_of(ObjectType::L4PolicySet, VS).unwrap();
    let policy = h.backend.objects.lock()[&policy_uuid].1.clone();
    let mut refs = Vec::new();
    references(&policy, &mut refs);
    assert_eq!(refs, vec![new_pool]);

    // Converged again
    h.backend.clear_calls();
    assert_eq!(h.engine.converge(&web_key()).await.unwrap(), Outcome::Unchanged);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_deletion_removes_parent_first_and_is_idempotent() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();
    h.builder.build_l4_service("default", "web").await.unwrap();
    h.engine.converge(&web_key()).await.unwrap();
    h.backend.clear_calls();

    h.services.apply_watcher_event(&Event::Delete(lb_service("web")));
    h.builder.build_l4_service("default", "web").await.unwrap();
    assert!(h.store.get(&web_key()).unwrap().is_tombstone());

    // VIP removed behind the operator's back; its delete still succeeds
    let vip_uuid = h.backend.uuid_of(ObjectType::VsVip, VS).unwrap();
    h.backend.remove(&vip_uuid);

    let outcome = h.engine.converge(&web_key()).await.unwrap();
    assert_eq!(outcome, Outcome::Deleted(4));
    assert_eq!(
        h.backend.calls(),
        vec![
            format!("delete virtualservice {VS}"),
            format!("delete l4policyset {VS}"),
            format!("delete pool {POOL}"),
            format!("delete vsvip {vip_uuid}"),
        ]
    );
    assert!(h.backend.names(ObjectType::VirtualService).is_empty());
    assert!(h.backend.names(ObjectType::Pool).is_empty());
    assert!(h.cache.virtual_services.get(&web_key()).is_none());

    h.backend.clear_calls();
    assert_eq!(h.engine.converge(&web_key()).await.unwrap(), Outcome::Unchanged);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_boot_full_sync_sweeps_stale_objects() {
    let backend = FakeBackend::seeded();
    {
        let mut first = Harness::boot(backend.clone()).await;
        first.apply_web();
        first.builder.build_l4_service("default", "web").await.unwrap();
        first.engine.converge(&web_key()).await.unwrap();
    }
    // Left behind by an earlier run, referenced by nothing
    backend.insert(
        ObjectType::Pool,
        json!({"uuid": "pool-orphan", "name": "prod--default-gone-TCP-80", "tenant_ref": tenant_ref("admin")}),
    );
    // Another cluster's object sharing the tenant
    backend.insert(
        ObjectType::VirtualService,
        json!({"uuid": "vs-foreign", "name": "other--default-web", "tenant_ref": tenant_ref("admin")}),
    );

    // The Service was deleted while the operator was down
    let h = Harness::boot(backend.clone()).await;
    h.ingestion_queue.run(h.builder.clone());
    h.graph_queue.run(h.engine.clone());

    let sync = h.full_sync();
    let report = sync.run_once(SyncTrigger::Boot).await;
    assert!(h.graph_queue.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(report.stale, 1);
    assert_eq!(report.markers, 1);
    assert!(sync.ready_flag().load(Ordering::Acquire));
    assert_eq!(
        backend.names(ObjectType::VirtualService),
        vec!["other--default-web".to_string()]
    );
    assert!(backend.names(ObjectType::Pool).is_empty());
    assert!(backend.names(ObjectType::VsVip).is_empty());
    assert!(backend.names(ObjectType::L4PolicySet).is_empty());
    assert!(h.cache.dummy_keys().is_empty());

    h.graph_queue.shut_down().await;
    h.ingestion_queue.shut_down().await;
}

#[tokio::test]
async fn test_boot_full_sync_converges_and_resyncs_status() {
    let mut h = Harness::boot(FakeBackend::seeded()).await;
    h.apply_web();
    h.ingestion_queue.run(h.builder.clone());
    h.graph_queue.run(h.engine.clone());

    let sync = h.full_sync();
    sync.run_once(SyncTrigger::Boot).await;
    assert!(h.graph_queue.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(h.backend.names(ObjectType::VirtualService), vec![VS.to_string()]);
    let accepted = SyncOutcome::Accepted {
        addresses: vec!["192.0.2.10".to_string()],
    };
    let statuses = h.status.0.lock().clone();
    assert!(statuses
        .iter()
        .any(|(service, outcome)| service.name == "web" && *outcome == accepted));

    // A second pass with nothing changed only reads
    h.backend.clear_calls();
    sync.run_once(SyncTrigger::Periodic).await;
    assert!(h.graph_queue.wait_idle(Duration::from_secs(5)).await);
    assert!(h.backend.calls().is_empty());

    h.graph_queue.shut_down().await;
    h.ingestion_queue.shut_down().await;
}

#[tokio::test]
async fn test_boot_before_ingestion_drains_keeps_live_service() {
    let backend = FakeBackend::seeded();
    {
        let mut first = Harness::boot(backend.clone()).await;
        first.apply_web();
        first.builder.build_l4_service("default", "web").await.unwrap();
        first.engine.converge(&web_key()).await.unwrap();
    }

    // Restarted while the Service still exists; ingestion has not caught up
    let mut h = Harness::boot(backend.clone()).await;
    h.apply_web();
    h.graph_queue.run(h.engine.clone());

    let sync = h.full_sync_waiting(Duration::from_millis(200));
    let report = sync.run_once(SyncTrigger::Boot).await;
    assert!(h.graph_queue.wait_idle(Duration::from_secs(5)).await);

    assert!(!report.settled);
    assert_eq!(report.stale, 0);
    assert!(!sync.ready_flag().load(Ordering::Acquire));
    assert_eq!(backend.names(ObjectType::VirtualService), vec![VS.to_string()]);
    assert_eq!(backend.names(ObjectType::Pool), vec![POOL.to_string()]);

    // Once ingestion runs, the repeated boot pass settles with nothing to delete
    h.ingestion_queue.run(h.builder.clone());
    let report = sync.run_once(SyncTrigger::Boot).await;
    assert!(h.graph_queue.wait_idle(Duration::from_secs(5)).await);

    assert!(report.settled);
    assert_eq!(report.stale, 0);
    assert!(sync.ready_flag().load(Ordering::Acquire));
    assert_eq!(backend.names(ObjectType::VirtualService), vec![VS.to_string()]);

    h.graph_queue.shut_down().await;
    h.ingestion_queue.shut_down().await;
}
