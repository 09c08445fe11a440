use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Secret, Service};
use kube::api::ListParams;
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lbsync_common::{created_by, NameBuilder};
use lbsync_operator::backend::{BackendClient, ClientSettings, RestBackendClient};
use lbsync_operator::cache::BackendCache;
use lbsync_operator::config::{LbSyncConfig, LbSyncConfigSpec};
use lbsync_operator::controllers::namespace::TenantResolver;
use lbsync_operator::controllers::{self, Dispatcher};
use lbsync_operator::engine::{ConvergenceEngine, EngineSettings};
use lbsync_operator::fullsync::{FullSync, FullSyncSettings};
use lbsync_operator::graph::builder::BuilderSettings;
use lbsync_operator::graph::{ClusterView, GraphBuilder, GraphStore};
use lbsync_operator::health::{self, HealthState, DEFAULT_HEALTH_PORT};
use lbsync_operator::keys::{ingestion_shard_key, model_shard_key};
use lbsync_operator::leader::{LeaderElection, LeaderGate, LeaseSettings};
use lbsync_operator::retry::{RequeueHandler, RetryClassifier, RetryPolicy};
use lbsync_operator::status::KubeStatusWriter;
use lbsync_operator::workqueue::WorkQueue;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, RUST_LOG with an info fallback
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("lbsync-operator starting");

    let prometheus = lbsync_operator::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let config = load_config(&kube_client)
        .await
        .context("Failed to load LbSyncConfig")?;
    config.validate().context("Invalid LbSyncConfig")?;

    info!(
        cluster = %config.cluster_name,
        endpoint = %config.controller.endpoint,
        default_tenant = %config.default_tenant,
        "Loaded configuration"
    );

    let (token, ca_cert) = load_credentials(&kube_client, &config)
        .await
        .context("Failed to load controller credentials")?;

    let backend: Arc<dyn BackendClient> = Arc::new(
        RestBackendClient::new(
            config.controller.endpoint.clone(),
            token,
            ca_cert.as_deref(),
            ClientSettings {
                api_version: config.controller.api_version.clone(),
                cloud_name: config.controller.cloud_name.clone(),
                created_by: created_by(&config.cluster_name),
                timeout: config.request_timeout(),
            },
        )
        .context("Failed to create controller client")?,
    );

    let names = NameBuilder::new(config.cluster_name.as_str());

    // Without a populated cache every model would look new; refuse to start
    let cache = Arc::new(BackendCache::new());
    let summary = cache
        .populate(backend.as_ref(), &names, &config.default_tenant)
        .await
        .context("Failed to populate backend cache")?;
    info!(?summary, "Backend cache populated");

    let store = Arc::new(GraphStore::new());

    let ingestion_queue = WorkQueue::new("ingestion", config.queues.ingestion_shards, ingestion_shard_key);
    let graph_queue = WorkQueue::new("graph", config.queues.graph_shards, model_shard_key);
    let fast_retry_queue = WorkQueue::new("fast-retry", config.queues.graph_shards, model_shard_key);
    let slow_retry_queue = WorkQueue::new("slow-retry", config.queues.graph_shards, model_shard_key);

    let (quick_tx, quick_rx) = mpsc::channel(1);
    let gate = Arc::new(LeaderGate::new(quick_tx));
    let status = Arc::new(KubeStatusWriter::new(kube_client.clone()));

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

    let builder = Arc::new(GraphBuilder::new(
        view.clone(),
        TenantResolver::new(
            view.namespaces.clone(),
            config.namespace_tenants.clone(),
            config.default_tenant.clone(),
        ),
        BuilderSettings {
            names: names.clone(),
            vrf: config.vrf.clone(),
            vrf_tenant: config.default_tenant.clone(),
        },
        store.clone(),
        graph_queue.clone(),
        status.clone(),
        gate.clone(),
    ));
    let vrf_key = config.vrf.static_routes.then(|| builder.vrf_key());

    let retry = Arc::new(RetryClassifier::new(
        RetryPolicy::from(&config.retry),
        store.clone(),
        fast_retry_queue.clone(),
        slow_retry_queue.clone(),
    ));
    let engine = Arc::new(ConvergenceEngine::new(
        backend.clone(),
        cache.clone(),
        store.clone(),
        retry,
        status,
        gate.clone(),
        EngineSettings {
            names: names.clone(),
            default_tenant: config.default_tenant.clone(),
            delete_poll_attempts: config.deletion.poll_attempts,
            delete_poll_interval: Duration::from_millis(config.deletion.poll_interval_millis),
        },
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        view.clone(),
        store.clone(),
        ingestion_queue.clone(),
    ));

    info!("Starting watchers");
    let service_watch = tokio::spawn(controllers::service::run_services(
        kube_client.clone(),
        services,
        dispatcher.clone(),
    ));
    let endpoints_watch = tokio::spawn(controllers::service::run_endpoints(
        kube_client.clone(),
        endpoints,
        dispatcher.clone(),
    ));
    let node_watch = tokio::spawn(controllers::node::run(
        kube_client.clone(),
        nodes,
        dispatcher.clone(),
    ));
    let namespace_watch = tokio::spawn(controllers::namespace::run(
        kube_client.clone(),
        namespaces,
        dispatcher,
    ));

    // Models built before the namespace/endpoint stores are filled would be wrong
    tokio::try_join!(
        view.services.wait_until_ready(),
        view.endpoints.wait_until_ready(),
        view.nodes.wait_until_ready(),
        view.namespaces.wait_until_ready(),
    )
    .context("Watcher stopped before initial list completed")?;
    info!("Watchers synced");

    ingestion_queue.run(builder);
    graph_queue.run(engine.clone());
    fast_retry_queue.run(Arc::new(RequeueHandler::new(graph_queue.clone())));
    slow_retry_queue.run(Arc::new(RequeueHandler::new(graph_queue.clone())));

    let full_sync = Arc::new(FullSync::new(
        backend.clone(),
        cache,
        store,
        view,
        ingestion_queue.clone(),
        graph_queue.clone(),
        engine,
        FullSyncSettings {
            names,
            default_tenant: config.default_tenant.clone(),
            vrf_key,
            vrf_settle: Duration::from_secs(config.full_sync.vrf_settle_seconds),
            idle_timeout: config.full_sync_idle_timeout(),
            interval: config.full_sync_interval(),
        },
    ));

    let health_port = health_port();
    let health_state = Arc::new(HealthState::new(
        full_sync.ready_flag(),
        backend,
        Some(prometheus),
    ));
    let health_server = tokio::spawn(health::run_health_server(health_state, health_port));
    let sync_loop = tokio::spawn(full_sync.run_loop(quick_rx));

    let lease_renewal = match LeaseSettings::from_env()? {
        Some(lease) => {
            info!(
                lease = %lease.lease_name,
                namespace = %lease.namespace,
                holder = %lease.holder_id,
                "Leader election enabled"
            );
            let election = LeaderElection::new(kube_client.clone(), &lease);
            election.acquire().await;
            gate.became_leader();
            Some(election.spawn_renewal_task(gate.clone()))
        }
        None => {
            info!("Leader election disabled, running as leader");
            gate.became_leader();
            None
        }
    };

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let result = select! {
        result = service_watch => handle_task_exit("Service watcher", result),
        result = endpoints_watch => handle_task_exit("Endpoints watcher", result),
        result = node_watch => handle_task_exit("Node watcher", result),
        result = namespace_watch => handle_task_exit("Namespace watcher", result),
        result = sync_loop => handle_task_exit("Full sync loop", result),
        result = lease_lost(lease_renewal) => result,
        result = health_server => match result {
            Ok(Ok(())) => handle_task_exit("Health server", Ok(())),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("Health server failed")),
            Err(e) => handle_task_exit("Health server", Err(e)),
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            Ok(())
        }
    };

    // Workers finish their current key; pending keys are rebuilt by the next boot sync
    info!("Stopping queues");
    tokio::join!(
        ingestion_queue.shut_down(),
        graph_queue.shut_down(),
        fast_retry_queue.shut_down(),
        slow_retry_queue.shut_down(),
    );
    info!("Shutdown complete");

    result
}

/// Resolves once the lease renewal task gives up; never without election
async fn lease_lost(renewal: Option<JoinHandle<anyhow::Error>>) -> Result<()> {
    let Some(handle) = renewal else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(reason) => Err(reason.context("Lost leadership")),
        Err(e) => Err(anyhow::Error::new(e).context("Lease renewal task failed")),
    }
}

/// Load singleton LbSyncConfig from cluster
async fn load_config(client: &Client) -> Result<LbSyncConfigSpec> {
    let api: Api<LbSyncConfig> = Api::all(client.clone());
    let configs = api.list(&ListParams::default()).await?;

    let Some(first) = configs.items.first() else {
        bail!("No LbSyncConfig found in cluster - please create one");
    };

    if configs.items.len() > 1 {
        warn!(
            count = configs.items.len(),
            "Multiple LbSyncConfig resources found, using first one"
        );
    }

    Ok(first.spec.clone())
}

/// Load the API token and optional CA bundle from the referenced Secret
async fn load_credentials(
    client: &Client,
    config: &LbSyncConfigSpec,
) -> Result<(String, Option<Vec<u8>>)> {
    let secret_ref = &config.controller.credentials_secret_ref;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);

    let secret = secrets.get(&secret_ref.name).await.with_context(|| {
        format!(
            "Secret {}/{} not found",
            secret_ref.namespace, secret_ref.name
        )
    })?;

    let data = secret.data.as_ref().context("Secret has no data field")?;

    let token = data.get("token").context("Secret missing token")?;
    let token = String::from_utf8(token.0.clone())
        .context("Secret token is not valid UTF-8")?
        .trim()
        .to_string();

    let ca_cert = data.get("ca.crt").map(|ca| ca.0.clone());

    info!(
        secret_name = %secret_ref.name,
        secret_namespace = %secret_ref.namespace,
        custom_ca = ca_cert.is_some(),
        "Loaded controller credentials"
    );

    Ok((token, ca_cert))
}

fn health_port() -> u16 {
    match std::env::var("HEALTH_PORT") {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!(value = %value, default = DEFAULT_HEALTH_PORT, "Invalid HEALTH_PORT, using default");
            DEFAULT_HEALTH_PORT
        }),
        Err(_) => DEFAULT_HEALTH_PORT,
    }
}

/// Map a background task exit to an error so the pod restarts
fn handle_task_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            error!(task = name, "Task exited unexpectedly");
            bail!("{} exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(task = name, "Task panicked");
            bail!("{} panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(task = name, "Task was cancelled");
            bail!("{} was cancelled", name)
        }
        Err(e) => {
            error!(task = name, error = ?e, "Task failed");
            bail!("{} task failed: {}", name, e)
        }
    }
}
