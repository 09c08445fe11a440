//! Full sync and stale-object sweep
//!
//! A full sync re-derives everything from scratch so drift is corrected even
//! without a triggering event:
//!
//! 1. refresh VRF contexts and health monitors in the cache
//! 2. re-ingest every resource with load-balancer intent and wait for the
//!    builder to go idle
//! 3. publish the VRF model first and give it a bounded time to converge
//! 4. reset retry counters and publish every model
//! 5. tombstone cached virtual services without a model (stale sweep)
//!
//! The boot variant then deletes the stale-data markers gathered by
//! `populate` and re-writes Service statuses from the cache.
//!
//! Steps 5 and later only run once ingestion went idle: until then the store
//! may lack models for live Services and the sweep would delete them. An
//! unsettled boot pass is repeated until one settles.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lbsync_common::NameBuilder;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendClient, ObjectType};
use crate::cache::BackendCache;
use crate::engine::ConvergenceEngine;
use crate::graph::{ClusterView, GraphStore};
use crate::keys::ModelKey;
use crate::metrics;
use crate::workqueue::WorkQueue;

/// What started a full sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Boot,
    Periodic,
    Quick,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Periodic => "periodic",
            Self::Quick => "quick",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FullSyncSettings {
    pub names: NameBuilder,
    pub default_tenant: String,
    /// VRF model published ahead of the others; `None` when static routes
    /// are disabled
    pub vrf_key: Option<ModelKey>,
    pub vrf_settle: Duration,
    /// Upper bound for each wait on a queue to drain
    pub idle_timeout: Duration,
    /// Periodic pass interval; `None` disables it
    pub interval: Option<Duration>,
}

/// Delay before repeating a boot pass whose ingestion did not settle
const BOOT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Counts of one full sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub ingested: usize,
    pub published: usize,
    pub stale: usize,
    pub markers: usize,
    /// Ingestion drained within the idle timeout
    pub settled: bool,
}

pub struct FullSync {
    client: Arc<dyn BackendClient>,
    cache: Arc<BackendCache>,
    store: Arc<GraphStore>,
    view: ClusterView,
    ingestion_queue: Arc<WorkQueue>,
    graph_queue: Arc<WorkQueue>,
    engine: Arc<ConvergenceEngine>,
    settings: FullSyncSettings,
    ready: Arc<AtomicBool>,
}

impl FullSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn BackendClient>,
        cache: Arc<BackendCache>,
        store: Arc<GraphStore>,
        view: ClusterView,
        ingestion_queue: Arc<WorkQueue>,
        graph_queue: Arc<WorkQueue>,
        engine: Arc<ConvergenceEngine>,
        settings: FullSyncSettings,
    ) -> Self {
        Self {
            client,
            cache,
            store,
            view,
            ingestion_queue,
            graph_queue,
            engine,
            settings,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the boot full sync finished
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    #[instrument(skip(self), fields(trigger = %trigger))]
    pub async fn run_once(&self, trigger: SyncTrigger) -> FullSyncReport {
        let started = Instant::now();
        let mut report = FullSyncReport::default();
        info!("Full sync started");

        if let Err(e) = self
            .cache
            .refresh(self.client.as_ref(), &self.settings.names, &self.settings.default_tenant)
            .await
        {
            warn!(error = %e, "Cache refresh failed, keeping previous entries");
        }

        // Re-ingest from the cluster so models reflect the current state
        let mut sources: BTreeSet<String> = self
            .view
            .ingestion_keys()
            .into_iter()
            .map(|key| key.to_string())
            .collect();
        sources.extend(self.store_sources());
        for key in &sources {
            self.ingestion_queue.add(key.as_str());
        }
        report.ingested = sources.len();
        report.settled = self.ingestion_queue.wait_idle(self.settings.idle_timeout).await;
        if !report.settled {
            warn!("Ingestion did not settle, skipping stale cleanup for this pass");
        }

        if let Some(vrf_key) = self.settings.vrf_key.as_ref().filter(|k| self.store.contains(k)) {
            let vrf_key = vrf_key.to_string();
            self.graph_queue.add(vrf_key.as_str());
            if !self.graph_queue.wait_done(&vrf_key, self.settings.vrf_settle).await {
                warn!(model_key = %vrf_key, "VRF model did not converge in time");
            }
        }

        self.store.reset_all_retries();
        for key in self.store.keys() {
            if self.settings.vrf_key.as_ref() == Some(&key) {
                continue;
            }
            self.graph_queue.add(key.to_string());
            report.published += 1;
        }

        if report.settled {
            report.stale = self.sweep_stale();
        }

        if trigger == SyncTrigger::Boot && report.settled {
            report.markers = self.delete_markers().await;
            self.resync_statuses().await;
            self.ready.store(true, Ordering::Release);
        }

        self.cache.update_metrics();
        metrics::set_graph_models(self.store.len());
        metrics::record_full_sync(trigger.as_str(), started.elapsed());
        info!(
            ingested = report.ingested,
            published = report.published,
            stale = report.stale,
            markers = report.markers,
            settled = report.settled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Full sync finished"
        );
        report
    }

    /// Tombstone cached virtual services that have no model
    fn sweep_stale(&self) -> usize {
        let mut stale = 0;
        for key in self.cache.virtual_services.keys() {
            if BackendCache::is_dummy(&key) || self.store.contains(&key) {
                continue;
            }
            info!(model_key = %key, "Stale virtual service, scheduling deletion");
            self.store.save(&key, None);
            self.graph_queue.add(key.to_string());
            metrics::record_stale_deleted(ObjectType::VirtualService.path());
            stale += 1;
        }
        stale
    }

    /// Every ingestion key that currently has a model
    fn store_sources(&self) -> Vec<String> {
        let mut namespaces: BTreeSet<String> = BTreeSet::new();
        for svc in self.view.services.state() {
            if let Some(ns) = svc.metadata.namespace.clone() {
                namespaces.insert(ns);
            }
        }
        for key in self.view.namespaces.state() {
            if let Some(ns) = key.metadata.name.clone() {
                namespaces.insert(ns);
            }
        }
        namespaces
            .iter()
            .flat_map(|ns| self.store.sources_in_namespace(ns))
            .map(|key| key.to_string())
            .collect()
    }

    /// Converge the stale-data markers once everything else settled
    async fn delete_markers(&self) -> usize {
        if !self.graph_queue.wait_idle(self.settings.idle_timeout).await {
            warn!("Graph queue did not settle before marker deletion");
        }
        let markers = self.cache.dummy_keys();
        for key in &markers {
            info!(model_key = %key, "Deleting stale-data marker");
            self.graph_queue.add(key.to_string());
        }
        markers.len()
    }

    async fn resync_statuses(&self) {
        if !self.graph_queue.wait_idle(self.settings.idle_timeout).await {
            warn!("Graph queue did not settle before status re-sync");
        }
        for key in self.cache.virtual_services.keys() {
            if BackendCache::is_dummy(&key) || self.store.graph(&key).is_none() {
                continue;
            }
            self.engine.sync_status(&key).await;
        }
        debug!("Service statuses re-synced");
    }

    /// Boot sync on the first trigger, then periodic and on-demand passes
    pub async fn run_loop(self: Arc<Self>, mut quick: mpsc::Receiver<()>) {
        if quick.recv().await.is_none() {
            return;
        }
        let mut booted = self.run_once(SyncTrigger::Boot).await.settled;

        let period = self.settings.interval.unwrap_or(Duration::MAX);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + clamp(period), clamp(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let trigger = tokio::select! {
                _ = ticker.tick(), if self.settings.interval.is_some() => SyncTrigger::Periodic,
                _ = tokio::time::sleep(BOOT_RETRY_INTERVAL), if !booted => SyncTrigger::Boot,
                message = quick.recv() => match message {
                    Some(()) => SyncTrigger::Quick,
                    None => {
                        debug!("Quick sync channel closed");
                        return;
                    }
                },
            };
            // Until a boot pass settles every pass is a boot pass
            let trigger = if booted { trigger } else { SyncTrigger::Boot };
            booted |= self.run_once(trigger).await.settled;
        }
    }
}

/// Keep `Instant` arithmetic in range for very long intervals
fn clamp(period: Duration) -> Duration {
    period.min(Duration::from_secs(365 * 24 * 3600))
}
