//! Leadership over the backend.
//!
//! Every replica watches the cluster, builds graphs and keeps its backend
//! cache warm; only the holder of a Kubernetes Lease (via
//! `kube-leader-election`) converges. [`LeaderGate`] is the switch the
//! convergence engine checks before each key.
//!
//! A replica that loses the lease closes the gate and its renewal task ends,
//! which stops the process; it comes back as a standby.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

/// Setting this enables leader election
pub const LEASE_NAME_ENV: &str = "LBSYNC_LEASE_NAME";
pub const LEASE_TTL_ENV: &str = "LBSYNC_LEASE_TTL_SECONDS";

const DEFAULT_LEASE_TTL_SECS: u64 = 15;

/// Consecutive renewal errors tolerated before giving up the lease
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Gates backend-mutating work on leadership
#[derive(Debug)]
pub struct LeaderGate {
    leader: AtomicBool,
    quick_sync: Option<mpsc::Sender<()>>,
}

impl LeaderGate {
    /// Gate starting as follower; becoming leader sends on `quick_sync`
    pub fn new(quick_sync: mpsc::Sender<()>) -> Self {
        Self {
            leader: AtomicBool::new(false),
            quick_sync: Some(quick_sync),
        }
    }

    /// Gate that is open from the start and triggers nothing
    pub fn always_leader() -> Self {
        Self {
            leader: AtomicBool::new(true),
            quick_sync: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn became_leader(&self) {
        let was_leader = self.leader.swap(true, Ordering::AcqRel);
        if was_leader {
            return;
        }
        info!("Became leader, convergence enabled");
        if let Some(tx) = &self.quick_sync {
            if let Err(e) = tx.try_send(()) {
                // A pending trigger already covers this one
                warn!(error = %e, "Quick sync trigger not delivered");
            }
        }
    }

    pub fn became_follower(&self) {
        if self.leader.swap(false, Ordering::AcqRel) {
            warn!("Lost leadership, convergence disabled");
        }
    }
}

/// Lease used for leader election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    pub lease_name: String,
    pub namespace: String,
    pub holder_id: String,
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
}

impl LeaseSettings {
    /// Read the lease from the pod environment. `None` when
    /// `LBSYNC_LEASE_NAME` is unset, in which case this replica is the only
    /// one and leads from boot. The lease is renewed every third of its TTL.
    pub fn from_env() -> Result<Option<Self>> {
        let lease_name = match std::env::var(LEASE_NAME_ENV) {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => return Ok(None),
        };
        let namespace = std::env::var("POD_NAMESPACE")
            .with_context(|| format!("POD_NAMESPACE required when {LEASE_NAME_ENV} is set"))?;
        let holder_id = std::env::var("POD_NAME")
            .with_context(|| format!("POD_NAME required when {LEASE_NAME_ENV} is set"))?;

        let ttl_secs = match std::env::var(LEASE_TTL_ENV) {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("{LEASE_TTL_ENV} is not a number of seconds: {value}"))?,
            Err(_) => DEFAULT_LEASE_TTL_SECS,
        };
        ensure!(ttl_secs >= 3, "{LEASE_TTL_ENV} must be at least 3 seconds");

        Ok(Some(Self {
            lease_name,
            namespace,
            holder_id,
            lease_ttl: Duration::from_secs(ttl_secs),
            renew_interval: Duration::from_secs(ttl_secs / 3),
        }))
    }
}

fn lease_holder(result: &LeaseLockResult) -> &str {
    result
        .lease
        .as_ref()
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

pub struct LeaderElection {
    lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, settings: &LeaseSettings) -> Self {
        let lock = LeaseLock::new(
            client,
            &settings.namespace,
            LeaseLockParams {
                holder_id: settings.holder_id.clone(),
                lease_name: settings.lease_name.clone(),
                lease_ttl: settings.lease_ttl,
            },
        );
        Self {
            lock,
            renew_interval: settings.renew_interval,
        }
    }

    /// Wait until this replica holds the lease
    pub async fn acquire(&self) {
        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Lease acquired");
                    return;
                }
                Ok(result) => {
                    info!(holder = %lease_holder(&result), "Standing by, lease held elsewhere");
                }
                Err(e) => warn!(error = %e, "Lease check failed"),
            }
            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Keep renewing the lease. The task ends, after closing `gate`, when
    /// another replica takes the lease or renewal keeps failing; its output
    /// says why.
    pub fn spawn_renewal_task(self, gate: Arc<LeaderGate>) -> JoinHandle<anyhow::Error> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut failures: u32 = 0;

            let reason = loop {
                ticker.tick().await;
                match self.lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {
                        failures = 0;
                        trace!("Lease renewed");
                    }
                    Ok(result) => {
                        break anyhow!("lease taken over by {}", lease_holder(&result));
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= MAX_RENEWAL_FAILURES {
                            break anyhow::Error::new(e)
                                .context(format!("lease renewal failed {failures} times"));
                        }
                        warn!(error = %e, failures, "Lease renewal failed, retrying");
                    }
                }
            };
            gate.became_follower();
            reason
        })
    }
}
