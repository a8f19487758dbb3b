use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client, ResourceExt};
use tokio::{sync::RwLock, task::JoinSet};
use tracing::*;

use crate::cache::{reflect, Cache, Change};
use crate::cluster::{ClusterClient, KubeCluster};
use crate::controllers::{Diagnostics, State};
use crate::leader_election::{self, monitor_leadership, wait_for_leadership, LeaderElectionConfig, LeaseTask};
use crate::provisioner::Provisioner;
use crate::volume_store::VolumeStore;
use crate::workqueue::WorkQueue;
use crate::{Error, Metrics, Result};

use super::config::Config;
use super::reconcilers::{claim, volume};

// Context for our reconcilers
pub struct Context<P, C> {
    pub config: Config,
    /// Storage backend
    pub provisioner: Arc<P>,
    /// Write path to the cluster
    pub cluster: C,
    pub claims: Cache<PersistentVolumeClaim>,
    pub volumes: Cache<PersistentVolume>,
    pub classes: Cache<StorageClass>,
    /// Claims keyed by UID
    pub claim_queue: WorkQueue<String>,
    /// Volumes keyed by name
    pub volume_queue: WorkQueue<String>,
    // claims with provisioning running in the backend, by UID
    claims_in_progress: Mutex<HashMap<String, Arc<PersistentVolumeClaim>>>,
    pub volume_store: VolumeStore<P, C>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl<P: Provisioner, C: ClusterClient> Context<P, C> {
    pub fn new(
        config: Config,
        provisioner: Arc<P>,
        cluster: C,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        let claims = Cache::new();
        let rate_limiter = config.rate_limiter();
        Self {
            volume_store: VolumeStore::new(
                config.volume_store,
                provisioner.clone(),
                cluster.clone(),
                claims.clone(),
            ),
            claim_queue: WorkQueue::new("claims", rate_limiter),
            volume_queue: WorkQueue::new("volumes", rate_limiter),
            claims,
            volumes: Cache::new(),
            classes: Cache::new(),
            claims_in_progress: Mutex::new(HashMap::new()),
            config,
            provisioner,
            cluster,
            diagnostics,
            metrics,
        }
    }

    fn in_progress(&self) -> MutexGuard<'_, HashMap<String, Arc<PersistentVolumeClaim>>> {
        self.claims_in_progress
            .lock()
            .expect("claims in progress mutex poisoned")
    }

    pub fn claim_in_progress(&self, uid: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.in_progress().get(uid).cloned()
    }

    pub fn mark_in_progress(&self, claim: Arc<PersistentVolumeClaim>) {
        if let Some(uid) = claim.uid() {
            self.in_progress().insert(uid, claim);
        }
    }

    pub fn clear_in_progress(&self, uid: &str) {
        self.in_progress().remove(uid);
    }

    pub fn storage_class(&self, name: &str) -> Result<Arc<StorageClass>> {
        self.classes
            .get(name)
            .ok_or_else(|| Error::StorageClassNotFound(name.to_string()))
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, operation: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => operation.await,
    }
}

/// Syncs one claim and decides whether and when it is retried.
pub(crate) async fn process_claim<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, uid: &String) {
    let result = with_timeout(
        ctx.config.provision_timeout,
        claim::sync_claim_handler(ctx, uid),
    )
    .await;

    let err = match result {
        Ok(()) => {
            ctx.claim_queue.forget(uid);
            // provisioning either succeeded or the claim is not ours
            ctx.clear_in_progress(uid);
            return;
        }
        Err(err) => err,
    };

    let threshold = ctx.config.failed_provision_threshold;
    let failures = ctx.claim_queue.num_requeues(uid);
    if threshold == 0 {
        warn!(claim = %uid, failures, reason = err.metric_label(), "Retrying syncing claim: {err}");
        ctx.claim_queue.add_rate_limited(uid.clone());
    } else if failures < threshold {
        warn!(claim = %uid, failures, reason = err.metric_label(), threshold, "Retrying syncing claim: {err}");
        ctx.claim_queue.add_rate_limited(uid.clone());
    } else {
        error!(claim = %uid, failures, reason = err.metric_label(), threshold, "Giving up syncing claim: {err}");
        // a background provisioning of this claim is no longer tracked; the claim's retry
        // count is kept until the next watch event re-adds it
        ctx.clear_in_progress(uid);
    }
}

/// Syncs one volume and decides whether and when it is retried.
pub(crate) async fn process_volume<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, name: &String) {
    let result = with_timeout(
        ctx.config.deletion_timeout,
        volume::sync_volume_handler(ctx, name),
    )
    .await;

    let Err(err) = result else {
        ctx.volume_queue.forget(name);
        return;
    };

    let threshold = ctx.config.failed_delete_threshold;
    let failures = ctx.volume_queue.num_requeues(name);
    if threshold == 0 {
        warn!(volume = %name, failures, reason = err.metric_label(), "Retrying syncing volume: {err}");
        ctx.volume_queue.add_rate_limited(name.clone());
    } else if failures < threshold {
        warn!(volume = %name, failures, reason = err.metric_label(), threshold, "Retrying syncing volume: {err}");
        ctx.volume_queue.add_rate_limited(name.clone());
    } else {
        error!(volume = %name, failures, reason = err.metric_label(), threshold, "Giving up syncing volume: {err}");
    }
}

async fn claim_worker<P: Provisioner, C: ClusterClient>(ctx: Arc<Context<P, C>>) {
    while let Some(uid) = ctx.claim_queue.get().await {
        process_claim(&ctx, &uid).await;
        ctx.claim_queue.done(&uid);
    }
}

async fn volume_worker<P: Provisioner, C: ClusterClient>(ctx: Arc<Context<P, C>>) {
    while let Some(name) = ctx.volume_queue.get().await {
        process_volume(&ctx, &name).await;
        ctx.volume_queue.done(&name);
    }
}

/// Periodically queues every cached claim and volume again.
async fn resync<P: Provisioner, C: ClusterClient>(ctx: Arc<Context<P, C>>) {
    let mut ticker = tokio::time::interval(ctx.config.resync_period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if ctx.claim_queue.is_shutting_down() {
            return;
        }
        debug!("Resyncing claims and volumes");
        for claim in ctx.claims.list() {
            if let Some(uid) = claim.uid() {
                ctx.claim_queue.add(uid);
            }
        }
        for name in ctx.volumes.keys() {
            ctx.volume_queue.add(name);
        }
    }
}

/// Stops tracking a deleted volume, releasing it if a worker still holds it.
fn forget_volume(queue: &WorkQueue<String>, name: &String) {
    queue.forget(name);
    queue.done(name);
}

/// Watches claims, volumes and classes and runs the workers until the queues shut down.
async fn run_controller<P: Provisioner>(client: Client, ctx: Arc<Context<P, KubeCluster>>) -> Result<()> {
    info!(provisioner = %ctx.config.provisioner_name, "Starting provisioner controller");

    // dropping the sets aborts the watches and workers
    let mut watches = JoinSet::new();
    let claim_queue = ctx.claim_queue.clone();
    watches.spawn(reflect(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        ctx.claims.clone(),
        move |change| {
            // deleted claims are still looked up through the in progress set
            if let Change::Applied(claim) = change {
                if let Some(uid) = claim.uid() {
                    claim_queue.add(uid);
                }
            }
        },
    ));
    let volume_queue = ctx.volume_queue.clone();
    watches.spawn(reflect(
        Api::<PersistentVolume>::all(client.clone()),
        ctx.volumes.clone(),
        move |change| match change {
            Change::Applied(volume) => volume_queue.add(volume.name_any()),
            Change::Deleted(volume) => forget_volume(&volume_queue, &volume.name_any()),
        },
    ));
    watches.spawn(reflect(
        Api::<StorageClass>::all(client),
        ctx.classes.clone(),
        |_| {},
    ));

    tokio::join!(
        ctx.claims.wait_until_ready(),
        ctx.volumes.wait_until_ready(),
        ctx.classes.wait_until_ready(),
    );
    debug!("Caches synced");

    let mut workers = JoinSet::new();
    for _ in 0..ctx.config.threadiness {
        workers.spawn(claim_worker(ctx.clone()));
        workers.spawn(volume_worker(ctx.clone()));
    }
    workers.spawn(resync(ctx.clone()));
    info!(provisioner = %ctx.config.provisioner_name, threadiness = ctx.config.threadiness, "Started provisioner controller");

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!("Worker stopped unexpectedly: {err}");
        }
        if ctx.claim_queue.is_shutting_down() {
            break;
        }
    }
    Ok(())
}

/// Runs the controller while holding the lease. Returns an error once the lease is lost.
///
/// The lease task is handed out through `lease` so the caller can release the lease after
/// this future is dropped.
async fn run_as_leader<P: Provisioner>(
    client: Client,
    ctx: Arc<Context<P, KubeCluster>>,
    config: LeaderElectionConfig,
    lease: &mut Option<LeaseTask>,
) -> Result<()> {
    let (mut leader, task) = leader_election::start(client.clone(), &config).await?;
    *lease = Some(task);

    wait_for_leadership(&mut leader).await?;
    info!(identity = %config.identity, "Acquired leader lease");
    ctx.diagnostics.write().await.leading = true;
    tokio::select! {
        result = run_controller(client, ctx.clone()) => result,
        result = monitor_leadership(leader) => {
            error!("Leader election lost");
            result
        }
    }
}

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!("Failed to listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run<P: Provisioner>(client: Client, provisioner: P, config: Config, state: State) -> Result<()> {
    let metrics = Metrics::default().register(&state.registry)?;
    let cluster = KubeCluster::new(client.clone(), &config.provisioner_name);
    let ctx = Arc::new(Context::new(
        config,
        Arc::new(provisioner),
        cluster,
        metrics,
        state.diagnostics.clone(),
    ));

    // saving volumes continues regardless of leadership
    let store = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.volume_store.run().await })
    };

    let mut lease = None;
    let controller = async {
        match ctx.config.leader_election.clone() {
            Some(election) => run_as_leader(client, ctx.clone(), election, &mut lease).await,
            None => {
                warn!("Leader election disabled, assuming a single instance");
                ctx.diagnostics.write().await.leading = true;
                run_controller(client, ctx.clone()).await
            }
        }
    };

    let result = tokio::select! {
        result = controller => result,
        _ = shutdown_signal() => Ok(()),
    };

    ctx.diagnostics.write().await.leading = false;
    // the leadership receivers went away with the controller future
    if let Some(lease) = lease {
        leader_election::release(lease).await;
    }

    ctx.claim_queue.shut_down();
    ctx.volume_queue.shut_down();
    ctx.volume_store.shut_down();
    if let Err(err) = store.await {
        warn!("Volume store stopped unexpectedly: {err}");
    }
    result
}
