use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::{
    cache::Cache,
    cluster::{is_already_exists, normal_event, warning_event, ClusterClient},
    provisioner::Provisioner,
    workqueue::{ItemExponentialBackoff, WorkQueue},
    Error, Result,
};

/// A fixed retry schedule: `steps` attempts, sleeping `duration` after the first failure and
/// multiplying the sleep by `factor` after each further one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            factor: 1.0,
            steps: 5,
        }
    }
}

impl Backoff {
    /// Runs `op` until it succeeds or the schedule is exhausted, returning the last error.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut delay = self.duration;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.steps => return Err(err),
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.factor);
                    attempt += 1;
                }
            }
        }
    }
}

/// How provisioned volumes are saved to the cluster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SaveStrategy {
    /// Retry on the provisioning worker; delete the backing asset when saving keeps failing.
    Blocking(Backoff),
    /// Retry forever in background workers, reporting success to the caller right away.
    Queue { workers: usize },
}

impl Default for SaveStrategy {
    fn default() -> Self {
        SaveStrategy::Blocking(Backoff::default())
    }
}

/// Makes provisioned volumes durable.
pub enum VolumeStore<P, C> {
    Blocking(BackoffStore<P, C>),
    Queue(QueueStore<C>),
}

impl<P: Provisioner, C: ClusterClient> VolumeStore<P, C> {
    pub fn new(
        strategy: SaveStrategy,
        provisioner: Arc<P>,
        cluster: C,
        claims: Cache<PersistentVolumeClaim>,
    ) -> Self {
        match strategy {
            SaveStrategy::Blocking(backoff) => VolumeStore::Blocking(BackoffStore {
                backoff,
                provisioner,
                cluster,
                claims,
            }),
            SaveStrategy::Queue { workers } => VolumeStore::Queue(QueueStore::new(cluster, claims, workers)),
        }
    }

    /// Saves the volume. An error means the provisioning attempt failed as a whole.
    pub async fn store_volume(&self, claim: &PersistentVolumeClaim, volume: &PersistentVolume) -> Result<()> {
        match self {
            VolumeStore::Blocking(store) => store.store_volume(claim, volume).await,
            VolumeStore::Queue(store) => store.store_volume(volume).await,
        }
    }

    /// Runs the background workers, if the strategy has any, until [`VolumeStore::shut_down`].
    pub async fn run(&self) {
        if let VolumeStore::Queue(store) = self {
            store.run().await;
        }
    }

    pub fn shut_down(&self) {
        if let VolumeStore::Queue(store) = self {
            store.queue.shut_down();
        }
    }
}

async fn publish_success<C: ClusterClient>(
    cluster: &C,
    claims: &Cache<PersistentVolumeClaim>,
    volume: &PersistentVolume,
    fallback: Option<&PersistentVolumeClaim>,
) {
    let name = volume.name_any();
    let uid = volume
        .spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .and_then(|r| r.uid.as_deref());
    let cached = uid.and_then(|uid| claims.get_by_uid(uid));
    let Some(reference) = cached
        .as_deref()
        .or(fallback)
        .map(|claim| claim.object_ref(&()))
    else {
        debug!(volume = %name, "No claim found for saved volume, not recording an event");
        return;
    };
    cluster
        .publish(
            &reference,
            normal_event(
                "ProvisioningSucceeded",
                "Provisioning",
                format!("Successfully provisioned volume {name}"),
            ),
        )
        .await;
}

/// Saves volumes with a bounded number of attempts on the caller's task.
pub struct BackoffStore<P, C> {
    backoff: Backoff,
    provisioner: Arc<P>,
    cluster: C,
    claims: Cache<PersistentVolumeClaim>,
}

impl<P: Provisioner, C: ClusterClient> BackoffStore<P, C> {
    async fn store_volume(&self, claim: &PersistentVolumeClaim, volume: &PersistentVolume) -> Result<()> {
        let name = volume.name_any();
        let claim_key = format!(
            "{}/{}",
            claim.namespace().unwrap_or_default(),
            claim.name_any()
        );

        let cluster = &self.cluster;
        let volume_name = name.as_str();
        let saved = self
            .backoff
            .retry(move || async move {
                match cluster.create_volume(volume).await {
                    Ok(_) => {
                        info!(volume = volume_name, "Volume saved");
                        Ok(())
                    }
                    Err(err) if is_already_exists(&err) => {
                        info!(volume = volume_name, "Volume already exists, reusing");
                        Ok(())
                    }
                    Err(err) => {
                        info!(volume = volume_name, "Failed to save volume: {err}");
                        Err(err)
                    }
                }
            })
            .await;

        let err = match saved {
            Ok(()) => {
                publish_success(&self.cluster, &self.claims, volume, Some(claim)).await;
                return Ok(());
            }
            Err(err) => err,
        };

        // the asset exists but nothing points at it; try to remove it
        let message = format!(
            "Error creating provisioned PV object for claim {claim_key}: {err}. Deleting the volume."
        );
        error!(claim = %claim_key, volume = %name, "{message}");
        let reference = claim.object_ref(&());
        self.cluster
            .publish(&reference, warning_event("ProvisioningFailed", "Provisioning", message))
            .await;

        let provisioner = self.provisioner.as_ref();
        let cleaned = self
            .backoff
            .retry(move || async move {
                provisioner.delete(volume).await.inspect_err(|err| {
                    info!(volume = volume_name, "Failed to delete orphaned volume: {err}");
                })
            })
            .await;
        match cleaned {
            Ok(()) => info!(claim = %claim_key, volume = %name, "Volume deleted after failing to save it"),
            Err(cleanup_err) => {
                let message = format!(
                    "Error cleaning provisioned volume for claim {claim_key}: {cleanup_err}. Please delete manually."
                );
                error!(claim = %claim_key, volume = %name, "{message}");
                self.cluster
                    .publish(
                        &reference,
                        warning_event("ProvisioningCleanupFailed", "Provisioning", message),
                    )
                    .await;
            }
        }

        Err(Error::KubeError(err))
    }
}

/// Saves volumes in background workers, retrying each one until it lands.
pub struct QueueStore<C> {
    cluster: C,
    claims: Cache<PersistentVolumeClaim>,
    queue: WorkQueue<String>,
    // volumes waiting to be saved, by name
    pending: Mutex<HashMap<String, PersistentVolume>>,
    workers: usize,
}

impl<C: ClusterClient> QueueStore<C> {
    fn new(cluster: C, claims: Cache<PersistentVolumeClaim>, workers: usize) -> Self {
        Self {
            cluster,
            claims,
            queue: WorkQueue::new(
                "unsavedpvs",
                ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000)),
            ),
            pending: Mutex::new(HashMap::new()),
            workers: workers.max(1),
        }
    }

    async fn store_volume(&self, volume: &PersistentVolume) -> Result<()> {
        if self.save(volume).await {
            return Ok(());
        }
        let name = volume.name_any();
        self.pending
            .lock()
            .expect("pending volumes mutex poisoned")
            .insert(name.clone(), volume.clone());
        self.queue.add(name);
        // the save is retried until it succeeds
        Ok(())
    }

    async fn save(&self, volume: &PersistentVolume) -> bool {
        let name = volume.name_any();
        match self.cluster.create_volume(volume).await {
            Ok(_) => info!(volume = %name, "Volume saved"),
            Err(err) if is_already_exists(&err) => info!(volume = %name, "Volume already exists, reusing"),
            Err(err) => {
                warn!(volume = %name, "Failed to save volume: {err}");
                return false;
            }
        }
        publish_success(&self.cluster, &self.claims, volume, None).await;
        true
    }

    async fn run(&self) {
        info!(workers = self.workers, "Starting save volume queue");
        let workers = (0..self.workers).map(|_| self.worker());
        futures::future::join_all(workers).await;
        info!("Stopped save volume queue");
    }

    async fn worker(&self) {
        while let Some(name) = self.queue.get().await {
            self.process(&name).await;
            self.queue.done(&name);
        }
    }

    async fn process(&self, name: &String) {
        let volume = self
            .pending
            .lock()
            .expect("pending volumes mutex poisoned")
            .get(name)
            .cloned();
        let Some(volume) = volume else {
            // already saved by an earlier attempt
            self.queue.forget(name);
            return;
        };
        if self.save(&volume).await {
            self.pending
                .lock()
                .expect("pending volumes mutex poisoned")
                .remove(name);
            self.queue.forget(name);
        } else {
            self.queue.add_rate_limited(name.clone());
        }
    }
}
