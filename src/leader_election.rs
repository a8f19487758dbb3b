use std::time::Duration;

use kube::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder, LeaseManagerError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::*;

use crate::{Error, Result};

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Background task renewing the lease. It releases the lease once every leadership
/// receiver is dropped.
pub type LeaseTask = JoinHandle<std::result::Result<LeaseManager, LeaseManagerError>>;

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    /// Unique per process; two replicas must never share it.
    pub identity: String,
    /// How long a lease is respected after its holder last renewed it.
    pub lease_duration: Duration,
    /// How long after a renewal the holder renews again.
    pub renew_deadline: Duration,
    /// Delay between attempts to reach the lease when joining the election.
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(provisioner_name: &str, lease_namespace: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name(provisioner_name),
            lease_namespace: lease_namespace.into(),
            identity: default_identity(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    /// Seconds before expiry at which the holder renews the lease.
    fn grace(&self) -> Result<u64> {
        let duration = self.lease_duration.as_secs();
        let deadline = self.renew_deadline.as_secs();
        if deadline == 0 || deadline >= duration {
            return Err(Error::LeaderElection(format!(
                "renew deadline of {deadline}s must be positive and shorter than the lease duration of {duration}s"
            )));
        }
        Ok(duration - deadline)
    }
}

/// Provisioner names may contain `/`, which is not allowed in object names.
pub fn lease_name(provisioner_name: &str) -> String {
    provisioner_name.replace('/', "-")
}

pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

/// Namespace of the running pod, falling back to `default` outside a cluster.
pub fn default_namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Joins the election for the configured lease.
///
/// The receiver flips to `true` once the lease is acquired and back to `false` when another
/// identity is seen holding it.
pub async fn start(client: Client, config: &LeaderElectionConfig) -> Result<(watch::Receiver<bool>, LeaseTask)> {
    let grace = config.grace()?;
    info!(
        lease = %config.lease_name,
        namespace = %config.lease_namespace,
        identity = %config.identity,
        "Attempting to acquire leader lease"
    );
    let manager = loop {
        let built = LeaseManagerBuilder::new(client.clone(), &config.lease_name)
            .with_namespace(&config.lease_namespace)
            .with_identity(&config.identity)
            .with_duration(config.lease_duration.as_secs())
            .with_grace(grace)
            .build()
            .await;
        match built {
            Ok(manager) => break manager,
            Err(err) => {
                warn!(lease = %config.lease_name, "Failed to reach leader lease: {err}");
                tokio::time::sleep(config.retry_period).await;
            }
        }
    };
    Ok(manager.watch().await)
}

/// Waits for the lease task to hand the lease back. Every leadership receiver must be
/// dropped first.
pub async fn release(lease: LeaseTask) {
    match tokio::time::timeout(RELEASE_TIMEOUT, lease).await {
        Ok(Ok(Ok(_))) => info!("Released leader lease"),
        Ok(Ok(Err(err))) => warn!("Failed to release leader lease: {err}"),
        Ok(Err(err)) => warn!("Lease task stopped unexpectedly: {err}"),
        Err(_) => warn!("Timed out releasing leader lease"),
    }
}

/// Resolves once leadership, previously held, is lost.
pub async fn monitor_leadership(mut leader: watch::Receiver<bool>) -> Result<()> {
    loop {
        if leader.changed().await.is_err() {
            // lease task ended
            return Err(Error::LeadershipLost);
        }
        if !*leader.borrow() {
            return Err(Error::LeadershipLost);
        }
    }
}

/// Waits until this instance holds the lease.
pub async fn wait_for_leadership(leader: &mut watch::Receiver<bool>) -> Result<()> {
    leader
        .wait_for(|is_leader| *is_leader)
        .await
        .map(|_| ())
        .map_err(|_| Error::LeaderElection("lease task stopped before acquiring the lease".into()))
}
