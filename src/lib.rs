use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("storageClass {0:?} not found")]
    StorageClassNotFound(String),

    #[error("unexpected error getting claim reference: {0}")]
    InvalidClaimReference(String),

    #[error("{0} does not support block volume provisioning")]
    BlockVolumeUnsupported(String),

    #[error("failed to get target node: {0}")]
    NodeLookupFailed(#[source] kube::Error),

    #[error("node {0:?} selected for the claim does not exist")]
    SelectedNodeNotFound(String),

    #[error("failed to provision volume with StorageClass {class:?}: {message}")]
    ProvisionFailed { class: String, message: String },

    #[error("delete annotation {annotation:?} for PersistentVolumeClaim {claim:?}: {source}")]
    RescheduleFailed {
        annotation: &'static str,
        claim: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to modify finalizers to {finalizers:?} on volume {volume}: {source}")]
    FinalizerUpdateFailed {
        volume: String,
        finalizers: Vec<String>,
        #[source]
        source: kube::Error,
    },

    #[error("volume deletion failed: {0}")]
    DeleteFailed(String),

    #[error("operation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Failed to register metrics: {0}")]
    MetricsRegistration(#[from] prometheus::Error),

    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    #[error("leaderelection lost")]
    LeadershipLost,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubeError",
            Error::StorageClassNotFound(_) => "StorageClassNotFound",
            Error::InvalidClaimReference(_) => "InvalidClaimReference",
            Error::BlockVolumeUnsupported(_) => "BlockVolumeUnsupported",
            Error::NodeLookupFailed(_) => "NodeLookupFailed",
            Error::SelectedNodeNotFound(_) => "SelectedNodeNotFound",
            Error::ProvisionFailed { .. } => "ProvisionFailed",
            Error::RescheduleFailed { .. } => "RescheduleFailed",
            Error::FinalizerUpdateFailed { .. } => "FinalizerUpdateFailed",
            Error::DeleteFailed(_) => "DeleteFailed",
            Error::Timeout(_) => "Timeout",
            Error::MetricsRegistration(_) => "MetricsRegistration",
            Error::LeaderElection(_) => "LeaderElection",
            Error::LeadershipLost => "LeadershipLost",
        }
    }
}

/// Local read-through caches fed by watch streams
pub mod cache;

/// Writes against the shared cluster state
pub mod cluster;

pub mod controllers;

pub mod leader_election;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Interface implemented by storage backends
pub mod provisioner;

/// Storage backends
pub mod provisioners;

pub mod volume_store;

pub mod workqueue;

#[cfg(test)]
mod test_support;

pub use controllers::provisioner::{run, Config};
pub use controllers::State;
