use std::fmt;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use thiserror::Error;

/// Whether provisioning may still be in progress in the backend after a Provision call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Provisioning does not continue in the background; the result of the call is final.
    Finished,
    /// Provisioning may be in progress in the background. The controller calls Provision again
    /// with the same parameters.
    InBackground,
    /// The state is the same as after the previous call. Typically returned before the backend
    /// could be reached.
    NoChange,
    /// Stop all attempts with the currently selected node and ask the scheduler to pick another
    /// one. Only meaningful for claims with a selected node.
    Reschedule,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ProvisioningState::Finished => "Finished",
            ProvisioningState::InBackground => "Background",
            ProvisioningState::NoChange => "NoChange",
            ProvisioningState::Reschedule => "Reschedule",
        };
        f.write_str(state)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProvisionerError {
    /// The call was ignored and no action was taken, e.g. because another provisioner serving
    /// the same class is responsible for the object.
    #[error("ignored because {0}")]
    Ignored(String),

    #[error("{message}")]
    Failed {
        state: ProvisioningState,
        message: String,
    },
}

impl ProvisionerError {
    /// A failure after which provisioning certainly does not continue.
    pub fn finished(message: impl Into<String>) -> Self {
        ProvisionerError::Failed {
            state: ProvisioningState::Finished,
            message: message.into(),
        }
    }

    pub fn in_background(message: impl Into<String>) -> Self {
        ProvisionerError::Failed {
            state: ProvisioningState::InBackground,
            message: message.into(),
        }
    }

    pub fn reschedule(message: impl Into<String>) -> Self {
        ProvisionerError::Failed {
            state: ProvisioningState::Reschedule,
            message: message.into(),
        }
    }

    pub fn state(&self) -> ProvisioningState {
        match self {
            ProvisionerError::Ignored(_) => ProvisioningState::Finished,
            ProvisionerError::Failed { state, .. } => *state,
        }
    }
}

/// Everything a backend needs to provision a volume for a claim.
#[derive(Clone, Debug)]
pub struct ProvisionOptions {
    pub storage_class: Arc<StorageClass>,
    /// Name of the PersistentVolume to create. Unique per claim.
    pub pv_name: String,
    pub claim: Arc<PersistentVolumeClaim>,
    /// Node selected by the scheduler, for claims with late binding.
    pub selected_node: Option<Node>,
}

/// Creates and removes storage assets in a backend.
pub trait Provisioner: Send + Sync + 'static {
    /// Creates the storage asset and returns a PersistentVolume describing it.
    ///
    /// A failure carries a [`ProvisioningState`]; `InBackground` makes the controller call
    /// again with the same options until it receives a success or a final error.
    fn provision(
        &self,
        options: ProvisionOptions,
    ) -> impl Future<Output = Result<PersistentVolume, ProvisionerError>> + Send;

    /// Removes the storage asset backing the volume. Does not delete the volume object.
    fn delete(
        &self,
        volume: &PersistentVolume,
    ) -> impl Future<Output = Result<(), ProvisionerError>> + Send;

    fn qualifier(&self) -> Option<&dyn Qualifier> {
        None
    }

    fn deletion_guard(&self) -> Option<&dyn DeletionGuard> {
        None
    }

    fn block_provisioner(&self) -> Option<&dyn BlockProvisioner> {
        None
    }
}

/// Decides early whether a claim should be provisioned at all.
pub trait Qualifier: Send + Sync {
    fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool;
}

/// Decides whether the backing asset of a released volume may be deleted.
pub trait DeletionGuard: Send + Sync {
    fn should_delete(&self, volume: &PersistentVolume) -> bool;
}

pub trait BlockProvisioner: Send + Sync {
    fn supports_block(&self) -> bool;
}

/// Capabilities probed on a provisioner at call time, defaulting to no veto and no block support.
pub(crate) fn should_provision<P: Provisioner>(provisioner: &P, claim: &PersistentVolumeClaim) -> bool {
    provisioner
        .qualifier()
        .is_none_or(|q| q.should_provision(claim))
}

pub(crate) fn should_delete<P: Provisioner>(provisioner: &P, volume: &PersistentVolume) -> bool {
    provisioner
        .deletion_guard()
        .is_none_or(|g| g.should_delete(volume))
}

pub(crate) fn supports_block<P: Provisioner>(provisioner: &P) -> bool {
    provisioner
        .block_provisioner()
        .is_some_and(|b| b.supports_block())
}
