use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tracing::*;

use crate::cluster::{normal_event, warning_event, ClusterClient};
use crate::controllers::provisioner::Context;
use crate::provisioner::{self, ProvisionOptions, Provisioner, ProvisionerError, ProvisioningState};
use crate::{telemetry, Error, Result};

use super::{
    add_finalizer, annotation, claim_class, claim_key, is_block_claim, provisioned_volume_name,
    ANN_ALPHA_SELECTED_NODE, ANN_BETA_STORAGE_PROVISIONER, ANN_DYNAMICALLY_PROVISIONED,
    ANN_SELECTED_NODE, ANN_STORAGE_PROVISIONER, BINDING_WAIT_FOR_FIRST_CONSUMER, FINALIZER_PV,
};

/// How a provisioning attempt ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A volume was created and saved.
    Provisioned,
    /// Nothing more can be done for the claim in its current state.
    Stopped,
}

/// A failed provisioning attempt, with what it means for work still running in the backend.
#[derive(Debug)]
pub struct OperationError {
    pub state: ProvisioningState,
    pub error: Error,
}

impl OperationError {
    fn new(state: ProvisioningState, error: Error) -> Self {
        Self { state, error }
    }

    fn finished(error: Error) -> Self {
        Self::new(ProvisioningState::Finished, error)
    }
}

/// Looks up the claim by UID and syncs it. An error requeues the claim.
#[instrument(skip(ctx), fields(trace_id))]
pub async fn sync_claim_handler<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, uid: &str) -> Result<()> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    // a deleted claim may still be provisioned in the background
    let Some(claim) = ctx.claims.get_by_uid(uid).or_else(|| ctx.claim_in_progress(uid)) else {
        debug!("Claim in work queue no longer exists");
        return Ok(());
    };
    ctx.diagnostics.write().await.last_event = Utc::now();
    sync_claim(ctx, claim).await
}

/// Provisions a volume for the claim if it should have one.
pub async fn sync_claim<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    claim: Arc<PersistentVolumeClaim>,
) -> Result<()> {
    let should = match should_provision(ctx, &claim) {
        Ok(should) => should,
        Err(err) => {
            ctx.metrics.provision_result(&claim, false, Instant::now());
            return Err(err);
        }
    };
    if !should {
        return Ok(());
    }

    let started = Instant::now();
    let result = provision_claim_operation(ctx, &claim).await;
    ctx.metrics.provision_result(&claim, result.is_ok(), started);

    let uid = claim.uid().unwrap_or_default();
    match result {
        Ok(outcome) => {
            debug!(claim = %claim_key(&claim), ?outcome, "Provisioning done, removing claim from claims in progress");
            ctx.clear_in_progress(&uid);
            Ok(())
        }
        Err(OperationError {
            state: ProvisioningState::InBackground,
            error,
        }) => {
            debug!(claim = %claim_key(&claim), "Temporary error received, adding claim to claims in progress");
            ctx.mark_in_progress(claim);
            Err(error)
        }
        // membership is whatever the previous attempt left
        Err(OperationError {
            state: ProvisioningState::NoChange,
            error,
        }) => Err(error),
        Err(OperationError { error, .. }) => {
            debug!(claim = %claim_key(&claim), "Final error received, removing claim from claims in progress");
            ctx.clear_in_progress(&uid);
            Err(error)
        }
    }
}

/// Whether a volume should be provisioned for the claim.
pub fn should_provision<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    claim: &PersistentVolumeClaim,
) -> Result<bool> {
    let bound = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .is_some_and(|name| !name.is_empty());
    if bound {
        return Ok(false);
    }

    if !provisioner::should_provision(ctx.provisioner.as_ref(), claim) {
        return Ok(false);
    }

    let Some(requested) = annotation(claim, &[ANN_STORAGE_PROVISIONER, ANN_BETA_STORAGE_PROVISIONER]) else {
        return Ok(false);
    };
    if !ctx.config.known_provisioner(requested) {
        return Ok(false);
    }

    let class = ctx.storage_class(&claim_class(claim))?;
    if class.volume_binding_mode.as_deref() == Some(BINDING_WAIT_FOR_FIRST_CONSUMER) {
        // the scheduler picks a node first; it clears the node again to ask for a retry
        return Ok(annotation(claim, &[ANN_SELECTED_NODE]).is_some_and(|node| !node.is_empty()));
    }
    Ok(true)
}

/// Fails when the backend cannot serve the claim at all.
pub fn can_provision<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    claim: &PersistentVolumeClaim,
) -> Result<()> {
    if is_block_claim(claim) && !provisioner::supports_block(ctx.provisioner.as_ref()) {
        return Err(Error::BlockVolumeUnsupported(ctx.config.provisioner_name.clone()));
    }
    Ok(())
}

fn claim_reference(claim: &PersistentVolumeClaim) -> Result<ObjectReference> {
    if claim.meta().uid.is_none() || claim.meta().name.is_none() {
        return Err(Error::InvalidClaimReference(format!(
            "claim {} has no name or uid",
            claim_key(claim)
        )));
    }
    Ok(claim.object_ref(&()))
}

/// Provisions a volume for the claim and saves it.
pub async fn provision_claim_operation<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    claim: &Arc<PersistentVolumeClaim>,
) -> Result<ProvisionOutcome, OperationError> {
    let class_name = claim_class(claim);
    let key = claim_key(claim);
    info!(claim = %key, class = %class_name, "Started provisioning");

    // an earlier attempt may have finished in the meantime
    let pv_name = provisioned_volume_name(claim);
    if ctx.volumes.get(&pv_name).is_some() {
        info!(claim = %key, volume = %pv_name, "Volume already exists, skipping");
        return Ok(ProvisionOutcome::Stopped);
    }

    let claim_ref = claim_reference(claim).map_err(|err| {
        error!(claim = %key, "{err}");
        OperationError::new(ProvisioningState::NoChange, err)
    })?;

    if let Err(err) = can_provision(ctx, claim) {
        error!(claim = %key, "Failed to provision volume: {err}");
        ctx.cluster
            .publish(&claim_ref, warning_event("ProvisioningFailed", "Provisioning", err.to_string()))
            .await;
        return Ok(ProvisionOutcome::Stopped);
    }

    // the class can be fixed or recreated independently of the claim
    let class = ctx.storage_class(&class_name).map_err(|err| {
        error!(claim = %key, "Error getting claim's StorageClass: {err}");
        OperationError::finished(err)
    })?;
    if !ctx.config.known_provisioner(&class.provisioner) {
        error!(claim = %key, provisioner = %class.provisioner, "Unknown provisioner requested in claim's StorageClass");
        return Ok(ProvisionOutcome::Stopped);
    }

    let mut selected_node = None;
    if let Some(node_name) = annotation(claim.as_ref(), &[ANN_SELECTED_NODE, ANN_ALPHA_SELECTED_NODE]) {
        match ctx.cluster.get_node(node_name).await {
            Ok(Some(node)) => selected_node = Some(node),
            Ok(None) => {
                let err = Error::SelectedNodeNotFound(node_name.to_string());
                return provision_volume_error_handling(ctx, ProvisioningState::Reschedule, err, claim, &claim_ref).await;
            }
            Err(source) => {
                let err = Error::NodeLookupFailed(source);
                ctx.cluster
                    .publish(&claim_ref, warning_event("ProvisioningFailed", "Provisioning", err.to_string()))
                    .await;
                return Err(OperationError::new(ProvisioningState::NoChange, err));
            }
        }
    }

    ctx.cluster
        .publish(
            &claim_ref,
            normal_event(
                "Provisioning",
                "Provisioning",
                format!("External provisioner is provisioning volume for claim {key:?}"),
            ),
        )
        .await;

    let options = ProvisionOptions {
        storage_class: class.clone(),
        pv_name: pv_name.clone(),
        claim: claim.clone(),
        selected_node,
    };
    let mut volume = match ctx.provisioner.provision(options).await {
        Ok(volume) => volume,
        Err(ProvisionerError::Ignored(reason)) => {
            info!(claim = %key, "Volume provision ignored: {reason}");
            return Ok(ProvisionOutcome::Stopped);
        }
        Err(err) => {
            let state = err.state();
            let err = Error::ProvisionFailed {
                class: class_name,
                message: err.to_string(),
            };
            return provision_volume_error_handling(ctx, state, err, claim, &claim_ref).await;
        }
    };
    info!(claim = %key, volume = %volume.name_any(), "Volume provisioned");

    // the binder sets up the other direction
    let spec = volume.spec.get_or_insert_with(Default::default);
    spec.claim_ref = Some(claim_ref);
    spec.storage_class_name = Some(class_name);
    if ctx.config.add_finalizer {
        let mut finalizers = volume.metadata.finalizers.take().unwrap_or_default();
        add_finalizer(&mut finalizers, FINALIZER_PV);
        volume.metadata.finalizers = Some(finalizers);
    }
    volume
        .annotations_mut()
        .insert(ANN_DYNAMICALLY_PROVISIONED.to_string(), class.provisioner.clone());

    ctx.volume_store
        .store_volume(claim, &volume)
        .await
        .map_err(OperationError::finished)?;
    // visible to the next sync before the watch catches up
    ctx.volumes.insert(volume);
    info!(claim = %key, "Provisioning succeeded");
    Ok(ProvisionOutcome::Provisioned)
}

/// Records a failed attempt and asks the scheduler for another node when the backend wants one.
async fn provision_volume_error_handling<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    state: ProvisioningState,
    err: Error,
    claim: &PersistentVolumeClaim,
    claim_ref: &ObjectReference,
) -> Result<ProvisionOutcome, OperationError> {
    let key = claim_key(claim);
    ctx.cluster
        .publish(claim_ref, warning_event("ProvisioningFailed", "Provisioning", err.to_string()))
        .await;

    if state == ProvisioningState::Reschedule && claim.annotations().contains_key(ANN_SELECTED_NODE) {
        if let Err(reschedule_err) = reschedule_provisioning(ctx, claim).await {
            info!(claim = %key, "Volume rescheduling failed: {reschedule_err}");
            // try again later as if the backend had finished
            return Err(OperationError::finished(err));
        }
        info!(claim = %key, "Volume rescheduled because: {err}");
        return Ok(ProvisionOutcome::Stopped);
    }

    // without a selected node there is nothing to reschedule
    let state = match state {
        ProvisioningState::Reschedule => ProvisioningState::Finished,
        state => state,
    };
    Err(OperationError::new(state, err))
}

/// Removes the selected node from the claim so the scheduler picks again.
pub async fn reschedule_provisioning<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    claim: &PersistentVolumeClaim,
) -> Result<()> {
    if !claim.annotations().contains_key(ANN_SELECTED_NODE) {
        // not triggered by the scheduler
        return Ok(());
    }

    let mut updated = claim.clone();
    updated.annotations_mut().remove(ANN_SELECTED_NODE);
    let stored = ctx
        .cluster
        .replace_claim(&updated)
        .await
        .map_err(|source| Error::RescheduleFailed {
            annotation: ANN_SELECTED_NODE,
            claim: claim_key(claim),
            source,
        })?;
    // later syncs must not see the old node
    ctx.claims.insert(stored);
    Ok(())
}
