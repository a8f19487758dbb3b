use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tracing::*;

use crate::cluster::{is_not_found, warning_event, ClusterClient};
use crate::controllers::provisioner::{Config, Context};
use crate::provisioner::{self, Provisioner, ProvisionerError};
use crate::{telemetry, Error, Result};

use super::{
    add_finalizer, annotation, has_finalizer, reclaim_policy, remove_finalizer, set_finalizers,
    volume_phase, ANN_DYNAMICALLY_PROVISIONED, ANN_MIGRATED_TO, FINALIZER_PV, PHASE_BOUND,
    PHASE_RELEASED, RECLAIM_DELETE, RECLAIM_RECYCLE, RECLAIM_RETAIN,
};

/// Looks up the volume by name and syncs it. An error requeues the volume.
#[instrument(skip(ctx), fields(trace_id))]
pub async fn sync_volume_handler<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, name: &str) -> Result<()> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let Some(volume) = ctx.volumes.get(name) else {
        debug!("Volume in work queue no longer exists");
        return Ok(());
    };
    ctx.diagnostics.write().await.last_event = Utc::now();
    sync_volume(ctx, volume).await
}

/// Keeps the protection finalizer in line with the configuration and deletes released volumes.
pub async fn sync_volume<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, volume: Arc<PersistentVolume>) -> Result<()> {
    if !is_provisioner_for_volume(&ctx.config, &volume) {
        return Ok(());
    }

    let volume = handle_protection_finalizer(ctx, volume).await?;

    if should_delete(ctx, &volume) {
        let started = Instant::now();
        let result = delete_volume_operation(ctx, &volume).await;
        ctx.metrics.delete_result(&volume, result.is_ok(), started);
        return result;
    }
    Ok(())
}

/// Whether this controller is responsible for the volume.
pub fn is_provisioner_for_volume(config: &Config, volume: &PersistentVolume) -> bool {
    let migrated_to = annotation(volume, &[ANN_MIGRATED_TO]).unwrap_or_default();
    if let Some(provisioned_by) = annotation(volume, &[ANN_DYNAMICALLY_PROVISIONED]) {
        return config.known_provisioner(provisioned_by) || config.known_provisioner(migrated_to);
    }

    // statically provisioned
    match volume.spec.as_ref().and_then(|s| s.csi.as_ref()) {
        Some(csi) => config.known_provisioner(&csi.driver),
        None => config.known_provisioner(migrated_to),
    }
}

/// Adds or removes the protection finalizer. Returns the volume as stored afterwards.
pub async fn handle_protection_finalizer<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    volume: Arc<PersistentVolume>,
) -> Result<Arc<PersistentVolume>> {
    let policy = reclaim_policy(&volume);
    let mut finalizers = volume.metadata.finalizers.clone().unwrap_or_default();
    let mut modified = false;

    if ctx.config.add_finalizer
        && policy == Some(RECLAIM_DELETE)
        && volume.metadata.deletion_timestamp.is_none()
        && volume_phase(&volume) == Some(PHASE_BOUND)
    {
        modified = add_finalizer(&mut finalizers, FINALIZER_PV);
    }

    // rolled back, or the policy no longer deletes the asset
    if !ctx.config.add_finalizer || matches!(policy, Some(RECLAIM_RETAIN) | Some(RECLAIM_RECYCLE)) {
        modified = remove_finalizer(&mut finalizers, FINALIZER_PV);
    }

    if !modified {
        return Ok(volume);
    }

    let name = volume.name_any();
    debug!(volume = %name, ?finalizers, "Updating protection finalizer");
    let mut updated = (*volume).clone();
    set_finalizers(&mut updated.metadata, finalizers.clone());
    let stored = ctx
        .cluster
        .replace_volume(&updated)
        .await
        .map_err(|source| Error::FinalizerUpdateFailed {
            volume: name,
            finalizers,
            source,
        })?;
    Ok(ctx.volumes.insert(stored))
}

/// Whether the backing asset of the volume should be deleted now.
pub fn should_delete<P: Provisioner, C: ClusterClient>(ctx: &Context<P, C>, volume: &PersistentVolume) -> bool {
    if !provisioner::should_delete(ctx.provisioner.as_ref(), volume) {
        return false;
    }

    let deleting = volume.metadata.deletion_timestamp.is_some();
    if ctx.config.add_finalizer {
        // with the finalizer the volume waits for us even while being deleted
        if deleting && !has_finalizer(&volume.metadata, FINALIZER_PV) {
            return false;
        }
    } else if deleting {
        return false;
    }

    volume_phase(volume) == Some(PHASE_RELEASED) && reclaim_policy(volume) == Some(RECLAIM_DELETE)
}

/// Deletes the backing asset, then the volume object, then releases the finalizer.
pub async fn delete_volume_operation<P: Provisioner, C: ClusterClient>(
    ctx: &Context<P, C>,
    volume: &PersistentVolume,
) -> Result<()> {
    let name = volume.name_any();
    info!(volume = %name, "Started deleting volume");

    match ctx.provisioner.delete(volume).await {
        Ok(()) => info!(volume = %name, "Volume deleted"),
        Err(ProvisionerError::Ignored(reason)) => {
            // another provisioner may delete it
            info!(volume = %name, "Volume deletion ignored: {reason}");
            return Ok(());
        }
        Err(err) => {
            error!(volume = %name, "Volume deletion failed: {err}");
            ctx.cluster
                .publish(
                    &volume.object_ref(&()),
                    warning_event("VolumeFailedDelete", "Deleting", err.to_string()),
                )
                .await;
            return Err(Error::DeleteFailed(err.to_string()));
        }
    }

    ctx.cluster.delete_volume(&name).await.inspect_err(|err| {
        info!(volume = %name, "Failed to delete persistentvolume: {err}");
    })?;

    if ctx.config.add_finalizer && volume.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
        // the delete stamped a deletion timestamp on the stored object
        let Some(current) = ctx.volumes.get(&name) else {
            return Ok(());
        };
        let mut finalizers = current.metadata.finalizers.clone().unwrap_or_default();
        if remove_finalizer(&mut finalizers, FINALIZER_PV) {
            let mut updated = (*current).clone();
            set_finalizers(&mut updated.metadata, finalizers.clone());
            match ctx.cluster.replace_volume(&updated).await {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {}
                Err(source) => {
                    info!(volume = %name, "Failed to remove finalizer for persistentvolume: {source}");
                    return Err(Error::FinalizerUpdateFailed {
                        volume: name,
                        finalizers,
                        source,
                    });
                }
            }
        }
    }

    info!(volume = %name, "Persistentvolume deleted");
    Ok(())
}
