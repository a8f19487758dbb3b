use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::ObjectMeta;
use kube::ResourceExt;

pub mod claim;
pub mod volume;

/// Provisioner that created a volume
pub const ANN_DYNAMICALLY_PROVISIONED: &str = "pv.kubernetes.io/provisioned-by";
/// Provisioner that took over a volume created by an in-tree plugin
pub const ANN_MIGRATED_TO: &str = "pv.kubernetes.io/migrated-to";

/// Provisioner asked to provision a claim, set by the volume binder
pub const ANN_STORAGE_PROVISIONER: &str = "volume.kubernetes.io/storage-provisioner";
pub const ANN_BETA_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";

/// Node the scheduler picked for a claim with late binding
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
pub const ANN_ALPHA_SELECTED_NODE: &str = "volume.alpha.kubernetes.io/selected-node";

pub const ANN_BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// Held on provisioned volumes until their backing asset is deleted
pub const FINALIZER_PV: &str = "external-provisioner.volume.kubernetes.io/finalizer";

pub const RECLAIM_DELETE: &str = "Delete";
pub const RECLAIM_RETAIN: &str = "Retain";
pub const RECLAIM_RECYCLE: &str = "Recycle";

pub const PHASE_BOUND: &str = "Bound";
pub const PHASE_RELEASED: &str = "Released";

pub const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Name of the volume provisioned for a claim. Computed from the claim UID so that
/// repeated attempts can never produce two volumes.
pub fn provisioned_volume_name(claim: &PersistentVolumeClaim) -> String {
    format!("pvc-{}", claim.uid().unwrap_or_default())
}

pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any())
}

/// Storage class requested by a claim; the beta annotation wins over the spec field.
pub fn claim_class(claim: &PersistentVolumeClaim) -> String {
    if let Some(class) = claim.annotations().get(ANN_BETA_STORAGE_CLASS) {
        return class.clone();
    }
    claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .unwrap_or_default()
}

pub fn is_block_claim(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        == Some("Block")
}

/// First annotation present among `keys`.
pub fn annotation<'a, K: ResourceExt>(obj: &'a K, keys: &[&str]) -> Option<&'a str> {
    let annotations = obj.annotations();
    keys.iter()
        .find_map(|key| annotations.get(*key))
        .map(String::as_str)
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == finalizer))
}

/// Adds the finalizer, returning whether it was missing.
pub fn add_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Removes the finalizer, returning whether it was present.
pub fn remove_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

pub fn set_finalizers(meta: &mut ObjectMeta, finalizers: Vec<String>) {
    meta.finalizers = (!finalizers.is_empty()).then_some(finalizers);
}

pub fn reclaim_policy(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
}

pub fn volume_phase(volume: &PersistentVolume) -> Option<&str> {
    volume.status.as_ref().and_then(|s| s.phase.as_deref())
}
