use std::future::Future;

use k8s_openapi::api::core::v1::{Node, ObjectReference, PersistentVolume, PersistentVolumeClaim};
use kube::{
    api::{DeleteParams, PostParams},
    runtime::events::{Event, EventType, Recorder},
    Api, Client, ResourceExt,
};
use tracing::*;

/// Writes the controller performs against the cluster.
///
/// Reads go through the local caches; only node lookups hit the API server directly.
pub trait ClusterClient: Clone + Send + Sync + 'static {
    fn create_volume(
        &self,
        volume: &PersistentVolume,
    ) -> impl Future<Output = Result<PersistentVolume, kube::Error>> + Send;

    fn replace_volume(
        &self,
        volume: &PersistentVolume,
    ) -> impl Future<Output = Result<PersistentVolume, kube::Error>> + Send;

    fn delete_volume(&self, name: &str) -> impl Future<Output = Result<(), kube::Error>> + Send;

    fn replace_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> impl Future<Output = Result<PersistentVolumeClaim, kube::Error>> + Send;

    fn get_node(&self, name: &str) -> impl Future<Output = Result<Option<Node>, kube::Error>> + Send;

    /// Records an event on the referenced object. Failures are logged and otherwise ignored.
    fn publish(&self, reference: &ObjectReference, event: Event) -> impl Future<Output = ()> + Send;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl KubeCluster {
    pub fn new(client: Client, component: &str) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), component.to_string().into()),
            client,
        }
    }
}

impl ClusterClient for KubeCluster {
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, kube::Error> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        pvs.create(&PostParams::default(), volume).await
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, kube::Error> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        pvs.replace(&volume.name_any(), &PostParams::default(), volume)
            .await
    }

    async fn delete_volume(&self, name: &str) -> Result<(), kube::Error> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        pvs.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn replace_claim(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        let namespace = claim.namespace().unwrap_or_default();
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        pvcs.replace(&claim.name_any(), &PostParams::default(), claim)
            .await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, kube::Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get_opt(name).await
    }

    async fn publish(&self, reference: &ObjectReference, event: Event) {
        if let Err(err) = self.recorder.publish(&event, reference).await {
            warn!(
                reason = %event.reason,
                object = reference.name.as_deref().unwrap_or_default(),
                "Failed to record event: {err}"
            );
        }
    }
}

pub fn normal_event(reason: &str, action: &str, note: String) -> Event {
    Event {
        type_: EventType::Normal,
        reason: reason.into(),
        note: Some(note),
        action: action.into(),
        secondary: None,
    }
}

pub fn warning_event(reason: &str, action: &str, note: String) -> Event {
    Event {
        type_: EventType::Warning,
        ..normal_event(reason, action, note)
    }
}

fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    api_error_code(err) == Some(404)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

pub fn is_conflict(err: &kube::Error) -> bool {
    api_error_code(err) == Some(409)
}
