//! In-memory stand-ins for the cluster and a storage backend, plus object fixtures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{Method, Request, Response, StatusCode};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, PersistentVolumeStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::client::Body;
use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tower_test::mock;

use crate::cache::object_key;
use crate::cluster::ClusterClient;
use crate::controllers::provisioner::reconcilers::{
    ANN_DYNAMICALLY_PROVISIONED, ANN_STORAGE_PROVISIONER, PHASE_BOUND, PHASE_RELEASED, RECLAIM_DELETE,
};
use crate::controllers::provisioner::{Config, Context};
use crate::metrics::Metrics;
use crate::provisioner::{
    BlockProvisioner, DeletionGuard, ProvisionOptions, Provisioner, ProvisionerError, Qualifier,
};

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: format!("fake {reason}"),
        reason: reason.into(),
        code,
    })
}

/// An event as seen by the fake recorder.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub reason: String,
    /// Name of the object the event was recorded on
    pub object: String,
    pub warning: bool,
    pub note: String,
}

#[derive(Default)]
struct ClusterState {
    volumes: BTreeMap<String, PersistentVolume>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    nodes: BTreeMap<String, Node>,
    events: Vec<RecordedEvent>,
    create_calls: usize,
    failing_creates: usize,
    failing_claim_updates: bool,
}

/// API server double. Deletes of objects with finalizers only stamp a deletion timestamp; the
/// object goes away once its last finalizer is removed.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Fails the next `count` volume creates; `usize::MAX` fails all of them.
    pub fn fail_volume_creates(&self, count: usize) {
        self.state().failing_creates = count;
    }

    pub fn fail_claim_updates(&self, fail: bool) {
        self.state().failing_claim_updates = fail;
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        self.state().volumes.insert(volume.name_any(), volume);
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        self.state().claims.insert(object_key(&claim), claim);
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(node.name_any(), node);
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state().volumes.get(name).cloned()
    }

    pub fn volumes(&self) -> Vec<PersistentVolume> {
        self.state().volumes.values().cloned().collect()
    }

    pub fn claim(&self, key: &str) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(key).cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.state().events.iter().map(|e| e.reason.clone()).collect()
    }
}

impl ClusterClient for FakeCluster {
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, kube::Error> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.failing_creates > 0 {
            if state.failing_creates != usize::MAX {
                state.failing_creates -= 1;
            }
            return Err(api_error(500, "InternalError"));
        }
        let name = volume.name_any();
        if state.volumes.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.volumes.insert(name, volume.clone());
        Ok(volume.clone())
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, kube::Error> {
        let mut state = self.state();
        let name = volume.name_any();
        let Some(stored) = state.volumes.get(&name) else {
            return Err(api_error(404, "NotFound"));
        };
        let mut updated = volume.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if released {
            state.volumes.remove(&name);
        } else {
            state.volumes.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn delete_volume(&self, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state();
        let Some(stored) = state.volumes.get_mut(name) else {
            return Err(api_error(404, "NotFound"));
        };
        if stored.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
        } else {
            state.volumes.remove(name);
        }
        Ok(())
    }

    async fn replace_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, kube::Error> {
        let mut state = self.state();
        if state.failing_claim_updates {
            return Err(api_error(500, "InternalError"));
        }
        let key = object_key(claim);
        if !state.claims.contains_key(&key) {
            return Err(api_error(404, "NotFound"));
        }
        state.claims.insert(key, claim.clone());
        Ok(claim.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, kube::Error> {
        Ok(self.state().nodes.get(name).cloned())
    }

    async fn publish(&self, reference: &ObjectReference, event: Event) {
        self.state().events.push(RecordedEvent {
            reason: event.reason,
            object: reference.name.clone().unwrap_or_default(),
            warning: matches!(event.type_, EventType::Warning),
            note: event.note.unwrap_or_default(),
        });
    }
}

#[derive(Default)]
struct ProvisionerState {
    provision_errors: VecDeque<ProvisionerError>,
    always_failing: Option<ProvisionerError>,
    delete_errors: VecDeque<ProvisionerError>,
    failing_deletes: bool,
    provision_calls: usize,
    delete_calls: usize,
    provisioned: Vec<String>,
    selected_nodes: Vec<Option<String>>,
}

/// Backend double that records calls and returns scripted results. Clones share their state.
#[derive(Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
    block: bool,
    rejects_claims: bool,
    guards_deletes: bool,
    delay: Option<Duration>,
}

impl FakeProvisioner {
    fn state(&self) -> MutexGuard<'_, ProvisionerState> {
        self.state.lock().unwrap()
    }

    pub fn with_block_support(mut self) -> Self {
        self.block = true;
        self
    }

    pub fn rejecting_claims(mut self) -> Self {
        self.rejects_claims = true;
        self
    }

    pub fn guarding_deletes(mut self) -> Self {
        self.guards_deletes = true;
        self
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_provisions(self, err: ProvisionerError) -> Self {
        self.state().always_failing = Some(err);
        self
    }

    pub fn failing_deletes(self) -> Self {
        self.state().failing_deletes = true;
        self
    }

    /// Fails the next provision call with `err`. Queued errors are returned in order.
    pub fn push_provision_error(&self, err: ProvisionerError) {
        self.state().provision_errors.push_back(err);
    }

    pub fn push_delete_error(&self, err: ProvisionerError) {
        self.state().delete_errors.push_back(err);
    }

    pub fn provision_calls(&self) -> usize {
        self.state().provision_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }

    pub fn provisioned_names(&self) -> Vec<String> {
        self.state().provisioned.clone()
    }

    pub fn selected_nodes(&self) -> Vec<Option<String>> {
        self.state().selected_nodes.clone()
    }
}

impl Provisioner for FakeProvisioner {
    async fn provision(&self, options: ProvisionOptions) -> Result<PersistentVolume, ProvisionerError> {
        {
            let mut state = self.state();
            state.provision_calls += 1;
            state
                .selected_nodes
                .push(options.selected_node.as_ref().map(|n| n.name_any()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.provision_errors.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.always_failing {
            return Err(err.clone());
        }
        state.provisioned.push(options.pv_name.clone());

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(
                    options
                        .storage_class
                        .reclaim_policy
                        .clone()
                        .unwrap_or_else(|| RECLAIM_DELETE.into()),
                ),
                access_modes: options.claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
                ..Default::default()
            }),
            status: None,
        })
    }

    async fn delete(&self, _volume: &PersistentVolume) -> Result<(), ProvisionerError> {
        let mut state = self.state();
        state.delete_calls += 1;
        if let Some(err) = state.delete_errors.pop_front() {
            return Err(err);
        }
        if state.failing_deletes {
            return Err(ProvisionerError::finished("backend unavailable"));
        }
        Ok(())
    }

    fn qualifier(&self) -> Option<&dyn Qualifier> {
        self.rejects_claims.then_some(self as &dyn Qualifier)
    }

    fn deletion_guard(&self) -> Option<&dyn DeletionGuard> {
        self.guards_deletes.then_some(self as &dyn DeletionGuard)
    }

    fn block_provisioner(&self) -> Option<&dyn BlockProvisioner> {
        self.block.then_some(self as &dyn BlockProvisioner)
    }
}

impl Qualifier for FakeProvisioner {
    fn should_provision(&self, _claim: &PersistentVolumeClaim) -> bool {
        false
    }
}

impl DeletionGuard for FakeProvisioner {
    fn should_delete(&self, _volume: &PersistentVolume) -> bool {
        false
    }
}

impl BlockProvisioner for FakeProvisioner {
    fn supports_block(&self) -> bool {
        true
    }
}

pub fn claim(namespace: &str, name: &str, uid: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".into()]),
            ..Default::default()
        }),
        status: None,
    }
}

/// A claim asking `provisioner` for a volume of class `class`.
pub fn claim_for(namespace: &str, name: &str, uid: &str, provisioner: &str, class: &str) -> PersistentVolumeClaim {
    let mut pvc = claim(namespace, name, uid);
    pvc.annotations_mut()
        .insert(ANN_STORAGE_PROVISIONER.into(), provisioner.into());
    if let Some(spec) = pvc.spec.as_mut() {
        spec.storage_class_name = Some(class.into());
    }
    pvc
}

fn volume(name: &str, claim_ref: ObjectReference, phase: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(claim_ref),
            storage_class_name: Some("standard".into()),
            persistent_volume_reclaim_policy: Some(RECLAIM_DELETE.into()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
    }
}

pub fn bound_volume(name: &str, claim: &PersistentVolumeClaim) -> PersistentVolume {
    volume(name, claim.object_ref(&()), PHASE_BOUND)
}

/// A volume provisioned by `provisioner` whose claim is gone.
pub fn released_volume(name: &str, provisioner: &str) -> PersistentVolume {
    let claim_ref = claim("default", "data", "released").object_ref(&());
    let mut pv = volume(name, claim_ref, PHASE_RELEASED);
    pv.annotations_mut()
        .insert(ANN_DYNAMICALLY_PROVISIONED.into(), provisioner.into());
    pv
}

pub fn fixture_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        provisioner: provisioner.into(),
        reclaim_policy: Some(RECLAIM_DELETE.into()),
        ..Default::default()
    }
}

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn context(
    config: Config,
    provisioner: FakeProvisioner,
    cluster: FakeCluster,
) -> Context<FakeProvisioner, FakeCluster> {
    Context::new(
        config,
        Arc::new(provisioner),
        cluster,
        Metrics::default(),
        Default::default(),
    )
}

/// A single Lease served from memory, answering get, create and patch.
#[derive(Clone, Default)]
pub struct FakeLeases {
    lease: Arc<Mutex<Option<Value>>>,
}

impl FakeLeases {
    /// Stores a lease last renewed by `holder` at `renewed`.
    pub fn held_by(&self, holder: &str, renewed: DateTime<Utc>, duration_seconds: i32) {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("example.com-nfs".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.into()),
                acquire_time: Some(MicroTime(renewed)),
                renew_time: Some(MicroTime(renewed)),
                lease_duration_seconds: Some(duration_seconds),
                lease_transitions: Some(1),
                ..Default::default()
            }),
        };
        *self.lease.lock().unwrap() = Some(serde_json::to_value(&lease).unwrap());
    }

    pub fn holder(&self) -> Option<String> {
        let lease = self.lease.lock().unwrap();
        lease
            .as_ref()?
            .pointer("/spec/holderIdentity")?
            .as_str()
            .map(str::to_string)
    }

    /// A client whose requests are all answered by this lease.
    pub fn client(&self) -> Client {
        let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        let leases = self.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                send.send_response(leases.respond(request).await);
            }
        });
        Client::new(service, "default")
    }

    async fn respond(&self, request: Request<Body>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = match body.collect_bytes().await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap(),
            _ => Value::Null,
        };
        let mut stored = self.lease.lock().unwrap();
        match parts.method {
            Method::GET => match stored.as_ref() {
                Some(lease) => json_response(StatusCode::OK, lease),
                None => status_response(StatusCode::NOT_FOUND, "NotFound"),
            },
            Method::POST => {
                if stored.is_some() {
                    return status_response(StatusCode::CONFLICT, "AlreadyExists");
                }
                *stored = Some(body.clone());
                json_response(StatusCode::CREATED, &body)
            }
            Method::PATCH => match stored.as_mut() {
                Some(lease) => {
                    merge_spec(lease, &body);
                    json_response(StatusCode::OK, lease)
                }
                None => status_response(StatusCode::NOT_FOUND, "NotFound"),
            },
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        }
    }
}

// null fields are removed, as a merge patch does
fn merge_spec(lease: &mut Value, patch: &Value) {
    let Some(changes) = patch.get("spec").and_then(Value::as_object) else {
        return;
    };
    let Some(lease) = lease.as_object_mut() else {
        return;
    };
    if let Some(spec) = lease.entry("spec").or_insert_with(|| json!({})).as_object_mut() {
        for (key, value) in changes {
            if value.is_null() {
                spec.remove(key);
            } else {
                spec.insert(key.clone(), value.clone());
            }
        }
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn status_response(status: StatusCode, reason: &str) -> Response<Body> {
    json_response(
        status,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": status.as_u16(),
        }),
    )
}
