use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::{
    NFSVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use regex::Regex;
use tracing::*;

use crate::cache::Cache;
use crate::provisioner::{ProvisionOptions, Provisioner, ProvisionerError};

/// Where the exported directory is mounted inside the provisioner container.
pub const DEFAULT_MOUNT_PATH: &str = "/persistentvolumes";

const PARAM_PATH_PATTERN: &str = "pathPattern";
const PARAM_ON_DELETE: &str = "onDelete";
const PARAM_ARCHIVE_ON_DELETE: &str = "archiveOnDelete";

const ANN_BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// Provisions each volume as a subdirectory of one exported NFS directory.
pub struct SubdirProvisioner {
    /// NFS server hostname or address
    server: String,
    /// Exported directory on the server
    path: String,
    /// Local mount point of the exported directory
    mount_path: PathBuf,
    classes: Cache<StorageClass>,
}

impl SubdirProvisioner {
    pub fn new(
        server: impl Into<String>,
        path: impl Into<String>,
        mount_path: impl Into<PathBuf>,
        classes: Cache<StorageClass>,
    ) -> Self {
        Self {
            server: server.into(),
            path: path.into(),
            mount_path: mount_path.into(),
            classes,
        }
    }

    fn volume_class(&self, volume: &PersistentVolume) -> Result<std::sync::Arc<StorageClass>, ProvisionerError> {
        let name = volume
            .annotations()
            .get(ANN_BETA_STORAGE_CLASS)
            .cloned()
            .or_else(|| volume.spec.as_ref().and_then(|s| s.storage_class_name.clone()))
            .unwrap_or_default();
        if name.is_empty() {
            return Err(ProvisionerError::finished("volume has no storage class"));
        }
        self.classes
            .get(&name)
            .ok_or_else(|| ProvisionerError::finished(format!("storageClass {name:?} not found")))
    }
}

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{\.PVC\.((labels|annotations)\.(.*?)|.*?)\}").unwrap())
}

/// Expands `${.PVC.namespace}`, `${.PVC.name}`, `${.PVC.labels.<key>}` and
/// `${.PVC.annotations.<key>}`. Unknown references expand to nothing.
fn expand_path_pattern(pattern: &str, claim: &PersistentVolumeClaim) -> String {
    let namespace = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    path_pattern()
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            let key = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            let value = match caps.get(2).map(|m| m.as_str()) {
                Some("labels") => claim.labels().get(key).cloned(),
                Some("annotations") => claim.annotations().get(key).cloned(),
                _ => match &caps[1] {
                    "namespace" => Some(namespace.clone()),
                    "name" => Some(name.clone()),
                    _ => None,
                },
            };
            value.unwrap_or_default()
        })
        .into_owned()
}

/// Parses booleans the way the class parameters have always been read.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Turns an expanded directory name into a path relative to the export.
///
/// Leading separators are dropped so the result always nests under the export, and `..`
/// is refused.
fn relative_path(directory: &str) -> Result<PathBuf, ProvisionerError> {
    let mut relative = PathBuf::new();
    for component in Path::new(directory).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(ProvisionerError::finished(format!(
                    "path {directory:?} must not refer to a parent directory"
                )))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ProvisionerError::finished(format!(
            "path {directory:?} does not name a directory below the export"
        )));
    }
    Ok(relative)
}

fn io_failure(context: &str, err: io::Error) -> ProvisionerError {
    ProvisionerError::finished(format!("{context}: {err}"))
}

async fn create_directory(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    // the mode passed at creation is subject to the umask
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)).await?;
    }
    Ok(())
}

impl Provisioner for SubdirProvisioner {
    async fn provision(&self, options: ProvisionOptions) -> Result<PersistentVolume, ProvisionerError> {
        let claim = options.claim.as_ref();
        let spec = claim.spec.clone().unwrap_or_default();
        if spec.selector.is_some() {
            return Err(ProvisionerError::finished("claim Selector is not supported"));
        }

        let directory = format!(
            "{}-{}-{}",
            claim.namespace().unwrap_or_default(),
            claim.name_any(),
            options.pv_name
        );
        let parameters = options.storage_class.parameters.clone().unwrap_or_default();
        let relative = parameters
            .get(PARAM_PATH_PATTERN)
            .map(|pattern| expand_path_pattern(pattern, claim))
            .filter(|custom| !custom.is_empty())
            .unwrap_or(directory);
        let relative = relative_path(&relative)?;
        let full_path = self.mount_path.join(&relative);
        let server_path = Path::new(&self.path).join(&relative);

        debug!(path = %full_path.display(), "Creating volume directory");
        create_directory(&full_path)
            .await
            .map_err(|err| io_failure("unable to create directory to provision new pv", err))?;

        let capacity = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|storage| BTreeMap::from([("storage".to_string(), storage.clone())]));

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
                        .unwrap_or_else(|| "Delete".to_string()),
                ),
                access_modes: spec.access_modes,
                mount_options: options.storage_class.mount_options.clone(),
                capacity,
                nfs: Some(NFSVolumeSource {
                    server: self.server.clone(),
                    path: server_path.to_string_lossy().into_owned(),
                    read_only: None,
                }),
                ..Default::default()
            }),
            status: None,
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<(), ProvisionerError> {
        let Some(nfs) = volume.spec.as_ref().and_then(|s| s.nfs.as_ref()) else {
            return Err(ProvisionerError::Ignored("volume has no NFS source".into()));
        };
        let local = Path::new(&nfs.path)
            .strip_prefix(&self.path)
            .ok()
            .and_then(|relative| relative_path(&relative.to_string_lossy()).ok())
            .map(|relative| self.mount_path.join(relative))
            .ok_or_else(|| ProvisionerError::Ignored(format!("path {:?} is not below the export", nfs.path)))?;

        if !tokio::fs::try_exists(&local).await.unwrap_or(false) {
            warn!(path = %local.display(), "Path does not exist, deletion skipped");
            return Ok(());
        }

        let class = self.volume_class(volume)?;
        let parameters = class.parameters.clone().unwrap_or_default();

        match parameters.get(PARAM_ON_DELETE).map(String::as_str) {
            Some("delete") => {
                return tokio::fs::remove_dir_all(&local)
                    .await
                    .map_err(|err| io_failure("unable to remove volume directory", err));
            }
            Some("retain") => return Ok(()),
            _ => {}
        }

        if let Some(archive) = parameters.get(PARAM_ARCHIVE_ON_DELETE) {
            let archive = parse_bool(archive).ok_or_else(|| {
                ProvisionerError::finished(format!("invalid {PARAM_ARCHIVE_ON_DELETE} value {archive:?}"))
            })?;
            if !archive {
                return tokio::fs::remove_dir_all(&local)
                    .await
                    .map_err(|err| io_failure("unable to remove volume directory", err));
            }
        }

        let base = Path::new(&nfs.path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archived = self.mount_path.join(format!("archived-{base}"));
        debug!(from = %local.display(), to = %archived.display(), "Archiving volume directory");
        tokio::fs::rename(&local, &archived)
            .await
            .map_err(|err| io_failure("unable to archive volume directory", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::provisioner::ProvisioningState;
    use crate::test_support::{claim, fixture_class};

    fn class(parameters: &[(&str, &str)]) -> StorageClass {
        let mut class = fixture_class("nfs-client", "example.com/nfs");
        class.parameters = Some(
            parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        class.mount_options = Some(vec!["nfsvers=4.1".into()]);
        class
    }

    fn setup(class: StorageClass) -> (TempDir, SubdirProvisioner) {
        let mount = tempfile::tempdir().unwrap();
        let classes = Cache::new();
        classes.insert(class);
        let provisioner = SubdirProvisioner::new("nfs.local", "/exports", mount.path(), classes);
        (mount, provisioner)
    }

    fn options(class: StorageClass, pvc: PersistentVolumeClaim) -> ProvisionOptions {
        ProvisionOptions {
            storage_class: Arc::new(class),
            pv_name: "pvc-uid-1".into(),
            claim: Arc::new(pvc),
            selected_node: None,
        }
    }

    fn sized_claim() -> PersistentVolumeClaim {
        let mut pvc = claim("team-a", "data", "uid-1");
        pvc.spec = Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity("1Gi".into()))])),
                ..Default::default()
            }),
            ..Default::default()
        });
        pvc
    }

    fn with_class_name(mut volume: PersistentVolume) -> PersistentVolume {
        volume.spec.as_mut().unwrap().storage_class_name = Some("nfs-client".into());
        volume
    }

    #[tokio::test]
    async fn provision_creates_directory_and_nfs_volume() {
        let (mount, provisioner) = setup(class(&[]));

        let volume = provisioner
            .provision(options(class(&[]), sized_claim()))
            .await
            .unwrap();

        let dir = mount.path().join("team-a-data-pvc-uid-1");
        assert!(dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o777);
        }
        assert_json_include!(
            actual: serde_json::to_value(&volume).unwrap(),
            expected: json!({
                "metadata": { "name": "pvc-uid-1" },
                "spec": {
                    "persistentVolumeReclaimPolicy": "Delete",
                    "accessModes": ["ReadWriteMany"],
                    "mountOptions": ["nfsvers=4.1"],
                    "capacity": { "storage": "1Gi" },
                    "nfs": { "server": "nfs.local", "path": "/exports/team-a-data-pvc-uid-1" },
                },
            })
        );
    }

    #[tokio::test]
    async fn path_pattern_uses_claim_metadata() {
        let class = class(&[(PARAM_PATH_PATTERN, "${.PVC.namespace}/${.PVC.labels.app}/${.PVC.annotations.tier}")]);
        let (mount, provisioner) = setup(class.clone());
        let mut pvc = sized_claim();
        pvc.labels_mut().insert("app".into(), "web".into());
        pvc.annotations_mut().insert("tier".into(), "gold".into());

        let volume = provisioner.provision(options(class, pvc)).await.unwrap();

        assert!(mount.path().join("team-a/web/gold").is_dir());
        assert_eq!(
            volume.spec.unwrap().nfs.unwrap().path,
            "/exports/team-a/web/gold"
        );
    }

    #[tokio::test]
    async fn absolute_path_pattern_stays_below_the_export() {
        let class = class(&[(PARAM_PATH_PATTERN, "/shared/${.PVC.name}")]);
        let (mount, provisioner) = setup(class.clone());

        let volume = provisioner.provision(options(class, sized_claim())).await.unwrap();

        assert!(mount.path().join("shared/data").is_dir());
        assert_eq!(volume.spec.unwrap().nfs.unwrap().path, "/exports/shared/data");
    }

    #[tokio::test]
    async fn path_pattern_cannot_climb_out_of_the_export() {
        let class = class(&[(PARAM_PATH_PATTERN, "${.PVC.annotations.dir}/${.PVC.name}")]);
        let (mount, provisioner) = setup(class.clone());
        let mut pvc = sized_claim();
        pvc.annotations_mut().insert("dir".into(), "../../outside".into());

        let err = provisioner.provision(options(class, pvc)).await.unwrap_err();

        assert_eq!(err.state(), ProvisioningState::Finished);
        assert!(std::fs::read_dir(mount.path()).unwrap().next().is_none());
    }

    #[test]
    fn relative_paths_are_normalized() {
        assert_eq!(relative_path("//a/./b/").unwrap(), PathBuf::from("a/b"));
        assert!(relative_path("a/../b").is_err());
        assert!(relative_path("/").is_err());
    }

    #[tokio::test]
    async fn volume_outside_the_export_is_ignored() {
        let (_mount, provisioner, mut volume, dir) = provisioned(class(&[])).await;
        volume.spec.as_mut().unwrap().nfs.as_mut().unwrap().path = "/elsewhere/team-a-data-pvc-uid-1".into();

        let err = provisioner.delete(&volume).await.unwrap_err();

        assert!(matches!(err, ProvisionerError::Ignored(_)));
        assert!(dir.is_dir());
    }

    #[test]
    fn unknown_pattern_references_expand_to_nothing() {
        let mut pvc = claim("team-a", "data", "uid-1");
        pvc.labels_mut().insert("app".into(), "web".into());
        assert_eq!(
            expand_path_pattern("${.PVC.name}-${.PVC.labels.missing}${.PVC.uid}", &pvc),
            "data-"
        );
        assert_eq!(expand_path_pattern("", &pvc), "");
    }

    #[tokio::test]
    async fn empty_pattern_falls_back_to_default_directory() {
        let class = class(&[(PARAM_PATH_PATTERN, "${.PVC.labels.missing}")]);
        let (mount, provisioner) = setup(class.clone());

        provisioner.provision(options(class, sized_claim())).await.unwrap();
        assert!(mount.path().join("team-a-data-pvc-uid-1").is_dir());
    }

    #[tokio::test]
    async fn selector_is_rejected() {
        let (_mount, provisioner) = setup(class(&[]));
        let mut pvc = sized_claim();
        pvc.spec.as_mut().unwrap().selector = Some(LabelSelector::default());

        let err = provisioner.provision(options(class(&[]), pvc)).await.unwrap_err();
        assert_eq!(err.state(), ProvisioningState::Finished);
    }

    async fn provisioned(class: StorageClass) -> (TempDir, SubdirProvisioner, PersistentVolume, PathBuf) {
        let (mount, provisioner) = setup(class.clone());
        let volume = provisioner
            .provision(options(class, sized_claim()))
            .await
            .unwrap();
        let dir = mount.path().join("team-a-data-pvc-uid-1");
        (mount, provisioner, with_class_name(volume), dir)
    }

    #[tokio::test]
    async fn delete_archives_by_default() {
        let (mount, provisioner, volume, dir) = provisioned(class(&[])).await;

        provisioner.delete(&volume).await.unwrap();

        assert!(!dir.exists());
        assert!(mount.path().join("archived-team-a-data-pvc-uid-1").is_dir());
    }

    #[tokio::test]
    async fn delete_removes_when_archiving_is_off() {
        let (mount, provisioner, volume, dir) = provisioned(class(&[(PARAM_ARCHIVE_ON_DELETE, "false")])).await;

        provisioner.delete(&volume).await.unwrap();

        assert!(!dir.exists());
        assert!(!mount.path().join("archived-team-a-data-pvc-uid-1").exists());
    }

    #[tokio::test]
    async fn on_delete_takes_precedence() {
        let (_mount, provisioner, volume, dir) =
            provisioned(class(&[(PARAM_ON_DELETE, "retain"), (PARAM_ARCHIVE_ON_DELETE, "false")])).await;
        provisioner.delete(&volume).await.unwrap();
        assert!(dir.is_dir());

        let (_mount, provisioner, volume, dir) = provisioned(class(&[(PARAM_ON_DELETE, "delete")])).await;
        provisioner.delete(&volume).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn invalid_archive_flag_is_an_error() {
        let (_mount, provisioner, volume, dir) = provisioned(class(&[(PARAM_ARCHIVE_ON_DELETE, "maybe")])).await;

        assert!(provisioner.delete(&volume).await.is_err());
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn missing_directory_is_already_deleted() {
        let (_mount, provisioner, volume, dir) = provisioned(class(&[])).await;
        std::fs::remove_dir(&dir).unwrap();

        // no class lookup is needed either
        let class = provisioner.classes.get("nfs-client").unwrap();
        provisioner
            .classes
            .apply_watcher_event(kube::runtime::watcher::Event::Delete((*class).clone()));
        provisioner.delete(&volume).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_volume_is_ignored() {
        let (_mount, provisioner) = setup(class(&[]));
        let err = provisioner.delete(&PersistentVolume::default()).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Ignored(_)));
    }
}
