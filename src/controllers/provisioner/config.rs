use std::time::Duration;

use crate::leader_election::LeaderElectionConfig;
use crate::volume_store::SaveStrategy;
use crate::workqueue::ItemExponentialBackoff;

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_THREADINESS: usize = 4;
pub const DEFAULT_FAILED_PROVISION_THRESHOLD: u32 = 15;
pub const DEFAULT_FAILED_DELETE_THRESHOLD: u32 = 15;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(15);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Controller settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Name written into storage classes that this controller serves
    pub provisioner_name: String,
    /// Other names this controller also answers to
    pub additional_provisioner_names: Vec<String>,
    /// How often every cached claim and volume is reconciled again
    pub resync_period: Duration,
    /// Workers per queue
    pub threadiness: usize,
    /// Grow the retry delay of failing keys exponentially instead of keeping it fixed
    pub exponential_backoff_on_error: bool,
    pub provision_timeout: Option<Duration>,
    pub deletion_timeout: Option<Duration>,
    /// Failures after which a claim is given up on; 0 retries forever
    pub failed_provision_threshold: u32,
    /// Failures after which a volume is given up on; 0 retries forever
    pub failed_delete_threshold: u32,
    /// `None` runs without leader election. The lease lives in `default` unless the
    /// namespace is set here.
    pub leader_election: Option<LeaderElectionConfig>,
    /// Protect provisioned volumes with a finalizer until their asset is deleted
    pub add_finalizer: bool,
    pub volume_store: SaveStrategy,
}

impl Config {
    pub fn new(provisioner_name: impl Into<String>) -> Self {
        let provisioner_name = provisioner_name.into();
        Self {
            leader_election: Some(LeaderElectionConfig::new(&provisioner_name, "default")),
            provisioner_name,
            additional_provisioner_names: Vec::new(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            threadiness: DEFAULT_THREADINESS,
            exponential_backoff_on_error: true,
            provision_timeout: None,
            deletion_timeout: None,
            failed_provision_threshold: DEFAULT_FAILED_PROVISION_THRESHOLD,
            failed_delete_threshold: DEFAULT_FAILED_DELETE_THRESHOLD,
            add_finalizer: false,
            volume_store: SaveStrategy::default(),
        }
    }

    /// Whether `name` is one of the provisioner names this controller serves.
    pub fn known_provisioner(&self, name: &str) -> bool {
        name == self.provisioner_name || self.additional_provisioner_names.iter().any(|n| n == name)
    }

    pub fn rate_limiter(&self) -> ItemExponentialBackoff {
        if self.exponential_backoff_on_error {
            ItemExponentialBackoff::new(RETRY_BASE_DELAY, RETRY_MAX_DELAY)
        } else {
            ItemExponentialBackoff::new(RETRY_BASE_DELAY, RETRY_BASE_DELAY)
        }
    }
}
