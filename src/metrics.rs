use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

const SUBSYSTEM: &str = "controller";

#[derive(Clone)]
pub struct Metrics {
    pub provision_total: IntCounterVec,
    pub provision_failed_total: IntCounterVec,
    pub provision_duration: HistogramVec,
    pub delete_total: IntCounterVec,
    pub delete_failed_total: IntCounterVec,
    pub delete_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let provision_total = IntCounterVec::new(
            opts!(
                "persistentvolumeclaim_provision_total",
                "Total number of persistent volumes provisioned succesfully. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class", "source"],
        )
        .unwrap();
        let provision_failed_total = IntCounterVec::new(
            opts!(
                "persistentvolumeclaim_provision_failed_total",
                "Total number of persistent volume provision failed attempts. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class", "source"],
        )
        .unwrap();
        let provision_duration = HistogramVec::new(
            histogram_opts!(
                "persistentvolumeclaim_provision_duration_seconds",
                "Latency in seconds to provision persistent volumes. Failed provisioning attempts are ignored. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class", "source"],
        )
        .unwrap();
        let delete_total = IntCounterVec::new(
            opts!(
                "persistentvolume_delete_total",
                "Total number of persistent volumes deleted succesfully. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class"],
        )
        .unwrap();
        let delete_failed_total = IntCounterVec::new(
            opts!(
                "persistentvolume_delete_failed_total",
                "Total number of persistent volume delete failed attempts. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class"],
        )
        .unwrap();
        let delete_duration = HistogramVec::new(
            histogram_opts!(
                "persistentvolume_delete_duration_seconds",
                "Latency in seconds to delete persistent volumes. Failed deletion attempts are ignored. Broken down by storage class name."
            )
            .subsystem(SUBSYSTEM),
            &["class"],
        )
        .unwrap();
        Metrics {
            provision_total,
            provision_failed_total,
            provision_duration,
            delete_total,
            delete_failed_total,
            delete_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.provision_total.clone()))?;
        registry.register(Box::new(self.provision_failed_total.clone()))?;
        registry.register(Box::new(self.provision_duration.clone()))?;
        registry.register(Box::new(self.delete_total.clone()))?;
        registry.register(Box::new(self.delete_failed_total.clone()))?;
        registry.register(Box::new(self.delete_duration.clone()))?;
        Ok(self)
    }

    pub fn provision_result(
        &self,
        claim: &PersistentVolumeClaim,
        succeeded: bool,
        started: Instant,
    ) {
        let class = claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .unwrap_or_default();
        let source = claim
            .spec
            .as_ref()
            .and_then(|s| s.data_source.as_ref())
            .map(|s| s.kind.as_str())
            .unwrap_or_default();

        if succeeded {
            self.provision_duration
                .with_label_values(&[class, source])
                .observe(elapsed_seconds(started));
            self.provision_total
                .with_label_values(&[class, source])
                .inc();
        } else {
            self.provision_failed_total
                .with_label_values(&[class, source])
                .inc();
        }
    }

    pub fn delete_result(&self, volume: &PersistentVolume, succeeded: bool, started: Instant) {
        let class = volume
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .unwrap_or_default();

        if succeeded {
            self.delete_duration
                .with_label_values(&[class])
                .observe(elapsed_seconds(started));
            self.delete_total.with_label_values(&[class]).inc();
        } else {
            self.delete_failed_total.with_label_values(&[class]).inc();
        }
    }
}

fn elapsed_seconds(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}
