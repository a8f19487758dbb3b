use std::path::PathBuf;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
use prometheus::{Encoder, TextEncoder};

use volume_provisioner::{
    cache::{reflect, Cache},
    leader_election::{default_identity, default_namespace, lease_name, LeaderElectionConfig},
    provisioners::{SubdirProvisioner, DEFAULT_MOUNT_PATH},
    telemetry,
    volume_store::{Backoff, SaveStrategy},
    Config, State,
};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum VolumeStoreKind {
    /// Save on the provisioning worker and delete the asset when saving keeps failing
    Blocking,
    /// Save in background workers, retrying until the volume is stored
    Queue,
}

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Name of the provisioner as written into StorageClasses
    #[arg(long, env = "PROVISIONER_NAME")]
    provisioner_name: String,

    /// Other provisioner names to serve, comma separated
    #[arg(long, env = "ADDITIONAL_PROVISIONER_NAMES", value_delimiter = ',')]
    additional_provisioner_names: Vec<String>,

    #[arg(long, env = "NFS_SERVER")]
    nfs_server: String,

    /// Exported directory on the NFS server
    #[arg(long, env = "NFS_PATH")]
    nfs_path: String,

    /// Where the exported directory is mounted in this container
    #[arg(long, env = "MOUNT_PATH", default_value = DEFAULT_MOUNT_PATH)]
    mount_path: PathBuf,

    #[arg(long, env = "ENABLE_LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    enable_leader_election: bool,

    /// Namespace of the leader election lease; defaults to the pod's namespace
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    #[arg(long, env = "LEASE_DURATION_SECONDS", default_value_t = 15)]
    lease_duration_seconds: u64,

    #[arg(long, env = "RENEW_DEADLINE_SECONDS", default_value_t = 10)]
    renew_deadline_seconds: u64,

    #[arg(long, env = "RETRY_PERIOD_SECONDS", default_value_t = 2)]
    retry_period_seconds: u64,

    #[arg(long, env = "RESYNC_PERIOD_SECONDS", default_value_t = 900)]
    resync_period_seconds: u64,

    /// Workers per queue
    #[arg(long, env = "THREADINESS", default_value_t = 4)]
    threadiness: usize,

    /// Unbounded when unset
    #[arg(long, env = "PROVISION_TIMEOUT_SECONDS")]
    provision_timeout_seconds: Option<u64>,

    /// Unbounded when unset
    #[arg(long, env = "DELETION_TIMEOUT_SECONDS")]
    deletion_timeout_seconds: Option<u64>,

    /// 0 retries forever
    #[arg(long, env = "FAILED_PROVISION_THRESHOLD", default_value_t = 15)]
    failed_provision_threshold: u32,

    /// 0 retries forever
    #[arg(long, env = "FAILED_DELETE_THRESHOLD", default_value_t = 15)]
    failed_delete_threshold: u32,

    #[arg(long, env = "EXPONENTIAL_BACKOFF_ON_ERROR", default_value_t = true, action = clap::ArgAction::Set)]
    exponential_backoff_on_error: bool,

    #[arg(long, env = "ADD_FINALIZER", default_value_t = false, action = clap::ArgAction::Set)]
    add_finalizer: bool,

    #[arg(long, env = "VOLUME_STORE", value_enum, default_value_t = VolumeStoreKind::Blocking)]
    volume_store: VolumeStoreKind,

    /// Attempts to save a volume with the blocking store
    #[arg(long, env = "CREATE_PROVISIONED_PV_RETRY_COUNT", default_value_t = 5)]
    create_provisioned_pv_retry_count: u32,

    #[arg(long, env = "CREATE_PROVISIONED_PV_INTERVAL_SECONDS", default_value_t = 10)]
    create_provisioned_pv_interval_seconds: u64,

    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_address: String,
}

impl Arguments {
    fn config(&self) -> Config {
        let mut config = Config::new(&self.provisioner_name);
        config.additional_provisioner_names = self.additional_provisioner_names.clone();
        config.resync_period = Duration::from_secs(self.resync_period_seconds);
        config.threadiness = self.threadiness;
        config.exponential_backoff_on_error = self.exponential_backoff_on_error;
        config.provision_timeout = self.provision_timeout_seconds.map(Duration::from_secs);
        config.deletion_timeout = self.deletion_timeout_seconds.map(Duration::from_secs);
        config.failed_provision_threshold = self.failed_provision_threshold;
        config.failed_delete_threshold = self.failed_delete_threshold;
        config.add_finalizer = self.add_finalizer;
        config.volume_store = match self.volume_store {
            VolumeStoreKind::Blocking => SaveStrategy::Blocking(Backoff {
                duration: Duration::from_secs(self.create_provisioned_pv_interval_seconds),
                factor: 1.0,
                steps: self.create_provisioned_pv_retry_count,
            }),
            VolumeStoreKind::Queue => SaveStrategy::Queue { workers: 4 },
        };
        config.leader_election = self.enable_leader_election.then(|| LeaderElectionConfig {
            lease_name: lease_name(&self.provisioner_name),
            lease_namespace: self
                .leader_election_namespace
                .clone()
                .unwrap_or_else(default_namespace),
            identity: default_identity(),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            renew_deadline: Duration::from_secs(self.renew_deadline_seconds),
            retry_period: Duration::from_secs(self.retry_period_seconds),
        });
        config
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();
    let config = args.config();
    let client = Client::try_default().await?;

    // the backend reads class parameters when deleting
    let classes = Cache::new();
    let class_watch = tokio::spawn(reflect(
        Api::<StorageClass>::all(client.clone()),
        classes.clone(),
        |_| {},
    ));
    let provisioner = SubdirProvisioner::new(args.nfs_server, args.nfs_path, args.mount_path, classes);

    let state = State::default();
    let controller = volume_provisioner::run(client, provisioner, config, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.metrics_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // a lost lease ends the controller early and must end the process
    let result = tokio::select! {
        result = &mut controller => result.map_err(anyhow::Error::from),
        result = &mut server => match result {
            Ok(()) => controller.await.map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        },
    };
    class_watch.abort();
    result
}
