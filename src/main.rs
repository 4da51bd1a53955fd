use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use consul_config_operator::consul::{ConsulClientConfig, ConsulHttpClient, DEFAULT_CONSUL_NAMESPACE};
use consul_config_operator::controller::{
    self, ConfigEntryController, ConfigEntryResource, OperatorState, TenancyConfig,
};
use consul_config_operator::crd::{
    self, ConditionStatus, ProxyDefaults, ServiceDefaults, ServiceIntentions, ServiceSplitter,
};
use consul_config_operator::Error;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Summarize the sync state of every managed config entry
    Info,
    /// Validate config entry manifests without contacting a cluster
    Validate(ValidateArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct TenancyArgs {
    /// Consul Enterprise namespaces are enabled
    #[arg(long, env = "ENABLE_NAMESPACES")]
    enable_namespaces: bool,

    /// Consul namespace entries are written to when mirroring is off
    #[arg(
        long,
        env = "CONSUL_DESTINATION_NAMESPACE",
        default_value = DEFAULT_CONSUL_NAMESPACE
    )]
    consul_destination_namespace: String,

    /// Mirror Kubernetes namespaces into Consul namespaces
    #[arg(long, env = "ENABLE_K8S_NAMESPACE_MIRRORING")]
    enable_k8s_namespace_mirroring: bool,

    /// Prefix for mirrored Consul namespaces
    #[arg(long, env = "K8S_NAMESPACE_MIRRORING_PREFIX", default_value = "")]
    k8s_namespace_mirroring_prefix: String,

    /// Consul Enterprise admin partitions are enabled
    #[arg(long, env = "ENABLE_PARTITIONS")]
    enable_partitions: bool,

    /// Admin partition entries are written to
    #[arg(long, env = "CONSUL_PARTITION", default_value = "default")]
    partition: String,
}

impl From<TenancyArgs> for TenancyConfig {
    fn from(args: TenancyArgs) -> Self {
        TenancyConfig {
            enable_consul_namespaces: args.enable_namespaces,
            consul_destination_namespace: args.consul_destination_namespace,
            enable_ns_mirroring: args.enable_k8s_namespace_mirroring,
            ns_mirroring_prefix: args.k8s_namespace_mirroring_prefix,
            enable_partitions: args.enable_partitions,
            consul_partition: args.partition,
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Consul datacenter stamped into the ownership meta of written entries
    #[arg(long, env = "CONSUL_DATACENTER")]
    datacenter: String,

    /// Address of the Consul HTTP API
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://127.0.0.1:8500")]
    consul_http_addr: String,

    /// ACL token for the Consul HTTP API
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Timeout of a single Consul request
    #[arg(long, env = "CONSUL_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    consul_request_timeout_secs: u64,

    #[command(flatten)]
    tenancy: TenancyArgs,

    /// ACL policy attached to Consul namespaces created by the operator
    #[arg(long, env = "CROSS_NAMESPACE_ACL_POLICY", default_value = "")]
    cross_namespace_acl_policy: String,

    /// Reconciles running concurrently per kind
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    max_concurrent_reconciles: u16,

    /// Register Service cluster IPs as Consul virtual IPs
    #[arg(long, env = "ASSIGN_VIRTUAL_IPS", default_value_t = true, action = ArgAction::Set)]
    assign_virtual_ips: bool,

    /// Interval between periodic resyncs of in-sync resources
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = controller::DEFAULT_RESYNC_PERIOD.as_secs())]
    resync_period_secs: u64,

    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Port of the health and metrics server
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Manifest to validate, may hold several YAML documents
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    #[command(flatten)]
    tenancy: TenancyArgs,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Consul Config Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info => run_info().await,
        Commands::Validate(validate_args) => run_validate(validate_args),
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info() -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    summarize::<ServiceDefaults>(&client).await?;
    summarize::<ServiceSplitter>(&client).await?;
    summarize::<ProxyDefaults>(&client).await?;
    summarize::<ServiceIntentions>(&client).await?;
    Ok(())
}

async fn summarize<K: ConfigEntryResource>(client: &kube::Client) -> Result<(), Error> {
    let api: Api<K> = Api::all(client.clone());
    let items = api.list(&ListParams::default()).await?.items;

    let (mut synced, mut failed, mut unknown) = (0usize, 0usize, 0usize);
    let mut not_synced = Vec::new();
    for item in &items {
        let (status, reason, message) = item.synced_condition();
        match status {
            ConditionStatus::True => synced += 1,
            ConditionStatus::False => failed += 1,
            ConditionStatus::Unknown => unknown += 1,
        }
        if status != ConditionStatus::True && !reason.is_empty() {
            not_synced.push(format!(
                "  {}/{}: {}: {}",
                item.namespace().unwrap_or_default(),
                item.name_any(),
                reason,
                message
            ));
        }
    }

    println!(
        "{}: {} total, {} synced, {} failed, {} unknown",
        K::kind(&()),
        items.len(),
        synced,
        failed,
        unknown
    );
    for line in not_synced {
        println!("{}", line);
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<(), Error> {
    let tenancy = TenancyConfig::from(args.tenancy);
    let reports = crd::validate_file(&args.file, &tenancy)?;

    let mut invalid = 0;
    for report in &reports {
        if report.is_valid() {
            println!("{} {:?} is valid", report.kind, report.name);
        } else {
            invalid += 1;
            println!("{}", report.message());
        }
    }

    if invalid > 0 {
        return Err(Error::ValidationError(format!(
            "{} of {} resources in {} are invalid",
            invalid,
            reports.len(),
            args.file.display()
        )));
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(args.log_json.then(|| fmt::layer().json().with_target(true)))
        .with((!args.log_json).then(|| fmt::layer().with_target(true)));

    let otel_layer = consul_config_operator::telemetry::init_telemetry(&registry);
    let otel_enabled = otel_layer.is_some();
    registry.with(otel_layer).init();
    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!(
        "Starting Consul Config Operator v{} for datacenter {}",
        env!("CARGO_PKG_VERSION"),
        args.datacenter
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let consul = ConsulHttpClient::new(ConsulClientConfig {
        address: args.consul_http_addr.clone(),
        token: args.consul_token.clone(),
        timeout: Duration::from_secs(args.consul_request_timeout_secs),
    })?;
    info!("Using Consul agent at {}", args.consul_http_addr);

    let tenancy = TenancyConfig::from(args.tenancy.clone());
    let mut engine = ConfigEntryController::new(Arc::new(consul), args.datacenter.clone(), tenancy);
    engine.cross_namespace_acl_policy = args.cross_namespace_acl_policy.clone();
    engine.assign_virtual_ips = args.assign_virtual_ips;
    engine.resync_period = Duration::from_secs(args.resync_period_secs);

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let lease_ns = leader_namespace.clone();
        let identity = holder_identity.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(OperatorState::new(
        client.clone(),
        engine,
        Arc::clone(&is_leader),
        args.max_concurrent_reconciles.max(1),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let port = args.http_port;
        tokio::spawn(async move {
            if let Err(e) = consul_config_operator::rest_api::run_server(api_state, port).await {
                tracing::error!("HTTP server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controllers(state).await;

    // Flush any remaining traces
    consul_config_operator::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "consul-config-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!(
        "Lease held by {:?} has expired, taking over",
        current_holder
    );
    // resourceVersion makes two replicas racing for the takeover conflict
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.metadata.resource_version },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
