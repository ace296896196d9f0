//! Cyclops - rotates the nodes of cloud-managed node groups

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use kube::api::ListParams;
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use cyclops::controller::runner::build_controllers;
use cyclops::controller::{Context, ControllerOptions, KubeResourceManager};
use cyclops::crd::{CycleNodeRequest, CycleNodeStatus, NodeGroup};
use cyclops::generation::{
    apply_request, generate_request, give_reason, use_generate_name, validate_request,
};
use cyclops::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use cyclops::provider::{ProviderRegistry, FAKE_PROVIDER};
use cyclops::retry::{retry_with_backoff, RetryConfig};
use cyclops::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use cyclops::{Error, DEFAULT_NAMESPACE};

/// Cyclops - replaces the nodes of a node group without disrupting workloads
#[derive(Parser, Debug)]
#[command(name = "cyclops", version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true, env = "CYCLOPS_DEBUG")]
    debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default)
    Controller(ControllerArgs),
    /// Print the CRD manifests and exit
    Crd,
    /// Create a CycleNodeRequest from a NodeGroup
    Generate(GenerateArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Cloud provider backing the node groups
    #[arg(long, env = "CYCLOPS_CLOUD_PROVIDER", default_value = FAKE_PROVIDER)]
    cloud_provider: String,

    /// Namespace watched for requests
    #[arg(long, env = "CYCLOPS_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Maximum concurrent reconciles per controller
    #[arg(long, default_value_t = 16)]
    concurrency: u16,

    /// Delete successful requests once they expire
    #[arg(long)]
    delete_cnr: bool,

    /// Age after which successful requests are deleted
    #[arg(long, default_value = "168h", value_parser = parse_duration)]
    delete_cnr_expiry: Duration,

    /// How often successful requests are checked for expiry
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    delete_cnr_requeue: Duration,

    /// How long to wait for replacement nodes before giving up
    #[arg(long, default_value = "20m", value_parser = parse_duration)]
    scale_up_timeout: Duration,

    /// How long a single drain phase may take before the node fails
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    drain_timeout: Duration,

    /// Requeue interval while waiting on the cluster or provider
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Requeue interval between drain steps
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    step_interval: Duration,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "CYCLOPS_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader lease (defaults to --namespace)
    #[arg(long)]
    lease_namespace: Option<String>,

    /// Identity used for the leader lease
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,
}

impl ControllerArgs {
    fn options(&self) -> ControllerOptions {
        ControllerOptions {
            namespace: self.namespace.clone(),
            concurrency: self.concurrency,
            poll_interval: self.poll_interval,
            step_interval: self.step_interval,
            scale_up_timeout: self.scale_up_timeout,
            drain_timeout: self.drain_timeout,
            delete_cnr: self.delete_cnr,
            delete_cnr_expiry: self.delete_cnr_expiry,
            delete_cnr_requeue: self.delete_cnr_requeue,
        }
    }
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// NodeGroup to cycle
    #[arg(long)]
    node_group: String,

    /// Base name of the request; the node group name is appended
    #[arg(long)]
    name: Option<String>,

    /// Cycle only these nodes (repeatable)
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Namespace to create the request in
    #[arg(long, env = "CYCLOPS_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Validate server-side without creating anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        debug: cli.debug,
    })?;

    match cli.command {
        Some(Commands::Crd) => print_crds(),
        Some(Commands::Generate(args)) => generate(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [NodeGroup::crd(), CycleNodeRequest::crd(), CycleNodeStatus::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize CRDs")?;
    println!("{}", docs.join("---\n"));
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let registry = ProviderRegistry::default();
    let provider = registry.create(&args.cloud_provider)?;
    tracing::info!(provider = provider.name(), namespace = %args.namespace, "starting cyclops controller");

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    wait_for_crds(&client, &args.namespace).await?;

    let ctx = Arc::new(
        Context::builder(client.clone(), provider)
            .options(args.options())
            .build(),
    );

    if !args.leader_election {
        futures::future::join_all(build_controllers(client, ctx)).await;
        return Ok(());
    }

    let identity = args
        .pod_name
        .clone()
        .unwrap_or_else(|| format!("cyclops-{:08x}", rand::random::<u32>()));
    let lease_namespace = args.lease_namespace.as_deref().unwrap_or(&args.namespace);
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        lease_namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await;

    let controllers = futures::future::join_all(build_controllers(client, ctx));
    let stopped = tokio::select! {
        _ = controllers => true,
        _ = guard.lost() => false,
    };
    if !stopped {
        bail!("leadership lost");
    }

    tracing::info!("controllers stopped, releasing leadership");
    if let Err(e) = guard.release().await {
        tracing::warn!(error = %e, "failed to release leader lease");
    }
    Ok(())
}

/// Wait until the request CRD is served; it may be installed alongside us
async fn wait_for_crds(client: &Client, namespace: &str) -> anyhow::Result<()> {
    let requests: Api<CycleNodeRequest> = Api::namespaced(client.clone(), namespace);
    retry_with_backoff(&RetryConfig::with_max_attempts(10), "crd-discovery", || {
        let requests = requests.clone();
        async move {
            requests
                .list(&ListParams::default().limit(1))
                .await
                .map(|_| ())
                .map_err(Error::from)
        }
    })
    .await
    .context("CycleNodeRequest CRD is not available; install it with `cyclops crd`")
}

async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let node_group = Api::<NodeGroup>::all(client.clone())
        .get(&args.node_group)
        .await
        .with_context(|| format!("failed to get NodeGroup {}", args.node_group))?;

    let mut cnr = generate_request(
        &node_group,
        &args.nodes,
        args.name.as_deref(),
        &args.namespace,
    );

    let nodes = KubeResourceManager::new(client.clone());
    if let Err(reason) = validate_request(&nodes, &cnr).await {
        give_reason(&mut cnr, &reason);
        println!("{}", serde_yaml::to_string(&cnr)?);
        bail!("request {} rejected: {}", cnr.name_any(), reason);
    }

    use_generate_name(&mut cnr);
    let api: Api<CycleNodeRequest> = Api::namespaced(client, &args.namespace);
    let created = apply_request(&api, &cnr, args.dry_run).await?;
    println!("{}", created.name_any());
    Ok(())
}

/// Parse durations such as `30s`, `20m`, `1h30m` or `7d`
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {:?}: missing number before {:?}", input, c))?;
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            other => return Err(format!("invalid duration {:?}: unknown unit {:?}", input, other)),
        };
        total += value * unit;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("invalid duration {:?}: missing unit", input));
    }
    Ok(Duration::from_secs(total))
}
