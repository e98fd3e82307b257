use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use alb_ingress::annotations::AnnotationResolver;
use alb_ingress::aws::InMemoryElbv2;
use alb_ingress::cluster::ClusterLookups;
use alb_ingress::events::{EventSink, MemoryEventSink};
use alb_ingress::ingress::{AlbIngress, FromIngressOptions, ReconcileOptions};
use alb_ingress::telemetry::{self, LogFormat, TelemetryConfig};
use alb_ingress::Error;
use clap::{Parser, Subcommand};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,
    /// Build the load balancer tree for an Ingress manifest without touching AWS
    Render(RenderArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Path to an Ingress manifest (YAML or JSON)
    #[arg(long, short)]
    file: PathBuf,

    /// Cluster name, used as the prefix of every resource name
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    /// EC2 instance id of a node receiving traffic (repeatable)
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Node port of a backend, as `service:port=nodePort` (repeatable)
    #[arg(long = "node-port", value_parser = parse_node_port)]
    node_ports: Vec<NodePortArg>,

    /// Reconcile against an empty in-memory ELBv2 and print the calls it makes
    #[arg(long)]
    plan: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Debug)]
struct NodePortArg {
    service: String,
    port: String,
    node_port: i32,
}

fn parse_node_port(value: &str) -> Result<NodePortArg, String> {
    let (backend, node_port) = value
        .split_once('=')
        .ok_or_else(|| format!("expected service:port=nodePort, got {value:?}"))?;
    let (service, port) = backend
        .split_once(':')
        .ok_or_else(|| format!("expected service:port=nodePort, got {value:?}"))?;
    let node_port = node_port
        .parse()
        .map_err(|_| format!("node port {node_port:?} is not a number"))?;
    Ok(NodePortArg {
        service: service.to_string(),
        port: port.to_string(),
        node_port,
    })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("alb-ingress v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Render(render_args) => {
            telemetry::init(&TelemetryConfig {
                log_format: render_args.log_format,
                ..Default::default()
            })?;
            let result = run_render(render_args).await;
            telemetry::shutdown();
            result
        }
    }
}

async fn run_render(args: RenderArgs) -> Result<(), Error> {
    let manifest = std::fs::read_to_string(&args.file)?;
    let ingress: Ingress = serde_yaml::from_str(&manifest)?;
    let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());

    let node_ports: BTreeMap<(String, String, String), i32> = args
        .node_ports
        .into_iter()
        .map(|np| ((namespace.clone(), np.service, np.port), np.node_port))
        .collect();
    let lookups = ClusterLookups::fixed(node_ports, args.nodes);
    let resolver = AnnotationResolver::default();
    let sink = Arc::new(MemoryEventSink::new());
    let events: Arc<dyn EventSink> = sink.clone();

    let assembly = AlbIngress::from_ingress(FromIngressOptions {
        ingress: &ingress,
        existing: None,
        cluster_name: &args.cluster_name,
        resolver: &resolver,
        lookups: &lookups,
        events: Some(events),
    })
    .await;
    let aggregate = assembly.ingress;

    for event in sink.warnings() {
        warn!(ingress = %aggregate.id(), reason = %event.reason, "{}", event.message);
    }
    if !assembly.valid {
        return Err(Error::ConfigError(format!(
            "ingress {} could not be assembled",
            aggregate.id()
        )));
    }

    let mut output = serde_json::json!({
        "id": aggregate.id(),
        "valid": assembly.valid,
        "tags": aggregate.tags().await,
        "loadBalancer": aggregate.load_balancer().await,
    });

    if args.plan {
        let elbv2 = InMemoryElbv2::new();
        aggregate.reconcile(&ReconcileOptions { elbv2: &elbv2 }).await;
        let plan = elbv2.mutations();
        info!(ingress = %aggregate.id(), calls = plan.len(), "Planned reconcile");
        output["plan"] = serde_json::json!(plan);
        output["hostnames"] = serde_json::to_value(aggregate.hostnames().await?)?;
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
