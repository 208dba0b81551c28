use std::str::FromStr;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use serde::Serialize;
use tracing::info;
use wproc_controller::{kube_context, reconcile_key, ControllerConfig};
use wproc_core::{Cluster, Condition, WorkerProcess, WorkerProcessStore};

#[derive(Parser, Debug)]
#[command(name = "wprocctl", version, about = "Worker process operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (watch scope for `run`, target for `reconcile`)
    #[arg(long = "ns", global = true, env = "WPROC_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run,
    /// Print the custom resource definitions as YAML
    Crd,
    /// Reconcile one worker process once and print the outcome
    Reconcile {
        /// Worker process name
        name: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileReport {
    namespace: String,
    name: String,
    requeue_after_secs: u64,
    ready: bool,
    built_image: Option<String>,
    conditions: Vec<Condition>,
}

fn init_tracing() {
    let env = std::env::var("WPROC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WPROC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid WPROC_METRICS_ADDR; expected host:port");
        }
    }
}

fn crd_yaml() -> Result<String> {
    let docs = [
        serde_yaml::to_string(&WorkerProcess::crd()).context("serializing WorkerProcess CRD")?,
        serde_yaml::to_string(&Cluster::crd()).context("serializing Cluster CRD")?,
    ];
    Ok(docs.join("---\n"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            init_metrics();
            let mut config = ControllerConfig::from_env();
            config.namespace = cli.namespace.clone();
            let client = wproc_kubehub::get_kube_client().await?;
            wproc_controller::run(client, config).await?;
        }
        Commands::Crd => {
            print!("{}", crd_yaml()?);
        }
        Commands::Reconcile { name } => {
            let ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
            info!(ns = %ns, name = %name, "one-shot reconcile");
            let client = wproc_kubehub::get_kube_client().await?;
            let ctx = kube_context(client, ControllerConfig::from_env());
            let res = reconcile_key(&ctx, &ns, &name).await.with_context(|| format!("reconciling {}/{}", ns, name))?;
            let worker = ctx.workers.get_worker_process(&ns, &name).await.context("reading back worker process")?;
            let status = worker.and_then(|w| w.status).unwrap_or_default();
            let report = ReconcileReport {
                namespace: ns,
                name,
                requeue_after_secs: res.requeue_after.as_secs(),
                ready: status.ready,
                built_image: status.built_image,
                conditions: status.conditions,
            };
            match cli.output {
                Output::Human => {
                    let requeue = if res.is_done() { "default".to_string() } else { format!("{}s", report.requeue_after_secs) };
                    println!("{}/{} ready={} requeue={}", report.namespace, report.name, report.ready, requeue);
                    for c in &report.conditions {
                        println!("  {:<17} {:<8} {:<33} {}", c.type_, c.status.as_str(), c.reason, c.message);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }
    Ok(())
}
