use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use argus_client::{ClientEvent, ClusterStream, HttpTransport, WatchOptions};
use argus_kube::KubeClientProvider;
use argus_server::{start_server, KubeconfigDirRegistry, ServerConfig};
use argus_watch::{WatchConfig, WatchManager};

#[derive(Parser, Debug)]
#[command(name = "argusctl", version, about = "Argus cluster dashboard sync backend")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Listen address, e.g. 0.0.0.0:8084
        #[arg(long = "addr")]
        addr: Option<std::net::SocketAddr>,
        /// Directory of per-cluster kubeconfigs (<cluster>.yaml)
        #[arg(long = "kubeconfig-dir")]
        kubeconfig_dir: Option<std::path::PathBuf>,
    },
    /// Tail a cluster's event stream from a running server
    Watch {
        /// Cluster id as known to the server
        cluster: String,
        /// Comma-separated kinds (nodes,pods,deployments,events)
        #[arg(long = "resources")]
        resources: Option<String>,
        /// Namespace filter
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Server base URL
        #[arg(long = "url", default_value = "http://127.0.0.1:8084")]
        url: String,
    },
}

fn init_tracing() {
    let env = std::env::var("ARGUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARGUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARGUS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, kubeconfig_dir } => {
            let mut config = ServerConfig::from_env();
            if let Some(addr) = addr {
                config.http_addr = addr;
            }
            let dir = kubeconfig_dir
                .or_else(|| std::env::var("ARGUS_KUBECONFIG_DIR").ok().map(Into::into))
                .unwrap_or_else(|| "clusters".into());
            info!(addr = %config.http_addr, kubeconfig_dir = %dir.display(), "serve invoked");
            let registry = Arc::new(KubeconfigDirRegistry::new(dir));
            let manager =
                WatchManager::new(Arc::new(KubeClientProvider::new()), WatchConfig::from_env());
            start_server(config, manager, registry).await?;
        }
        Commands::Watch { cluster, resources, namespace, url } => {
            let mut stream_url =
                format!("{}/api/clusters/{}/stream", url.trim_end_matches('/'), cluster);
            let mut query = Vec::new();
            if let Some(resources) = resources {
                query.push(format!("resources={resources}"));
            }
            if let Some(ns) = namespace {
                query.push(format!("namespace={ns}"));
            }
            if !query.is_empty() {
                stream_url = format!("{}?{}", stream_url, query.join("&"));
            }
            info!(url = %stream_url, "watch invoked");
            let transport = Arc::new(HttpTransport::new()?);
            let mut stream =
                argus_client::connect(stream_url, transport, WatchOptions::default());
            tail(&mut stream, cli.output).await;
            stream.shutdown();
        }
    }
    Ok(())
}

async fn tail(stream: &mut ClusterStream, output: Output) {
    let mut states = stream.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_ok() {
                    eprintln!("connection: {:?}", *states.borrow());
                } else {
                    break;
                }
            }
            event = stream.events.recv() => match event {
                Some(event) => print_event(output, &event),
                None => break,
            },
        }
    }
}

fn print_event(output: Output, event: &ClientEvent) {
    match output {
        Output::Json => {
            if let Some(line) = json_line(event) {
                println!("{line}");
            }
        }
        Output::Human => match event {
            ClientEvent::Status { watching, connected, error } => {
                let kinds: Vec<&str> = watching.iter().map(|k| k.plural()).collect();
                match error {
                    Some(error) => eprintln!("status: connected={connected} error={error}"),
                    None => eprintln!("status: connected={connected} watching={}", kinds.join(",")),
                }
            }
            ClientEvent::Ping { .. } => {}
            ClientEvent::Change { kind, action, resource, .. } => {
                let sigil = match action {
                    argus_core::ChangeAction::Added => '+',
                    argus_core::ChangeAction::Modified => '~',
                    argus_core::ChangeAction::Deleted => '-',
                };
                println!("{} {} {}", sigil, kind.singular(), object_name(resource));
            }
            ClientEvent::Snapshot { kind, resources, .. } => {
                println!("= {} ({} items)", kind.plural(), resources.len());
            }
            ClientEvent::Health(h) => {
                println!(
                    "health: nodes {}/{} pods {}/{} deployments {}/{} warnings {}",
                    h.nodes_ready,
                    h.nodes_total,
                    h.pods_running,
                    h.pods_total,
                    h.deployments_healthy,
                    h.deployments_total,
                    h.warning_events
                );
            }
        },
    }
}

fn object_name(resource: &serde_json::Value) -> String {
    let meta = resource.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("?");
    match meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()) {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

fn json_line(event: &ClientEvent) -> Option<String> {
    let value = match event {
        ClientEvent::Status { watching, connected, error } => serde_json::json!({
            "event": "status",
            "watching": watching.iter().map(|k| k.plural()).collect::<Vec<_>>(),
            "connected": connected,
            "error": error,
        }),
        ClientEvent::Ping { .. } => return None,
        ClientEvent::Change { kind, action, resource, resource_version } => serde_json::json!({
            "event": kind.singular(),
            "action": action,
            "resource": resource,
            "resourceVersion": resource_version,
        }),
        ClientEvent::Snapshot { kind, resources, resource_version } => serde_json::json!({
            "event": kind.plural(),
            "action": "SNAPSHOT",
            "resource": resources,
            "resourceVersion": resource_version,
        }),
        ClientEvent::Health(snapshot) => serde_json::json!({
            "event": "health",
            "resource": snapshot,
        }),
    };
    Some(value.to_string())
}
