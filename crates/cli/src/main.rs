use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Pod;
use mountpod_core::prelude::*;
use mountpod_kubehub::{get_kube_client, get_pod, list_pods, mount_selector, split_pod_key, watch_pods, KubePodClient, PodEvent};
use mountpod_patch::{MetadataPatcher, PatchError, PatcherConfig};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mountctl", version, about = "Inspect mount pods and edit their bookkeeping metadata")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Abort a patch after this many seconds; 0 disables (overrides MOUNTPOD_PATCH_TIMEOUT_SECS)
    #[arg(long = "timeout-secs", global = true)]
    timeout_secs: Option<u64>,

    /// Send patches without the resourceVersion test
    #[arg(long = "no-version-guard", global = true, action = ArgAction::SetTrue)]
    no_version_guard: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a single pod ("name" or "namespace/name")
    Inspect { pod: String },
    /// Classify every mount pod matching the selector
    Scan {
        /// Label selector (default: MOUNTPOD_MOUNT_SELECTOR or app.kubernetes.io/name=juicefs-mount)
        #[arg(long = "selector")]
        selector: Option<String>,
    },
    /// Watch mount pods and print verdict changes
    Watch {
        #[arg(long = "selector")]
        selector: Option<String>,
    },
    /// Print the source path and volume id a mount pod serves
    MountParams { pod: String },
    /// Print the reference annotations of a mount pod
    Refs { pod: String },
    /// Derive the reference key for a value (offline)
    RefKey { value: String },
    /// Remove every occurrence of a finalizer
    RemoveFinalizer { pod: String, finalizer: String },
    /// Add annotations, given as key=value
    Annotate {
        pod: String,
        #[arg(required = true, value_parser = parse_kv)]
        pairs: Vec<(String, String)>,
    },
    /// Remove annotation keys
    Unannotate {
        pod: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Replace the whole annotation set; unlisted keys are dropped
    ReplaceAnnotations {
        pod: String,
        #[arg(value_parser = parse_kv)]
        pairs: Vec<(String, String)>,
    },
}

fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

fn init_tracing() {
    let env = std::env::var("MOUNTPOD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MOUNTPOD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MOUNTPOD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Token cancelled on Ctrl-C so an in-flight patch is abandoned.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling in-flight request");
            t.cancel();
        }
    });
    token
}

fn patcher_config(cli: &Cli) -> PatcherConfig {
    let mut cfg = PatcherConfig::from_env();
    if let Some(secs) = cli.timeout_secs {
        cfg.timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if cli.no_version_guard {
        cfg.version_guard = false;
    }
    cfg
}

async fn fetch(cli: &Cli, key: &str) -> Result<Pod> {
    let (ns, name) = split_pod_key(key)?;
    let client = get_kube_client().await?;
    get_pod(client, ns.or(cli.namespace.as_deref()), name).await
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn pod_label(r: &PodReport) -> String {
    match &r.namespace {
        Some(ns) => format!("{}/{}", ns, r.name),
        None => r.name.clone(),
    }
}

fn print_reports(output: Output, reports: &[PodReport]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<48} {:<10} {:<19} {}", "POD", "PHASE", "VERDICT", "REQUESTS");
            for r in reports {
                let phase = r.phase.map(|p| p.as_str()).unwrap_or("-");
                let requests = if r.has_resources { "yes" } else { "no" };
                println!("{:<48} {:<10} {:<19} {}", pod_label(r), phase, r.verdict.as_str(), requests);
            }
            Ok(())
        }
        Output::Json => print_json(&reports),
    }
}

#[derive(Serialize)]
struct PatchOutcome<'a> {
    pod: String,
    op: &'a str,
    patched: bool,
}

fn report_patch(output: Output, pod: &Pod, op: &str, res: Result<(), PatchError>) -> Result<()> {
    let label = PodRef::from_pod(pod).to_string();
    if let Err(e) = &res {
        if e.is_conflict() {
            error!(pod = %label, op, "pod changed since it was read; re-run to retry against the fresh version");
        } else {
            error!(pod = %label, op, error = %e, retryable = e.is_retryable(), "patch failed");
        }
    }
    res.with_context(|| format!("{} failed", op))?;
    match output {
        Output::Human => println!("pod {} patched ({})", label, op),
        Output::Json => print_json(&PatchOutcome { pod: label, op, patched: true })?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Inspect { pod } => {
            let p = fetch(&cli, pod).await?;
            print_reports(cli.output, &[PodReport::of(&p)])?;
        }
        Commands::Scan { selector } => {
            let selector = selector.clone().unwrap_or_else(mount_selector);
            info!(selector = %selector, ns = ?cli.namespace, "scan invoked");
            let client = get_kube_client().await?;
            let pods = list_pods(client, cli.namespace.as_deref(), &selector).await?;
            let reports: Vec<_> = pods.iter().map(PodReport::of).collect();
            print_reports(cli.output, &reports)?;
        }
        Commands::Watch { selector } => {
            let selector = selector.clone().unwrap_or_else(mount_selector);
            info!(selector = %selector, ns = ?cli.namespace, "watch invoked");
            let (tx, mut rx) = mpsc::channel::<PodEvent>(256);
            let watcher_handle = tokio::spawn({
                let ns = cli.namespace.clone();
                let selector = selector.clone();
                async move {
                    if let Err(e) = watch_pods(ns.as_deref(), &selector, tx).await {
                        error!(error = ?e, "watcher failed");
                    }
                }
            });
            // only print when a pod's verdict changes
            let mut last: HashMap<String, PodVerdict> = HashMap::new();
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(PodEvent::Applied(r)) => {
                                let key = pod_label(&r);
                                if last.insert(key.clone(), r.verdict) == Some(r.verdict) { continue; }
                                match cli.output {
                                    Output::Human => println!("~ {} {}", key, r.verdict.as_str()),
                                    Output::Json => println!("{}", serde_json::to_string(&r)?),
                                }
                            }
                            Some(PodEvent::Deleted(r)) => {
                                let key = pod_label(&r);
                                last.remove(&key);
                                match cli.output {
                                    Output::Human => println!("- {}", key),
                                    Output::Json => println!("{}", serde_json::json!({"deleted": key})),
                                }
                            }
                            None => {
                                warn!("watch channel closed; exiting");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            watcher_handle.abort();
        }
        Commands::MountParams { pod } => {
            let p = fetch(&cli, pod).await?;
            let params = mount_params_default(&p)?;
            match cli.output {
                Output::Human => println!("source: {}\nvolume: {}", params.source_path, params.volume_id),
                Output::Json => print_json(&params)?,
            }
        }
        Commands::Refs { pod } => {
            let p = fetch(&cli, pod).await?;
            let refs = reference_annotations(&p, &Sha256ReferenceKey);
            match cli.output {
                Output::Human => {
                    println!("{} reference(s)", refs.len());
                    for (k, v) in &refs { println!("{} = {}", k, v); }
                }
                Output::Json => print_json(&refs)?,
            }
        }
        Commands::RefKey { value } => {
            let key = reference_key(value);
            match cli.output {
                Output::Human => println!("{}", key),
                Output::Json => println!("{}", serde_json::json!({"value": value, "key": key})),
            }
        }
        Commands::RemoveFinalizer { pod, finalizer } => {
            let p = fetch(&cli, pod).await?;
            let patcher = MetadataPatcher::with_config(KubePodClient::try_default().await?, patcher_config(&cli))
                .with_cancellation(cancel_on_ctrl_c());
            let res = patcher.remove_finalizer(&p, finalizer).await;
            report_patch(cli.output, &p, "remove_finalizer", res)?;
        }
        Commands::Annotate { pod, pairs } => {
            let p = fetch(&cli, pod).await?;
            let add: BTreeMap<String, String> = pairs.iter().cloned().collect();
            let patcher = MetadataPatcher::with_config(KubePodClient::try_default().await?, patcher_config(&cli))
                .with_cancellation(cancel_on_ctrl_c());
            let res = patcher.add_annotations(&p, &add).await;
            report_patch(cli.output, &p, "add_annotations", res)?;
        }
        Commands::Unannotate { pod, keys } => {
            let p = fetch(&cli, pod).await?;
            let patcher = MetadataPatcher::with_config(KubePodClient::try_default().await?, patcher_config(&cli))
                .with_cancellation(cancel_on_ctrl_c());
            let res = patcher.remove_annotations(&p, keys.as_slice()).await;
            report_patch(cli.output, &p, "remove_annotations", res)?;
        }
        Commands::ReplaceAnnotations { pod, pairs } => {
            let p = fetch(&cli, pod).await?;
            let all: BTreeMap<String, String> = pairs.iter().cloned().collect();
            let patcher = MetadataPatcher::with_config(KubePodClient::try_default().await?, patcher_config(&cli))
                .with_cancellation(cancel_on_ctrl_c());
            let res = patcher.replace_annotations(&p, &all).await;
            report_patch(cli.output, &p, "replace_annotations", res)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_kv_splits_on_first_equals() {
        assert_eq!(parse_kv("a=1").unwrap(), ("a".to_string(), "1".to_string()));
        assert_eq!(parse_kv("juicefs.com/x=a=b").unwrap(), ("juicefs.com/x".to_string(), "a=b".to_string()));
        assert_eq!(parse_kv("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_kv("novalue").is_err());
        assert!(parse_kv("=v").is_err());
    }

    #[test]
    fn global_flags_shape_patcher_config() {
        let cli = Cli::try_parse_from(["mountctl", "--timeout-secs", "5", "--no-version-guard", "remove-finalizer", "kube-system/p", "f"]).unwrap();
        let cfg = patcher_config(&cli);
        assert_eq!(cfg.timeout, Some(Duration::from_secs(5)));
        assert!(!cfg.version_guard);

        let cli = Cli::try_parse_from(["mountctl", "annotate", "p", "a=1", "b=2", "--timeout-secs", "0"]).unwrap();
        assert_eq!(patcher_config(&cli).timeout, None);
        match cli.command {
            Commands::Annotate { pairs, .. } => assert_eq!(pairs.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn watch_takes_optional_selector() {
        let cli = Cli::try_parse_from(["mountctl", "--ns", "kube-system", "watch", "--selector", "app=jfs"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("kube-system"));
        assert!(matches!(cli.command, Commands::Watch { selector: Some(ref s) } if s == "app=jfs"));
        let cli = Cli::try_parse_from(["mountctl", "watch"]).unwrap();
        assert!(matches!(cli.command, Commands::Watch { selector: None }));
    }

    #[test]
    fn annotate_requires_pairs() {
        assert!(Cli::try_parse_from(["mountctl", "annotate", "p"]).is_err());
        assert!(Cli::try_parse_from(["mountctl", "annotate", "p", "bad"]).is_err());
    }
}
