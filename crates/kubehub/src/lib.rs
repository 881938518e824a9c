//! Mountpod kubehub: kube client wiring, mount pod access and the kube-backed
//! [`PodPatchClient`].

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::KubeConfigOptions,
    runtime::watcher::{self, Event},
    Client, Config,
};
use mountpod_core::{pod::PodReport, ApplyError, PatchKind, PodPatchClient, PodRef};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_MOUNT_SELECTOR: &str = "app.kubernetes.io/name=juicefs-mount";

const RESOURCE_VERSION_POINTER: &str = "/metadata/resourceVersion";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client; honours `MOUNTPOD_KUBE_CONTEXT` on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = build_client().await?;
    Ok(CLIENT.get_or_init(|| client).clone())
}

async fn build_client() -> Result<Client> {
    match std::env::var("MOUNTPOD_KUBE_CONTEXT").ok().filter(|s| !s.is_empty()) {
        Some(context) => {
            let opts = KubeConfigOptions { context: Some(context.clone()), ..Default::default() };
            let cfg = Config::from_kubeconfig(&opts)
                .await
                .with_context(|| format!("loading kubeconfig context {}", context))?;
            info!(context = %context, "kube client using explicit context");
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("inferring kube config"),
    }
}

/// Label selector for mount pods (`MOUNTPOD_MOUNT_SELECTOR`).
pub fn mount_selector() -> String {
    std::env::var("MOUNTPOD_MOUNT_SELECTOR")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MOUNT_SELECTOR.to_string())
}

fn pods_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::default_namespaced(client),
    }
}

pub async fn get_pod(client: Client, namespace: Option<&str>, name: &str) -> Result<Pod> {
    pods_api(client, namespace)
        .get(name)
        .await
        .with_context(|| format!("fetching pod {}", name))
}

/// List pods matching `selector`; all namespaces when `namespace` is `None`.
pub async fn list_pods(client: Client, namespace: Option<&str>, selector: &str) -> Result<Vec<Pod>> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let lp = ListParams::default().labels(selector);
    let list = api.list(&lp).await.with_context(|| format!("listing pods with {}", selector))?;
    debug!(count = list.items.len(), selector, "listed pods");
    Ok(list.items)
}

/// Pod change as seen by [`watch_pods`].
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(PodReport),
    Deleted(PodReport),
}

/// List+watch pods matching `selector` and send a classified event per change.
pub async fn watch_pods(namespace: Option<&str>, selector: &str, tx: mpsc::Sender<PodEvent>) -> Result<()> {
    let client = get_kube_client().await?;
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(selector);
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(selector, ns = ?namespace, "pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        let out: Vec<PodEvent> = match ev {
            Event::Applied(p) => vec![PodEvent::Applied(PodReport::of(&p))],
            Event::Deleted(p) => vec![PodEvent::Deleted(PodReport::of(&p))],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(|p| PodEvent::Applied(PodReport::of(p))).collect()
            }
        };
        for e in out {
            if tx.send(e).await.is_err() {
                debug!("pod event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

/// [`PodPatchClient`] backed by the API server.
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }
}

#[async_trait::async_trait]
impl PodPatchClient for KubePodClient {
    async fn patch_pod(&self, target: &PodRef, payload: &[u8], kind: PatchKind) -> Result<(), ApplyError> {
        let api = pods_api(self.client.clone(), target.namespace.as_deref());
        let pp = PatchParams::default();
        let res = match kind {
            PatchKind::Json => {
                let ops: json_patch::Patch = serde_json::from_slice(payload)?;
                api.patch(&target.name, &pp, &Patch::Json::<()>(ops)).await
            }
            PatchKind::Merge => {
                let body: serde_json::Value = serde_json::from_slice(payload)?;
                api.patch(&target.name, &pp, &Patch::Merge(&body)).await
            }
            PatchKind::Strategic => {
                let body: serde_json::Value = serde_json::from_slice(payload)?;
                api.patch(&target.name, &pp, &Patch::Strategic(&body)).await
            }
        };
        match res {
            Ok(p) => {
                debug!(pod = %target, rv = ?p.metadata.resource_version, "pod patched");
                Ok(())
            }
            Err(e) => Err(apply_error(e)),
        }
    }
}

/// Map kube errors onto [`ApplyError`]. A failed resourceVersion `test` means
/// the object moved on since it was read, so it counts as a conflict; any
/// other 400/422 is a rejection.
pub fn apply_error(e: kube::Error) -> ApplyError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ApplyError::NotFound(ae.message),
            409 => ApplyError::Conflict(ae.message),
            400 | 422 if is_failed_version_test(&ae.message) => ApplyError::Conflict(ae.message),
            code => ApplyError::Rejected { code, message: ae.message },
        },
        kube::Error::SerdeError(e) => ApplyError::Decode(e),
        other => ApplyError::Transport(other.to_string()),
    }
}

/// The API server reports a failed `test` op as
/// `testing value /metadata/resourceVersion failed: test failed`.
fn is_failed_version_test(message: &str) -> bool {
    message.contains("testing value") && message.contains(RESOURCE_VERSION_POINTER)
}

/// `namespace/name` → (Some(namespace), name); bare names pass through.
pub fn split_pod_key(key: &str) -> Result<(Option<&str>, &str)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(anyhow!("invalid pod key: {} (expect name or namespace/name)", key)),
    }
}
