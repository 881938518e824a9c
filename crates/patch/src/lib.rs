//! Mountpod patch: finalizer and annotation mutations on mount pods.
//!
//! Each operation builds a JSON-Patch op list, prepends a resourceVersion
//! `test` (unless disabled), serializes it and hands it to a
//! [`PodPatchClient`]. There is no retry loop here; a stale snapshot surfaces
//! as a retryable [`PatchError`] and the caller decides what to do.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, histogram};
use mountpod_core::{ApplyError, PatchKind, PodPatchClient, PodRef};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod ops;

pub use ops::{
    add_annotation_ops, annotation_path, escape_token, finalizers_without, remove_annotation_ops, remove_finalizer_ops,
    replace_annotation_ops, version_guard, PatchOp, ANNOTATIONS_PATH, FINALIZERS_PATH, RESOURCE_VERSION_PATH,
};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("{op} on pod {pod}: encoding patch: {source}")]
    Serialize { pod: String, op: &'static str, source: serde_json::Error },
    #[error("{op} on pod {pod}: {source}")]
    Remote { pod: String, op: &'static str, source: ApplyError },
    #[error("{op} on pod {pod}: cancelled")]
    Cancelled { pod: String, op: &'static str },
    #[error("{op} on pod {pod}: timed out after {after:?}")]
    TimedOut { pod: String, op: &'static str, after: Duration },
}

impl PatchError {
    pub fn pod(&self) -> &str {
        match self {
            PatchError::Serialize { pod, .. }
            | PatchError::Remote { pod, .. }
            | PatchError::Cancelled { pod, .. }
            | PatchError::TimedOut { pod, .. } => pod,
        }
    }

    /// Re-reading the pod and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PatchError::Remote { source, .. } => source.is_retryable(),
            PatchError::TimedOut { .. } => true,
            PatchError::Serialize { .. } | PatchError::Cancelled { .. } => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PatchError::Remote { source, .. } if source.is_conflict())
    }
}

/// Patcher knobs; see [`PatcherConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatcherConfig {
    pub version_guard: bool,
    pub timeout: Option<Duration>,
}

impl Default for PatcherConfig {
    fn default() -> Self { Self { version_guard: true, timeout: None } }
}

impl PatcherConfig {
    /// `MOUNTPOD_PATCH_TIMEOUT_SECS` (0 or unset: no timeout) and
    /// `MOUNTPOD_DISABLE_VERSION_GUARD=1|true`.
    pub fn from_env() -> Self {
        let timeout = std::env::var("MOUNTPOD_PATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        let guard_disabled = std::env::var("MOUNTPOD_DISABLE_VERSION_GUARD")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { version_guard: !guard_disabled, timeout }
    }
}

pub struct MetadataPatcher<C> {
    client: C,
    cfg: PatcherConfig,
    cancel: CancellationToken,
}

impl<C: PodPatchClient> MetadataPatcher<C> {
    pub fn new(client: C) -> Self { Self::with_config(client, PatcherConfig::default()) }

    pub fn with_config(client: C, cfg: PatcherConfig) -> Self {
        Self { client, cfg, cancel: CancellationToken::new() }
    }

    pub fn with_version_guard(mut self, on: bool) -> Self { self.cfg.version_guard = on; self }
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self { self.cfg.timeout = timeout; self }

    /// Calls in flight when `token` fires are dropped and fail with `Cancelled`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self { self.cancel = token; self }

    pub fn config(&self) -> &PatcherConfig { &self.cfg }
    pub fn client(&self) -> &C { &self.client }

    /// Replace the finalizer list with every `name` removed. A snapshot
    /// without a finalizer list still sends the version guard alone, so a
    /// list added since the read surfaces as a conflict.
    pub async fn remove_finalizer(&self, pod: &Pod, name: &str) -> Result<(), PatchError> {
        match (remove_finalizer_ops(pod, name), self.guard(pod)) {
            (Some(ops), _) => self.apply(pod, "remove_finalizer", ops).await,
            (None, Some(guard)) => self.send(pod, "remove_finalizer", vec![guard]).await,
            (None, None) => {
                debug!(pod = %PodRef::from_pod(pod), finalizer = name, "no finalizers and no version to check; nothing to send");
                Ok(())
            }
        }
    }

    pub async fn add_annotations(&self, pod: &Pod, annotations: &BTreeMap<String, String>) -> Result<(), PatchError> {
        let ops = add_annotation_ops(pod, annotations, self.guard(pod).is_some());
        self.apply(pod, "add_annotations", ops).await
    }

    /// Removing a key the pod does not carry is a remote error.
    pub async fn remove_annotations<S: AsRef<str>>(&self, pod: &Pod, keys: &[S]) -> Result<(), PatchError> {
        self.apply(pod, "remove_annotations", remove_annotation_ops(keys)).await
    }

    /// Replace the whole annotation object; keys not in `annotations` are dropped.
    pub async fn replace_annotations(&self, pod: &Pod, annotations: &BTreeMap<String, String>) -> Result<(), PatchError> {
        self.apply(pod, "replace_annotations", replace_annotation_ops(annotations)).await
    }

    /// The `test` op this patcher prepends for `pod`, if any.
    fn guard(&self, pod: &Pod) -> Option<PatchOp> {
        if self.cfg.version_guard { version_guard(pod) } else { None }
    }

    async fn apply(&self, pod: &Pod, op: &'static str, mut ops: Vec<PatchOp>) -> Result<(), PatchError> {
        if ops.is_empty() {
            debug!(pod = %PodRef::from_pod(pod), op, "empty patch; skipping");
            return Ok(());
        }
        if let Some(guard) = self.guard(pod) {
            ops.insert(0, guard);
        }
        self.send(pod, op, ops).await
    }

    async fn send(&self, pod: &Pod, op: &'static str, ops: Vec<PatchOp>) -> Result<(), PatchError> {
        let target = PodRef::from_pod(pod);
        let payload = serde_json::to_vec(&ops).map_err(|source| PatchError::Serialize { pod: target.to_string(), op, source })?;

        counter!("mountpod_patch_attempts", 1u64, "op" => op);
        let t0 = Instant::now();
        debug!(pod = %target, op, ops = ops.len(), guarded = matches!(ops.first(), Some(PatchOp::Test { .. })), "patching pod");

        let call = self.client.patch_pod(&target, &payload, PatchKind::Json);
        let bounded = async {
            match self.cfg.timeout {
                Some(after) => match tokio::time::timeout(after, call).await {
                    Ok(res) => res.map_err(|source| PatchError::Remote { pod: target.to_string(), op, source }),
                    Err(_) => Err(PatchError::TimedOut { pod: target.to_string(), op, after }),
                },
                None => call.await.map_err(|source| PatchError::Remote { pod: target.to_string(), op, source }),
            }
        };
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PatchError::Cancelled { pod: target.to_string(), op }),
            res = bounded => res,
        };

        match &res {
            Ok(()) => {
                histogram!("mountpod_patch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
                counter!("mountpod_patch_ok", 1u64, "op" => op);
            }
            Err(e) => {
                counter!("mountpod_patch_err", 1u64, "op" => op);
                debug!(pod = %target, op, error = %e, retryable = e.is_retryable(), "patch failed");
            }
        }
        res
    }
}
