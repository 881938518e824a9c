//! Mountpod core: pod state predicates, mount parameters and reference keys.
//!
//! Everything here is pure and operates on `k8s_openapi` pod snapshots. The one
//! seam to the outside world is [`PodPatchClient`], which the patch crate drives
//! and the kubehub crate implements against a live API server.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

pub mod mount;
pub mod pod;
pub mod refs;

pub mod prelude {
    pub use super::mount::{mount_params, mount_params_default, JfsMountParser, MountInvocationParser, MountParams, MountParamsError};
    pub use super::pod::{has_error, is_ready, is_resource_error, verdict, PodPhase, PodReport, PodVerdict};
    pub use super::refs::{reference_annotations, reference_key, ReferenceKeyDeriver, Sha256ReferenceKey};
    pub use super::{ApplyError, PatchKind, PodPatchClient, PodRef};
}

/// Name of the pod, or an empty string for an unnamed snapshot.
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

/// Identifies the object a patch payload is addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: Option<String>,
    pub name: String,
    /// resourceVersion observed when the snapshot was taken.
    pub resource_version: Option<String>,
}

impl PodRef {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone(),
            name: pod_name(pod).to_string(),
            resource_version: pod.metadata.resource_version.clone(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Patch flavour understood by the API server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PatchKind {
    /// RFC 6902 operation list
    Json,
    /// RFC 7386 merge patch
    Merge,
    Strategic,
}

/// Failure reported by a [`PodPatchClient`].
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transport: {0}")]
    Transport(String),
}

impl ApplyError {
    pub fn is_conflict(&self) -> bool { matches!(self, ApplyError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, ApplyError::NotFound(_)) }

    /// Worth retrying after re-reading the object.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Conflict(_) | ApplyError::Transport(_))
    }
}

/// Applies a serialized patch payload to a single pod.
///
/// Implementations perform no retries; a version mismatch must surface as
/// [`ApplyError::Conflict`].
#[async_trait::async_trait]
pub trait PodPatchClient: Send + Sync {
    async fn patch_pod(&self, target: &PodRef, payload: &[u8], kind: PatchKind) -> Result<(), ApplyError>;
}

#[async_trait::async_trait]
impl<T: PodPatchClient + ?Sized> PodPatchClient for std::sync::Arc<T> {
    async fn patch_pod(&self, target: &PodRef, payload: &[u8], kind: PatchKind) -> Result<(), ApplyError> {
        (**self).patch_pod(target, payload, kind).await
    }
}
