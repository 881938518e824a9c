//! Recover mount parameters from a mount pod's launch command.
//!
//! Mount pods are launched as `sh -c "<mount invocation>"`, so the invocation
//! is always the third token of the primary container's command. Any change to
//! how mount pods are launched has to be mirrored here.

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::pod::containers;

pub const DEFAULT_MOUNT_BASE: &str = "/jfs";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountParams {
    pub source_path: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseMountError {
    #[error("mount invocation has too few fields: {0:?}")]
    TooFewFields(String),
    #[error("mount path {path:?} is not under {base:?}")]
    OutsideBase { path: String, base: String },
    #[error("mount path {0:?} names no volume")]
    MissingVolumeId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MountParamsError {
    #[error("pod {pod} has no container")]
    NoContainer { pod: String },
    #[error("pod {pod} has malformed mount command: {command:?}")]
    MalformedCommand { pod: String, command: Vec<String> },
    #[error(transparent)]
    Parse(#[from] ParseMountError),
}

impl MountParamsError {
    /// The pod itself is malformed; retrying will not help.
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, MountParamsError::NoContainer { .. } | MountParamsError::MalformedCommand { .. })
    }
}

/// Splits an encoded mount invocation into source path and volume id.
pub trait MountInvocationParser: Send + Sync {
    fn parse(&self, invocation: &str) -> Result<MountParams, ParseMountError>;
}

/// Parser for `[exec] <mount binary> <meta url> <base>/<volume id>[/...] [options]`.
/// Multi-line scripts are read from their last non-empty line, where the
/// mount binary is exec'd after any preparation steps.
#[derive(Debug, Clone)]
pub struct JfsMountParser {
    base: String,
}

impl Default for JfsMountParser {
    fn default() -> Self { Self::new(DEFAULT_MOUNT_BASE) }
}

impl JfsMountParser {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        let trimmed = base.trim_end_matches('/');
        Self { base: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() } }
    }

    /// Mount base from `MOUNTPOD_MOUNT_BASE`, falling back to `/jfs`.
    pub fn from_env() -> Self {
        std::env::var("MOUNTPOD_MOUNT_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn base(&self) -> &str { &self.base }
}

impl MountInvocationParser for JfsMountParser {
    fn parse(&self, invocation: &str) -> Result<MountParams, ParseMountError> {
        let line = invocation.lines().map(str::trim).rev().find(|l| !l.is_empty()).unwrap_or("");
        let mut fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&"exec") {
            fields.remove(0);
        }
        if fields.len() < 3 {
            return Err(ParseMountError::TooFewFields(invocation.to_string()));
        }
        let path = fields[2];
        let below = if self.base == "/" { path.strip_prefix('/') } else { path.strip_prefix(self.base.as_str()).and_then(|r| r.strip_prefix('/')) };
        let below = below.ok_or_else(|| ParseMountError::OutsideBase { path: path.to_string(), base: self.base.clone() })?;
        let volume_id = below.split('/').next().filter(|s| !s.is_empty()).ok_or_else(|| ParseMountError::MissingVolumeId(path.to_string()))?;
        Ok(MountParams { source_path: path.to_string(), volume_id: volume_id.to_string() })
    }
}

/// Extract mount parameters from the pod's primary container.
pub fn mount_params<P>(pod: &Pod, parser: &P) -> Result<MountParams, MountParamsError>
where
    P: MountInvocationParser + ?Sized,
{
    let pod_name = crate::pod_name(pod);
    let container = containers(pod)
        .first()
        .ok_or_else(|| MountParamsError::NoContainer { pod: pod_name.to_string() })?;
    let command = container.command.as_deref().unwrap_or(&[]);
    if command.len() < 3 {
        return Err(MountParamsError::MalformedCommand { pod: pod_name.to_string(), command: command.to_vec() });
    }
    Ok(parser.parse(&command[2])?)
}

/// [`mount_params`] with the environment-configured [`JfsMountParser`].
pub fn mount_params_default(pod: &Pod) -> Result<MountParams, MountParamsError> {
    mount_params(pod, &JfsMountParser::from_env())
}
