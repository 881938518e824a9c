//! RFC 6902 operation builders for pod metadata.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const FINALIZERS_PATH: &str = "/metadata/finalizers";
pub const ANNOTATIONS_PATH: &str = "/metadata/annotations";
pub const RESOURCE_VERSION_PATH: &str = "/metadata/resourceVersion";

/// One JSON-Patch operation. A `Vec<PatchOp>` is one atomic request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Json },
    Remove { path: String },
    Replace { path: String, value: Json },
    Test { path: String, value: Json },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } | PatchOp::Test { path, .. } => path,
        }
    }
}

/// Escape a single JSON-pointer reference token (`~` then `/`).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

pub fn annotation_path(key: &str) -> String {
    format!("{}/{}", ANNOTATIONS_PATH, escape_token(key))
}

/// Finalizers of `pod` with every occurrence of `name` removed, order kept.
pub fn finalizers_without(pod: &Pod, name: &str) -> Vec<String> {
    pod.metadata
        .finalizers
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter(|f| f.as_str() != name)
        .cloned()
        .collect()
}

/// Whole-list replace, since JSON Patch cannot remove list members by value.
/// `None` when the pod carries no finalizer list.
pub fn remove_finalizer_ops(pod: &Pod, name: &str) -> Option<Vec<PatchOp>> {
    pod.metadata.finalizers.as_ref()?;
    let remaining = finalizers_without(pod, name);
    Some(vec![PatchOp::Replace { path: FINALIZERS_PATH.to_string(), value: Json::from(remaining) }])
}

/// One `add` per key. The parent object is created only when `guarded`: an
/// unguarded `add /metadata/annotations` would overwrite annotations written
/// since the snapshot was read.
pub fn add_annotation_ops(pod: &Pod, annotations: &BTreeMap<String, String>, guarded: bool) -> Vec<PatchOp> {
    let mut ops = Vec::with_capacity(annotations.len() + 1);
    if guarded && pod.metadata.annotations.is_none() && !annotations.is_empty() {
        ops.push(PatchOp::Add { path: ANNOTATIONS_PATH.to_string(), value: Json::Object(Default::default()) });
    }
    ops.extend(annotations.iter().map(|(k, v)| PatchOp::Add { path: annotation_path(k), value: Json::String(v.clone()) }));
    ops
}

pub fn remove_annotation_ops<S: AsRef<str>>(keys: &[S]) -> Vec<PatchOp> {
    keys.iter().map(|k| PatchOp::Remove { path: annotation_path(k.as_ref()) }).collect()
}

pub fn replace_annotation_ops(annotations: &BTreeMap<String, String>) -> Vec<PatchOp> {
    let value = annotations.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect();
    vec![PatchOp::Replace { path: ANNOTATIONS_PATH.to_string(), value: Json::Object(value) }]
}

/// `test` on the snapshot's resourceVersion, if it has one.
pub fn version_guard(pod: &Pod) -> Option<PatchOp> {
    let rv = pod.metadata.resource_version.as_deref().filter(|rv| !rv.is_empty())?;
    Some(PatchOp::Test { path: RESOURCE_VERSION_PATH.to_string(), value: Json::String(rv.to_string()) })
}
