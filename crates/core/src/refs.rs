//! Reference-key annotations.
//!
//! A shared mount pod records every volume binding that uses it as an
//! annotation whose key is derived from its own value (the bind target). The
//! set of such annotations is the pod's reference count.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use sha2::{Digest, Sha256};

pub const REFERENCE_KEY_PREFIX: &str = "juicefs-";

/// Annotation keys, like object names, are capped at 63 bytes.
const MAX_KEY_LEN: usize = 63;

pub trait ReferenceKeyDeriver: Send + Sync {
    fn derive(&self, value: &str) -> String;
}

/// `juicefs-<hex sha256(value)>`, truncated to 63 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ReferenceKey;

impl ReferenceKeyDeriver for Sha256ReferenceKey {
    fn derive(&self, value: &str) -> String {
        let digest = Sha256::digest(value.as_bytes());
        let mut key = format!("{}{}", REFERENCE_KEY_PREFIX, hex::encode(digest));
        key.truncate(MAX_KEY_LEN);
        key
    }
}

pub fn reference_key(value: &str) -> String {
    Sha256ReferenceKey.derive(value)
}

/// Annotations whose key is exactly the derived key of their value.
pub fn reference_annotations<D>(pod: &Pod, deriver: &D) -> BTreeMap<String, String>
where
    D: ReferenceKeyDeriver + ?Sized,
{
    let Some(annotations) = pod.metadata.annotations.as_ref() else { return BTreeMap::new() };
    annotations
        .iter()
        .filter(|(k, v)| deriver.derive(v) == **k)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
