//! Health and failure classification for mount pods.
//!
//! All predicates are side-effect free. Missing status data classifies as
//! "not ready / no error" rather than failing.

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, PodCondition};
use serde::{Deserialize, Serialize};

const COND_CONTAINERS_READY: &str = "ContainersReady";
const COND_READY: &str = "Ready";
const COND_SCHEDULED: &str = "PodScheduled";
const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";
const REASON_CONTAINER_CREATING: &str = "ContainerCreating";
const REASON_UNSCHEDULABLE: &str = "Unschedulable";
const REASON_ADMISSION_ERROR: &str = "UnexpectedAdmissionError";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(PodPhase::Pending),
            "Running" => Some(PodPhase::Running),
            "Succeeded" => Some(PodPhase::Succeeded),
            "Failed" => Some(PodPhase::Failed),
            "Unknown" => Some(PodPhase::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

/// Reported phase; `None` when absent or not a known phase.
pub fn phase(pod: &Pod) -> Option<PodPhase> {
    pod.status.as_ref()?.phase.as_deref().and_then(PodPhase::parse)
}

fn conditions(pod: &Pod) -> &[PodCondition] {
    pod.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or(&[])
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status.as_ref().and_then(|s| s.container_statuses.as_deref()).unwrap_or(&[])
}

pub(crate) fn containers(pod: &Pod) -> &[Container] {
    pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[])
}

/// Both `ContainersReady` and `Ready` report `True`, each exactly once.
pub fn is_ready(pod: &Pod) -> bool {
    let (mut containers_ready, mut ready, mut trues) = (false, false, 0usize);
    for cond in conditions(pod).iter().filter(|c| c.status == STATUS_TRUE) {
        match cond.type_.as_str() {
            COND_CONTAINERS_READY => { containers_ready = true; trues += 1; }
            COND_READY => { ready = true; trues += 1; }
            _ => {}
        }
    }
    trues == 2 && containers_ready && ready
}

fn container_errored(status: &ContainerStatus) -> bool {
    let Some(state) = status.state.as_ref() else { return false };
    if let Some(waiting) = &state.waiting {
        // a waiting state without a reason is not "still creating"
        if waiting.reason.as_deref() != Some(REASON_CONTAINER_CREATING) {
            return true;
        }
    }
    matches!(&state.terminated, Some(t) if t.exit_code != 0)
}

pub fn has_error(pod: &Pod) -> bool {
    if matches!(phase(pod), Some(PodPhase::Failed | PodPhase::Unknown)) {
        return true;
    }
    container_statuses(pod).iter().any(container_errored)
}

/// Admission or scheduling failure caused by exhausted node resources.
///
/// Such pods will not come up by retrying as-is; the caller typically retries
/// with [`without_resource_requirements`] instead.
pub fn is_resource_error(pod: &Pod) -> bool {
    if phase(pod) == Some(PodPhase::Failed) {
        let status = pod.status.as_ref();
        let reason = status.and_then(|s| s.reason.as_deref()).unwrap_or("");
        let message = status.and_then(|s| s.message.as_deref()).unwrap_or("");
        if reason.contains("OutOf") {
            return true;
        }
        if reason == REASON_ADMISSION_ERROR && message.contains("to reclaim resources") {
            return true;
        }
    }
    conditions(pod).iter().any(|c| {
        c.status == STATUS_FALSE
            && c.type_ == COND_SCHEDULED
            && c.reason.as_deref() == Some(REASON_UNSCHEDULABLE)
            && c.message.as_deref().map(|m| m.contains("Insufficient cpu") || m.contains("Insufficient memory")).unwrap_or(false)
    })
}

pub fn has_resource_requirements(pod: &Pod) -> bool {
    containers(pod).iter().any(|c| {
        c.resources.as_ref().and_then(|r| r.requests.as_ref()).map(|r| !r.is_empty()).unwrap_or(false)
    })
}

/// Copy of `pod` with requests and limits cleared on every container.
pub fn without_resource_requirements(pod: &Pod) -> Pod {
    let mut out = pod.clone();
    if let Some(spec) = out.spec.as_mut() {
        for c in spec.containers.iter_mut() {
            if let Some(res) = c.resources.as_mut() {
                res.requests = None;
                res.limits = None;
            }
        }
    }
    out
}

/// Action-oriented summary of a pod's state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PodVerdict {
    Ready,
    /// Neither ready nor failed yet
    Starting,
    /// Cannot be scheduled/admitted with its current resource requests
    ResourceExhausted,
    Failed,
}

impl PodVerdict {
    /// Recreating the pod unchanged may succeed.
    pub fn is_retryable(self) -> bool { matches!(self, PodVerdict::Failed) }

    pub fn as_str(self) -> &'static str {
        match self {
            PodVerdict::Ready => "ready",
            PodVerdict::Starting => "starting",
            PodVerdict::ResourceExhausted => "resource_exhausted",
            PodVerdict::Failed => "failed",
        }
    }
}

pub fn verdict(pod: &Pod) -> PodVerdict {
    if is_resource_error(pod) {
        PodVerdict::ResourceExhausted
    } else if has_error(pod) {
        PodVerdict::Failed
    } else if is_ready(pod) {
        PodVerdict::Ready
    } else {
        PodVerdict::Starting
    }
}

/// All predicates evaluated once, for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodReport {
    pub namespace: Option<String>,
    pub name: String,
    pub phase: Option<PodPhase>,
    pub verdict: PodVerdict,
    pub ready: bool,
    pub error: bool,
    pub resource_error: bool,
    pub has_resources: bool,
}

impl PodReport {
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone(),
            name: crate::pod_name(pod).to_string(),
            phase: phase(pod),
            verdict: verdict(pod),
            ready: is_ready(pod),
            error: has_error(pod),
            resource_error: is_resource_error(pod),
            has_resources: has_resource_requirements(pod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn cond(type_: &str, status: &str) -> PodCondition {
        PodCondition { type_: type_.into(), status: status.into(), ..Default::default() }
    }

    fn with_status(status: PodStatus) -> Pod {
        Pod { status: Some(status), ..Default::default() }
    }

    fn with_conditions(conds: Vec<PodCondition>) -> Pod {
        with_status(PodStatus { conditions: Some(conds), ..Default::default() })
    }

    fn failed(reason: &str, message: &str) -> Pod {
        with_status(PodStatus {
            phase: Some("Failed".into()),
            reason: Some(reason.into()),
            message: Some(message.into()),
            ..Default::default()
        })
    }

    fn waiting(reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: "jfs-mount".into(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting { reason: reason.map(Into::into), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            name: "jfs-mount".into(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated { exit_code, ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn running_with(statuses: Vec<ContainerStatus>) -> Pod {
        with_status(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(statuses),
            ..Default::default()
        })
    }

    fn with_requests(requests: Option<BTreeMap<String, Quantity>>) -> Pod {
        let limits = BTreeMap::from([("memory".to_string(), Quantity("1Gi".into()))]);
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "jfs-mount".into(),
                    resources: Some(ResourceRequirements { requests, limits: Some(limits), ..Default::default() }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_requires_both_signals_in_any_order() {
        let a = with_conditions(vec![cond("Ready", "True"), cond("Initialized", "True"), cond("ContainersReady", "True")]);
        assert!(is_ready(&a));
        let b = with_conditions(vec![cond("ContainersReady", "True"), cond("PodScheduled", "True"), cond("Ready", "True")]);
        assert!(is_ready(&b));
    }

    #[test]
    fn ready_rejects_partial_false_and_duplicate_signals() {
        assert!(!is_ready(&with_conditions(vec![cond("Ready", "True")])));
        assert!(!is_ready(&with_conditions(vec![cond("Ready", "True"), cond("ContainersReady", "False")])));
        assert!(!is_ready(&with_conditions(vec![cond("Ready", "True"), cond("Ready", "True")])));
        assert!(!is_ready(&with_conditions(vec![
            cond("Ready", "True"),
            cond("ContainersReady", "True"),
            cond("Ready", "True"),
        ])));
        assert!(!is_ready(&Pod::default()));
    }

    #[test]
    fn container_creating_is_not_an_error() {
        assert!(!has_error(&running_with(vec![waiting(Some("ContainerCreating"))])));
        assert!(has_error(&running_with(vec![waiting(Some("CrashLoopBackOff"))])));
        assert!(has_error(&running_with(vec![waiting(None)])));
    }

    #[test]
    fn terminated_containers_error_only_on_nonzero_exit() {
        assert!(!has_error(&running_with(vec![terminated(0)])));
        assert!(has_error(&running_with(vec![terminated(0), terminated(137)])));
    }

    #[test]
    fn failed_and_unknown_phases_are_errors() {
        for p in ["Failed", "Unknown"] {
            let pod = with_status(PodStatus { phase: Some(p.into()), ..Default::default() });
            assert!(has_error(&pod), "phase {p}");
        }
        let pending = with_status(PodStatus { phase: Some("Pending".into()), ..Default::default() });
        assert!(!has_error(&pending));
        assert!(!has_error(&Pod::default()));
    }

    #[test]
    fn out_of_resource_failures() {
        assert!(is_resource_error(&failed("OutOfmemory", "")));
        assert!(is_resource_error(&failed("OutOfcpu", "Node didn't have enough resource")));
        assert!(!is_resource_error(&failed("Evicted", "The node was low on resource: memory")));
        assert!(is_resource_error(&failed("UnexpectedAdmissionError", "Allocate failed due to can't allocate, which is unexpected, to reclaim resources")));
        assert!(!is_resource_error(&failed("UnexpectedAdmissionError", "device plugin unavailable")));
    }

    #[test]
    fn out_of_reason_requires_failed_phase() {
        let pod = with_status(PodStatus { phase: Some("Pending".into()), reason: Some("OutOfmemory".into()), ..Default::default() });
        assert!(!is_resource_error(&pod));
    }

    #[test]
    fn unschedulable_for_cpu_or_memory() {
        let mut c = cond("PodScheduled", "False");
        c.reason = Some("Unschedulable".into());
        c.message = Some("0/3 nodes are available: 3 Insufficient memory.".into());
        assert!(is_resource_error(&with_conditions(vec![c.clone()])));

        c.message = Some("0/3 nodes are available: 3 node(s) had taint.".into());
        assert!(!is_resource_error(&with_conditions(vec![c.clone()])));

        c.message = Some("0/1 nodes are available: 1 Insufficient cpu.".into());
        c.status = "True".into();
        assert!(!is_resource_error(&with_conditions(vec![c])));
    }

    #[test]
    fn requests_detection_and_stripping() {
        let req = BTreeMap::from([("cpu".to_string(), Quantity("500m".into()))]);
        let pod = with_requests(Some(req));
        assert!(has_resource_requirements(&pod));
        assert!(!has_resource_requirements(&with_requests(Some(BTreeMap::new()))));
        assert!(!has_resource_requirements(&with_requests(None)));

        let stripped = without_resource_requirements(&pod);
        assert!(!has_resource_requirements(&stripped));
        let res = stripped.spec.as_ref().unwrap().containers[0].resources.as_ref().unwrap();
        assert!(res.requests.is_none() && res.limits.is_none());
        // original untouched
        assert!(has_resource_requirements(&pod));
        assert!(pod.spec.as_ref().unwrap().containers[0].resources.as_ref().unwrap().limits.is_some());
    }

    #[test]
    fn verdict_prefers_resource_exhaustion() {
        assert_eq!(verdict(&failed("OutOfmemory", "")), PodVerdict::ResourceExhausted);
        assert_eq!(verdict(&failed("Error", "")), PodVerdict::Failed);
        assert_eq!(verdict(&with_conditions(vec![cond("Ready", "True"), cond("ContainersReady", "True")])), PodVerdict::Ready);
        assert_eq!(verdict(&Pod::default()), PodVerdict::Starting);
        assert!(PodVerdict::Failed.is_retryable());
        assert!(!PodVerdict::ResourceExhausted.is_retryable());
    }

    #[test]
    fn unrecognised_phase_is_none() {
        let pod = with_status(PodStatus { phase: Some("Rebooting".into()), ..Default::default() });
        assert_eq!(phase(&pod), None);
        assert_eq!(PodPhase::parse("Failed").map(|p| p.as_str()), Some("Failed"));
    }
}
