//! Shared API type definitions
//!
//! This crate contains the wire types exchanged between the NPU scheduling
//! engine, the host scheduling framework and the node-object store: job and
//! task descriptors, extender request/response bodies, the rescheduler fault
//! snapshot, and the node annotation format.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

pub mod annotations;

/// One task of a job as submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Task name, unique within its job
    pub name: String,
    /// Whole devices requested; 0 means the task only wants a virtual share
    #[serde(default)]
    pub npu: usize,
    /// Fraction of one device requested in virtual mode, e.g. 0.25
    #[serde(default)]
    pub vnpu_ratio: Option<f64>,
    /// Virtual tasks only: demand a device no other task shares
    #[serde(default)]
    pub exclusive: bool,
}

/// A job submitted for topology-aware placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Job identifier, e.g. `default/llama-pretrain`
    pub id: String,
    /// Accelerator family tag, e.g. `ascend910b`
    pub family: String,
    /// Tasks of the job
    pub tasks: Vec<TaskSpec>,
    /// Devices per super-pod block, for jobs that pin to super-pods
    #[serde(default)]
    pub sp_block: Option<usize>,
}

impl JobSpec {
    /// Total whole devices requested across all tasks.
    pub fn total_npu(&self) -> usize {
        self.tasks.iter().map(|task| task.npu).sum()
    }
}

/// Outcome of job admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub pass: bool,
    /// Stable machine-readable reason, empty when passing
    pub reason: String,
    /// Human readable explanation
    pub message: String,
}

impl ValidationResult {
    pub fn passed() -> Self {
        Self {
            pass: true,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Identifies one task of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub job: String,
    pub task: String,
}

/// Body of the filter and score extender calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderArgs {
    pub task: TaskRef,
    /// Candidate node names
    pub nodes: Vec<String>,
}

/// Result of the filter extender call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterResult {
    /// Nodes that can host the task
    pub nodes: Vec<String>,
    /// Rejected nodes with the reason each was rejected
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Raw score of one node. Lower means more preferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPriority {
    pub host: String,
    pub score: f64,
}

/// Body of the bind and unbind extender calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindArgs {
    pub task: TaskRef,
    pub node: String,
}

/// Result of the bind and unbind extender calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindResult {
    pub node: String,
    /// Device indices held by the task after the call
    pub devices: Vec<usize>,
    /// Annotations to write back onto the node object
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Fault and network snapshot published by the rescheduler once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReschedulerState {
    /// Nodes whose network is degraded; still usable, but penalized
    pub degraded_nodes: Vec<String>,
    /// Nodes tasks must be moved off
    pub evicted_nodes: Vec<String>,
    /// Faulted device indices per node
    pub faulted_devices: BTreeMap<String, Vec<usize>>,
    /// Jobs under active fault-driven rescheduling
    pub rescheduling_jobs: Vec<String>,
}

/// Jobs requeued by the pre-schedule hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreScheduleResult {
    pub rescheduled: Vec<String>,
}

/// Node annotations pushed into the scheduler's cycle snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// Identifies a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job: String,
}

/// A task whose devices must be vacated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eviction {
    pub task: TaskRef,
    pub node: String,
    pub devices: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_spec_deserializes_with_defaults() {
        let job: JobSpec = serde_json::from_str(
            r#"{"id":"default/train","family":"ascend910","tasks":[{"name":"worker-0","npu":8}]}"#,
        )
        .unwrap();

        assert_eq!(job.sp_block, None);
        assert_eq!(job.tasks[0].vnpu_ratio, None);
        assert!(!job.tasks[0].exclusive);
        assert_eq!(job.total_npu(), 8);
    }

    #[test]
    fn rescheduler_state_accepts_partial_payload() {
        let state: ReschedulerState =
            serde_json::from_str(r#"{"degradedNodes":["node-1"]}"#).unwrap();

        assert_eq!(state.degraded_nodes, vec!["node-1".to_string()]);
        assert!(state.evicted_nodes.is_empty());
        assert!(state.faulted_devices.is_empty());
    }

    #[test]
    fn validation_result_constructors() {
        assert!(ValidationResult::passed().pass);

        let failed = ValidationResult::failed("IllegalDeviceCount", "3 devices");
        assert!(!failed.pass);
        assert_eq!(failed.reason, "IllegalDeviceCount");
    }
}
