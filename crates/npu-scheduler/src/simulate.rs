//! One offline scheduling cycle over a snapshot file.
//!
//! The snapshot holds what the host framework would otherwise push over
//! HTTP: node annotations, submitted jobs and the rescheduler's fault state.
//! Every job is validated, then each of its tasks is filtered, scored and
//! bound to the lowest scoring node, in file order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use api_types::{JobSpec, NodeUpdate, ReschedulerState, TaskRef, ValidationResult};
use error_stack::ResultExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::SchedulerContext;
use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub nodes: Vec<NodeUpdate>,
    pub jobs: Vec<JobSpec>,
    pub rescheduler: ReschedulerState,
}

impl Snapshot {
    /// # Errors
    ///
    /// - [`ScheduleError::Config`] if the YAML does not parse
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).change_context(ScheduleError::Config {
            message: "invalid snapshot".to_string(),
        })
    }

    /// # Errors
    ///
    /// - [`ScheduleError::Config`] if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).change_context_lazy(|| ScheduleError::Config {
            message: format!("cannot read {}", path.display()),
        })?;
        Self::from_yaml_str(&raw).attach_printable_lazy(|| format!("file: {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub task: String,
    pub node: String,
    pub devices: Vec<usize>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job: String,
    pub phase: String,
    pub validation: ValidationResult,
    pub bindings: Vec<Binding>,
    /// Tasks left unplaced, with why
    pub unscheduled: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub rescheduled: Vec<String>,
    /// Nodes left out of the cycle because their annotations are unusable
    pub skipped_nodes: BTreeMap<String, String>,
    pub jobs: Vec<JobOutcome>,
    /// Annotations to write back, per node
    pub nodes: BTreeMap<String, BTreeMap<String, String>>,
}

/// Load `snapshot` into `context` and run one cycle over it.
pub fn run_cycle(context: &SchedulerContext, snapshot: Snapshot) -> CycleReport {
    let mut report = CycleReport::default();

    for node in &snapshot.nodes {
        if let Err(err) = context.upsert_node(&node.name, &node.annotations) {
            warn!(node = %node.name, error = %err.current_context(), "node skipped");
            report
                .skipped_nodes
                .insert(node.name.clone(), err.current_context().to_string());
        }
    }
    report.rescheduled = context.pre_schedule_hook(snapshot.rescheduler);

    let candidates = context.node_names();
    for job in &snapshot.jobs {
        report.jobs.push(schedule_job(context, job, &candidates));
    }

    for name in &candidates {
        if let Ok(annotations) = context.node_annotations(name) {
            report.nodes.insert(name.clone(), annotations);
        }
    }
    info!(
        jobs = report.jobs.len(),
        nodes = candidates.len(),
        "simulated cycle finished"
    );
    report
}

fn schedule_job(context: &SchedulerContext, job: &JobSpec, candidates: &[String]) -> JobOutcome {
    let validation = context.validate_job(job);
    let mut outcome = JobOutcome {
        job: job.id.clone(),
        phase: String::new(),
        validation,
        bindings: Vec::new(),
        unscheduled: BTreeMap::new(),
    };

    if outcome.validation.pass {
        for spec in &job.tasks {
            let task = TaskRef {
                job: job.id.clone(),
                task: spec.name.clone(),
            };
            match place_task(context, &task, candidates) {
                Ok(binding) => outcome.bindings.push(binding),
                Err(reason) => {
                    debug!(job = %job.id, task = %spec.name, %reason, "task left unscheduled");
                    outcome.unscheduled.insert(spec.name.clone(), reason);
                }
            }
        }
    }

    outcome.phase = context
        .job_phase(&job.id)
        .map(|phase| phase.to_string())
        .unwrap_or_default();
    outcome
}

/// Filter, score and bind one task. Ties go to the first node by name.
fn place_task(
    context: &SchedulerContext,
    task: &TaskRef,
    candidates: &[String],
) -> core::result::Result<Binding, String> {
    let filtered = context.filter(task, candidates);
    if let Some(error) = filtered.error {
        return Err(error);
    }
    if filtered.nodes.is_empty() {
        let reasons: Vec<String> = filtered
            .failed_nodes
            .iter()
            .map(|(node, reason)| format!("{node}: {reason}"))
            .collect();
        return Err(format!("no feasible node ({})", reasons.join("; ")));
    }

    let mut scores = HashMap::new();
    context
        .score_nodes(task, &filtered.nodes, &mut scores)
        .map_err(|err| err.current_context().to_string())?;

    let mut best: Option<(&String, f64)> = None;
    for node in &filtered.nodes {
        let Some(&score) = scores.get(node) else {
            continue;
        };
        if best.map_or(true, |(_, lowest)| score < lowest) {
            best = Some((node, score));
        }
    }
    let (node, score) = best.ok_or_else(|| "no node could be scored".to_string())?;

    let bound = context
        .bind(task, node)
        .map_err(|err| err.current_context().to_string())?;
    Ok(Binding {
        task: task.task.clone(),
        node: bound.node,
        devices: bound.devices,
        score,
    })
}
