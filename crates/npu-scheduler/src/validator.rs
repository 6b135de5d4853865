//! Job admission.
//!
//! Checks run in a fixed order and stop at the first failure. Validation
//! never touches node state.

use std::collections::HashSet;

use api_types::annotations;
use api_types::{JobSpec, TaskSpec, ValidationResult};
use tracing::debug;

use crate::family::{FamilyProfile, FamilyRegistry, Parallelism};

/// Stable machine-readable failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ValidationReason {
    #[display("TaskCountMismatch")]
    TaskCountMismatch,
    #[display("IllegalDeviceCount")]
    IllegalDeviceCount,
    #[display("IllegalVirtualRatio")]
    IllegalVirtualRatio,
    #[display("VirtualUnsupported")]
    VirtualUnsupported,
    #[display("SuperPodMismatch")]
    SuperPodMismatch,
    #[display("UnsupportedFamily")]
    UnsupportedFamily,
    #[display("IllegalName")]
    IllegalName,
}

type Check = core::result::Result<(), (ValidationReason, String)>;

/// Admit or reject `job` against the families in `registry`.
pub fn validate_job(job: &JobSpec, registry: &FamilyRegistry) -> ValidationResult {
    let outcome = registry
        .resolve(&job.family)
        .map_err(|_| {
            (
                ValidationReason::UnsupportedFamily,
                format!("family {} is not supported", job.family),
            )
        })
        .and_then(|profile| {
            check_names(job)?;
            check_task_count(job, profile)?;
            check_task_sizes(job, profile)?;
            check_virtual_support(job, profile)?;
            check_super_pod(job, profile)
        });

    match outcome {
        Ok(()) => ValidationResult::passed(),
        Err((reason, message)) => {
            debug!(job = %job.id, %reason, %message, "job rejected");
            ValidationResult::failed(reason.to_string(), message)
        }
    }
}

fn is_virtual(task: &TaskSpec) -> bool {
    task.npu == 0 && task.vnpu_ratio.is_some()
}

/// Job ids and task names end up inside node annotations and must read back
/// unchanged: no separators, no whitespace, and no `/` in task names.
fn check_names(job: &JobSpec) -> Check {
    if !annotations::is_safe_name(&job.id) {
        return Err((
            ValidationReason::IllegalName,
            format!("job id {:?} is empty or contains a reserved character", job.id),
        ));
    }
    match job
        .tasks
        .iter()
        .find(|task| !annotations::is_safe_name(&task.name) || task.name.contains('/'))
    {
        Some(task) => Err((
            ValidationReason::IllegalName,
            format!(
                "task name {:?} is empty or contains a reserved character",
                task.name
            ),
        )),
        None => Ok(()),
    }
}

fn check_task_count(job: &JobSpec, profile: &FamilyProfile) -> Check {
    if job.tasks.is_empty() {
        return Err((
            ValidationReason::TaskCountMismatch,
            "job has no tasks".to_string(),
        ));
    }
    if profile.parallelism == Parallelism::Single && job.tasks.len() > 1 {
        return Err((
            ValidationReason::TaskCountMismatch,
            format!(
                "{} jobs run exactly one task, got {}",
                profile.tag,
                job.tasks.len()
            ),
        ));
    }
    let mut names = HashSet::new();
    if let Some(task) = job.tasks.iter().find(|task| !names.insert(task.name.clone())) {
        return Err((
            ValidationReason::TaskCountMismatch,
            format!("task name {} appears more than once", task.name),
        ));
    }
    Ok(())
}

fn check_task_sizes(job: &JobSpec, profile: &FamilyProfile) -> Check {
    let distributed = job.tasks.len() > 1;
    for task in &job.tasks {
        if is_virtual(task) {
            let ratio = task.vnpu_ratio.unwrap_or_default();
            // families without slicing are rejected by the next check
            if let Some(slicing) = &profile.virtual_slicing {
                if slicing.template_for(ratio).is_none() {
                    return Err((
                        ValidationReason::IllegalVirtualRatio,
                        format!(
                            "task {} ratio {ratio} matches no {} template",
                            task.name, profile.tag
                        ),
                    ));
                }
            }
            continue;
        }

        if task.vnpu_ratio.is_some() || !profile.legal_counts.contains(task.npu) {
            return Err((
                ValidationReason::IllegalDeviceCount,
                format!(
                    "task {} requests {} devices, not a legal {} count",
                    task.name, task.npu, profile.tag
                ),
            ));
        }
        if let (true, Some(required)) = (distributed, profile.distributed_task_npu) {
            if task.npu != required {
                return Err((
                    ValidationReason::IllegalDeviceCount,
                    format!(
                        "distributed {} tasks take {required} devices each, task {} requests {}",
                        profile.tag, task.name, task.npu
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_virtual_support(job: &JobSpec, profile: &FamilyProfile) -> Check {
    match job.tasks.iter().find(|task| is_virtual(task)) {
        Some(task) if profile.virtual_slicing.is_none() => Err((
            ValidationReason::VirtualUnsupported,
            format!(
                "task {} requests a virtual share, {} has no virtual slicing",
                task.name, profile.tag
            ),
        )),
        _ => Ok(()),
    }
}

fn check_super_pod(job: &JobSpec, profile: &FamilyProfile) -> Check {
    let Some(block) = job.sp_block else {
        return Ok(());
    };
    let mismatch = |message: String| Err((ValidationReason::SuperPodMismatch, message));

    if !profile.super_pod {
        return mismatch(format!("{} nodes do not form super-pods", profile.tag));
    }
    let per_task = job.tasks[0].npu;
    if block == 0 || per_task == 0 || block % per_task != 0 {
        return mismatch(format!(
            "super-pod block {block} is not a multiple of the {per_task} devices per task"
        ));
    }
    let total = job.total_npu();
    if total % block != 0 {
        return mismatch(format!(
            "{total} devices cannot be split into super-pod blocks of {block}"
        ));
    }
    let capacity = profile.max_capacity();
    if block > capacity && block % capacity != 0 {
        return mismatch(format!(
            "super-pod block {block} is not a multiple of the {capacity}-device node"
        ));
    }
    Ok(())
}
