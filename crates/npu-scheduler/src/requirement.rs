//! Per-task device requirements derived from a submitted job.

use std::fmt;

use api_types::annotations;
use api_types::{JobSpec, TaskSpec};
use error_stack::Report;

use crate::error::{Result, ScheduleError};
use crate::family::{FamilyProfile, FamilyTag};
use crate::vdevice::Share;

/// `<job>/<task>`. Job ids may themselves contain `/` (namespaced jobs),
/// task names may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    job: String,
    task: String,
}

impl TaskId {
    pub fn new(job: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            task: task.into(),
        }
    }

    /// Parse the annotation form `<job>/<task>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (job, task) = raw.trim().rsplit_once('/')?;
        if job.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(job, task))
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Whether the id reads back unchanged from node annotations.
    pub fn is_persistable(&self) -> bool {
        annotations::is_safe_name(&self.job)
            && annotations::is_safe_name(&self.task)
            && !self.task.contains('/')
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.task)
    }
}

impl From<&api_types::TaskRef> for TaskId {
    fn from(value: &api_types::TaskRef) -> Self {
        Self::new(value.job.clone(), value.task.clone())
    }
}

/// What one task needs from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNpuRequirement {
    pub task: TaskId,
    pub family: FamilyTag,
    /// Whole devices; 0 for virtual-only tasks
    pub npu: usize,
    /// Whole-device tasks are always exclusive
    pub exclusive: bool,
    pub vnpu: Option<Share>,
}

impl TaskNpuRequirement {
    /// Derive the requirement of `task` in `job`.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::ValidationFailed`] if the task asks for nothing,
    ///   for an unrepresentable share, or for more devices than a node holds
    pub fn derive(job: &JobSpec, task: &TaskSpec, profile: &FamilyProfile) -> Result<Self> {
        let id = TaskId::new(job.id.clone(), task.name.clone());
        let fail = |reason: String| {
            Report::new(ScheduleError::ValidationFailed {
                job: job.id.clone(),
                reason,
            })
        };

        if task.npu > profile.max_capacity() {
            return Err(fail(format!(
                "task {} requests {} devices, {} nodes hold at most {}",
                task.name,
                task.npu,
                profile.tag,
                profile.max_capacity()
            )));
        }

        let vnpu = match (task.npu, task.vnpu_ratio) {
            (0, None) => {
                return Err(fail(format!("task {} requests no devices", task.name)));
            }
            (0, Some(ratio)) => Some(Share::from_ratio(ratio).ok_or_else(|| {
                fail(format!(
                    "task {} requests an invalid share {ratio}",
                    task.name
                ))
            })?),
            (_, Some(_)) => {
                return Err(fail(format!(
                    "task {} mixes whole devices with a virtual share",
                    task.name
                )));
            }
            (_, None) => None,
        };

        Ok(Self {
            task: id,
            family: profile.tag,
            npu: task.npu,
            exclusive: vnpu.is_none() || task.exclusive,
            vnpu,
        })
    }
}
