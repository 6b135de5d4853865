//! The scheduling engine.
//!
//! [`SchedulerContext`] is built once and shared by every extender call.
//! Each node sits behind its own mutex: binds, unbinds and leases on a node
//! serialize on it, scoring only holds it long enough to copy a view.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;

use api_types::{BindResult, FilterResult, JobSpec, ReschedulerState, TaskRef, ValidationResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use tracing::{debug, info, warn};

use crate::affinity::WORST_SCORE;
use crate::allocator::{self, AllocationRecord, LeaseKind};
use crate::config::SchedulerConfig;
use crate::error::{Result, ScheduleError};
use crate::family::{FamilyProfile, FamilyRegistry};
use crate::jobs::{JobEvent, JobPhase, JobRecord};
use crate::lifecycle::Lifecycle;
use crate::policy::{Candidate, PolicySet};
use crate::requirement::{TaskId, TaskNpuRequirement};
use crate::reschedule::FaultSnapshot;
use crate::topology::NodeState;
use crate::validator;
use crate::vdevice::{Share, VirtualLease};

type NodeHandle = Arc<Mutex<NodeState>>;

/// A task resolved against its job and family.
struct TaskPlan<'a> {
    requirement: TaskNpuRequirement,
    profile: &'a FamilyProfile,
    sp_block: Option<usize>,
    job_super_pod: Option<String>,
}

fn lock(node: &Mutex<NodeState>) -> MutexGuard<'_, NodeState> {
    node.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct SchedulerContext {
    registry: FamilyRegistry,
    policies: PolicySet,
    nodes: DashMap<String, NodeHandle>,
    task_nodes: DashMap<TaskId, String>,
    jobs: DashMap<String, JobRecord>,
    snapshot: RwLock<Arc<FaultSnapshot>>,
    lifecycle: Lifecycle,
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new(FamilyRegistry::builtin(), PolicySet::default())
    }
}

impl SchedulerContext {
    pub fn new(registry: FamilyRegistry, policies: PolicySet) -> Self {
        Self {
            registry,
            policies,
            nodes: DashMap::new(),
            task_nodes: DashMap::new(),
            jobs: DashMap::new(),
            snapshot: RwLock::new(Arc::new(FaultSnapshot::default())),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            FamilyRegistry::with_families(&config.enabled_families),
            PolicySet::standard(config.degraded_penalty, config.super_pod_penalty),
        )
    }

    pub fn registry(&self) -> &FamilyRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Load or refresh a node from its annotations.
    ///
    /// Records already held for the node are carried over; those that no
    /// longer fit the refreshed topology are dropped. A node whose
    /// annotations are malformed is removed from the cycle.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::MalformedTopology`] or
    ///   [`ScheduleError::UnsupportedFamily`] from [`NodeState::from_annotations`]
    pub fn upsert_node(&self, name: &str, annotations: &BTreeMap<String, String>) -> Result<()> {
        let mut fresh = match NodeState::from_annotations(name, annotations, &self.registry) {
            Ok(state) => state,
            Err(err) => {
                if self.nodes.remove(name).is_some() {
                    warn!(node = name, error = %err.current_context(), "node dropped from cycle");
                }
                return Err(err);
            }
        };

        let (dropped, tasks) = match self.nodes.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let mut state = lock(entry.get());
                let dropped = fresh.adopt(state.clone());
                *state = fresh;
                let tasks: Vec<TaskId> = state.records().map(|r| r.task.clone()).collect();
                (dropped, tasks)
            }
            Entry::Vacant(entry) => {
                let tasks: Vec<TaskId> = fresh.records().map(|r| r.task.clone()).collect();
                entry.insert(Arc::new(Mutex::new(fresh)));
                (Vec::new(), tasks)
            }
        };

        for task in tasks {
            self.task_nodes.insert(task, name.to_string());
        }
        for record in &dropped {
            warn!(node = name, task = %record.task, "binding lost on node refresh");
            self.task_nodes.remove_if(&record.task, |_, bound| bound == name);
            self.forget_binding(&record.task);
        }
        debug!(node = name, "node loaded");
        Ok(())
    }

    /// Annotations to write back onto `name`.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::UnknownNode`] if the node was never loaded
    pub fn node_annotations(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let node = self.node(name)?;
        let state = lock(&node);
        Ok(state.annotation_patch())
    }

    /// Copy of a node's current state.
    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        let node = self.nodes.get(name).map(|entry| Arc::clone(entry.value()))?;
        let state = lock(&node);
        Some(state.clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Node a task is bound to.
    pub fn bound_node(&self, task: &TaskId) -> Option<String> {
        self.task_nodes.get(task).map(|node| node.value().clone())
    }

    fn node(&self, name: &str) -> Result<NodeHandle> {
        self.nodes
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Report::new(ScheduleError::UnknownNode {
                    node: name.to_string(),
                })
            })
    }

    fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Admit a job. A passing job moves from pending to validated; a failing
    /// one stays pending.
    pub fn validate_job(&self, spec: &JobSpec) -> ValidationResult {
        let result = validator::validate_job(spec, &self.registry);

        let mut job = self
            .jobs
            .entry(spec.id.clone())
            .or_insert_with(|| JobRecord::new(spec.clone()));
        if job.phase() == JobPhase::Released {
            *job = JobRecord::new(spec.clone());
        }
        if job.phase() == JobPhase::Pending {
            job.spec = spec.clone();
            if result.pass {
                if let Ok(phase) = job.apply(JobEvent::Validate) {
                    info!(job = %spec.id, %phase, "job admitted");
                }
            }
        }
        result
    }

    pub fn job_phase(&self, job: &str) -> Option<JobPhase> {
        self.jobs.get(job).map(|record| record.phase())
    }

    /// `bound -> running`, once the job's tasks have started.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::UnknownJob`] if the job was never submitted
    /// - [`ScheduleError::InvalidTransition`] if the job is not bound
    pub fn mark_running(&self, job: &str) -> Result<()> {
        let mut record = self.jobs.get_mut(job).ok_or_else(|| {
            Report::new(ScheduleError::UnknownJob {
                job: job.to_string(),
            })
        })?;
        let phase = record.apply(JobEvent::Start).inspect_err(|err| {
            warn!(job, error = %err.current_context(), "start rejected");
        })?;
        info!(job, %phase, "job phase changed");
        Ok(())
    }

    /// Release every record of `job` on every node and mark it released.
    pub fn delete_job(&self, job: &str) -> Vec<AllocationRecord> {
        let released = self.release_job_records(job);
        if let Some(mut record) = self.jobs.get_mut(job) {
            record.bound.clear();
            record.super_pod = None;
            match record.apply(JobEvent::Delete) {
                Ok(phase) => info!(job, %phase, released = released.len(), "job deleted"),
                Err(_) => debug!(job, "job already released"),
            }
        }
        released
    }

    fn release_job_records(&self, job: &str) -> Vec<AllocationRecord> {
        let mut released = Vec::new();
        for handle in self.handles() {
            let mut state = lock(&handle);
            let tasks: Vec<TaskId> = state
                .records()
                .filter(|record| record.job() == job)
                .map(|record| record.task.clone())
                .collect();
            for task in tasks {
                released.extend(allocator::release(&mut state, &task));
            }
        }
        for record in &released {
            self.task_nodes.remove(&record.task);
        }
        released
    }

    /// Drop `task` from its job's bound set and move the job on.
    fn forget_binding(&self, task: &TaskId) {
        let Some(mut job) = self.jobs.get_mut(task.job()) else {
            return;
        };
        if !job.bound.remove(task.task()) {
            return;
        }
        let event = match job.phase() {
            JobPhase::Bound => JobEvent::Requeue,
            JobPhase::Running if job.bound.is_empty() => JobEvent::Drain,
            _ => return,
        };
        if job.bound.is_empty() {
            job.super_pod = None;
        }
        match job.apply(event) {
            Ok(phase) => info!(job = %task.job(), %phase, "job phase changed"),
            Err(err) => warn!(
                job = %task.job(),
                error = %err.current_context(),
                "transition rejected"
            ),
        }
    }

    fn task_plan(&self, task: &TaskId) -> Result<TaskPlan<'_>> {
        let job = self.jobs.get(task.job()).ok_or_else(|| {
            Report::new(ScheduleError::UnknownJob {
                job: task.job().to_string(),
            })
        })?;
        let fail = |reason: String| {
            Report::new(ScheduleError::ValidationFailed {
                job: task.job().to_string(),
                reason,
            })
        };
        match job.phase() {
            JobPhase::Pending => return Err(fail("job has not passed validation".to_string())),
            JobPhase::Released => return Err(fail("job is released".to_string())),
            _ => {}
        }

        let profile = self.registry.resolve(&job.spec.family)?;
        let spec = job
            .spec
            .tasks
            .iter()
            .find(|spec| spec.name == task.task())
            .ok_or_else(|| fail(format!("job has no task {}", task.task())))?;
        Ok(TaskPlan {
            requirement: TaskNpuRequirement::derive(&job.spec, spec, profile)?,
            profile,
            sp_block: job.spec.sp_block,
            job_super_pod: job.super_pod.clone(),
        })
    }

    fn touch_scoring(&self, job: &str) {
        if let Some(mut record) = self.jobs.get_mut(job) {
            if record.phase() == JobPhase::Validated {
                if let Ok(phase) = record.apply(JobEvent::Score) {
                    debug!(job, %phase, "job phase changed");
                }
            }
        }
    }

    fn evaluate_on(
        &self,
        plan: &TaskPlan<'_>,
        name: &str,
        snapshot: &FaultSnapshot,
    ) -> Result<u32> {
        let node = self.node(name)?;
        let task = &plan.requirement.task;
        let view = {
            let state = lock(&node);
            if state.record(task).is_some() {
                return Ok(0);
            }
            let family = state.topology().family();
            if family != plan.profile.tag {
                return Err(Report::new(ScheduleError::infeasible(
                    name,
                    task.to_string(),
                    format!("node carries {family} devices, task needs {}", plan.profile.tag),
                )));
            }
            state.view(&self.policies.masked(name, snapshot))
        };

        self.policies
            .evaluate(&Candidate {
                requirement: &plan.requirement,
                profile: plan.profile,
                view: &view,
                snapshot,
                sp_block: plan.sp_block,
                job_super_pod: plan.job_super_pod.as_deref(),
            })
            .map_err(|reason| {
                Report::new(ScheduleError::infeasible(name, task.to_string(), reason))
            })
    }

    /// Whether `task` can go on `node`, and its score there.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::InfeasibleNode`] if a policy rejects the node
    /// - [`ScheduleError::UnknownNode`], [`ScheduleError::UnknownJob`] or
    ///   [`ScheduleError::ValidationFailed`] if the call cannot be resolved
    pub fn check_node_feasible(&self, task: &TaskRef, node: &str) -> Result<u32> {
        let id = TaskId::from(task);
        let plan = self.task_plan(&id)?;
        self.touch_scoring(id.job());
        self.evaluate_on(&plan, node, &self.snapshot())
    }

    /// Split `nodes` into those that can host `task` and those that cannot.
    pub fn filter(&self, task: &TaskRef, nodes: &[String]) -> FilterResult {
        let id = TaskId::from(task);
        let plan = match self.task_plan(&id) {
            Ok(plan) => plan,
            Err(err) => {
                return FilterResult {
                    error: Some(err.current_context().to_string()),
                    ..FilterResult::default()
                };
            }
        };
        self.touch_scoring(id.job());

        let snapshot = self.snapshot();
        let mut result = FilterResult::default();
        for node in nodes {
            match self.evaluate_on(&plan, node, &snapshot) {
                Ok(_) => result.nodes.push(node.clone()),
                Err(err) => {
                    result
                        .failed_nodes
                        .insert(node.clone(), err.current_context().to_string());
                }
            }
        }
        debug!(
            task = %id,
            feasible = result.nodes.len(),
            rejected = result.failed_nodes.len(),
            "filtered"
        );
        result
    }

    /// Add `task`'s raw score on each of `nodes` into `scores`.
    ///
    /// Infeasible nodes get [`WORST_SCORE`]; nodes that cannot be evaluated
    /// at all are skipped.
    ///
    /// # Errors
    ///
    /// Only task-level failures: [`ScheduleError::UnknownJob`],
    /// [`ScheduleError::ValidationFailed`] or
    /// [`ScheduleError::UnsupportedFamily`].
    pub fn score_nodes(
        &self,
        task: &TaskRef,
        nodes: &[String],
        scores: &mut HashMap<String, f64>,
    ) -> Result<()> {
        let id = TaskId::from(task);
        let plan = self.task_plan(&id)?;
        self.touch_scoring(id.job());

        let snapshot = self.snapshot();
        for node in nodes {
            let score = match self.evaluate_on(&plan, node, &snapshot) {
                Ok(score) => score,
                Err(err)
                    if matches!(err.current_context(), ScheduleError::InfeasibleNode { .. }) =>
                {
                    WORST_SCORE
                }
                Err(err) => {
                    warn!(node = %node, task = %id, error = %err.current_context(), "node skipped");
                    continue;
                }
            };
            *scores.entry(node.clone()).or_insert(0.0) += f64::from(score);
        }
        Ok(())
    }

    /// Commit `task` onto `node`.
    ///
    /// The placement is planned again under the node lock. Binding a task
    /// again on the node it already holds returns the existing devices.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::InsufficientTopology`] if the node can no longer
    ///   host the task, or the task is bound elsewhere
    /// - [`ScheduleError::UnknownNode`], [`ScheduleError::UnknownJob`] or
    ///   [`ScheduleError::ValidationFailed`] if the call cannot be resolved
    pub fn bind(&self, task: &TaskRef, node: &str) -> Result<BindResult> {
        let id = TaskId::from(task);
        let plan = self.task_plan(&id)?;
        self.touch_scoring(id.job());

        let (record, annotations, super_pod) = self
            .bind_on(&plan, node)
            .inspect_err(|err| {
                warn!(node, task = %id, error = %err.current_context(), "bind failed");
            })?;

        if let Some(mut job) = self.jobs.get_mut(id.job()) {
            job.bound.insert(id.task().to_string());
            if job.spec.sp_block.is_some() && job.super_pod.is_none() {
                job.super_pod = super_pod;
            }
            if job.phase() == JobPhase::Scoring && job.all_bound() {
                if let Ok(phase) = job.apply(JobEvent::AllBound) {
                    info!(job = %id.job(), %phase, "job phase changed");
                }
            }
        }

        Ok(BindResult {
            node: node.to_string(),
            devices: record.devices,
            annotations,
            error: None,
        })
    }

    fn bind_on(
        &self,
        plan: &TaskPlan<'_>,
        node: &str,
    ) -> Result<(AllocationRecord, BTreeMap<String, String>, Option<String>)> {
        let task = &plan.requirement.task;
        let handle = self.node(node)?;
        let insufficient = || {
            Report::new(ScheduleError::InsufficientTopology {
                node: node.to_string(),
                task: task.to_string(),
            })
        };

        let binding = self.task_nodes.entry(task.clone());
        if let Entry::Occupied(held) = &binding {
            if held.get() != node {
                return Err(
                    insufficient().attach_printable(format!("task is bound to {}", held.get()))
                );
            }
        }

        let snapshot = self.snapshot();
        let mut state = lock(&handle);
        if state.topology().family() != plan.profile.tag {
            return Err(insufficient().attach_printable(format!(
                "node carries {} devices",
                state.topology().family()
            )));
        }
        let masked = self.policies.masked(node, &snapshot);
        if state.record(task).is_none() {
            let view = state.view(&masked);
            self.policies
                .evaluate(&Candidate {
                    requirement: &plan.requirement,
                    profile: plan.profile,
                    view: &view,
                    snapshot: &snapshot,
                    sp_block: plan.sp_block,
                    job_super_pod: plan.job_super_pod.as_deref(),
                })
                .map_err(|reason| insufficient().attach_printable(reason))?;
        }
        let record = allocator::allocate(&mut state, &plan.requirement, plan.profile, &masked)?;
        let annotations = state.annotation_patch();
        let super_pod = state.topology().super_pod().map(str::to_string);
        drop(state);

        if let Entry::Vacant(slot) = binding {
            slot.insert(node.to_string());
        }
        Ok((record, annotations, super_pod))
    }

    /// Release `task` from `node`. Unknown tasks and nodes are a no-op.
    pub fn unbind(&self, task: &TaskRef, node: &str) -> BindResult {
        let id = TaskId::from(task);
        let mut result = BindResult {
            node: node.to_string(),
            ..BindResult::default()
        };

        match self.nodes.get(node).map(|entry| Arc::clone(entry.value())) {
            Some(handle) => {
                let mut state = lock(&handle);
                allocator::release(&mut state, &id);
                result.annotations = state.annotation_patch();
            }
            None => debug!(node, task = %id, "unbind on unknown node"),
        }

        self.task_nodes.remove_if(&id, |_, bound| bound == node);
        self.forget_binding(&id);
        result
    }

    /// Lease `share` of `slot` on `node` to `task` directly.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::OverCommitted`] if the slot lacks room
    /// - [`ScheduleError::InsufficientTopology`] if the slot is whole-assigned
    ///   or unhealthy, or the task already holds other devices
    /// - [`ScheduleError::UnknownNode`] if the node was never loaded
    /// - [`ScheduleError::ValidationFailed`] if the task id cannot be written
    ///   to the node annotations
    pub fn lease_virtual(
        &self,
        node: &str,
        slot: usize,
        share: Share,
        task: &TaskId,
    ) -> Result<VirtualLease> {
        if !task.is_persistable() {
            return Err(Report::new(ScheduleError::ValidationFailed {
                job: task.job().to_string(),
                reason: format!("task id {task} cannot be stored in annotations"),
            }));
        }
        let handle = self.node(node)?;
        {
            let mut state = lock(&handle);
            if let Some(existing) = state.record(task) {
                return match existing.kind {
                    LeaseKind::Virtual { share, .. } if existing.devices == [slot] => {
                        Ok(VirtualLease {
                            node: node.to_string(),
                            slot,
                            task: task.clone(),
                            share,
                        })
                    }
                    _ => Err(Report::new(ScheduleError::InsufficientTopology {
                        node: node.to_string(),
                        task: task.to_string(),
                    })
                    .attach_printable("task already holds other devices")),
                };
            }
            state.commit(AllocationRecord {
                task: task.clone(),
                node: node.to_string(),
                devices: vec![slot],
                kind: LeaseKind::Virtual {
                    share,
                    exclusive: false,
                },
            })?;
        }
        self.task_nodes.insert(task.clone(), node.to_string());
        Ok(VirtualLease {
            node: node.to_string(),
            slot,
            task: task.clone(),
            share,
        })
    }

    /// Drop `task`'s lease on `slot`. Returns the released share, `None` if
    /// there was nothing to release.
    pub fn release_virtual(&self, node: &str, slot: usize, task: &TaskId) -> Option<Share> {
        let handle = self.nodes.get(node).map(|entry| Arc::clone(entry.value()))?;
        let released = {
            let mut state = lock(&handle);
            match state.record(task) {
                Some(record) if record.devices == [slot] => match record.kind {
                    LeaseKind::Virtual { share, .. } => {
                        state.remove(task);
                        Some(share)
                    }
                    LeaseKind::Whole => None,
                },
                _ => None,
            }
        };
        if released.is_some() {
            self.task_nodes.remove_if(task, |_, bound| bound == node);
            self.forget_binding(task);
        }
        released
    }

    /// The fault snapshot of the current cycle.
    pub fn snapshot(&self) -> Arc<FaultSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start a cycle: swap in the rescheduler's snapshot and requeue bound
    /// jobs it lists. Returns the jobs that were requeued.
    pub fn pre_schedule_hook(&self, state: ReschedulerState) -> Vec<String> {
        let snapshot = Arc::new(FaultSnapshot::from(state));
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);

        let mut rescheduled = Vec::new();
        for job in snapshot.rescheduling_jobs() {
            match self.job_phase(job) {
                Some(JobPhase::Bound) => match self.reschedule_job(job) {
                    Ok(_) => rescheduled.push(job.to_string()),
                    Err(err) => warn!(job, error = %err.current_context(), "reschedule failed"),
                },
                Some(JobPhase::Running) => {
                    warn!(job, "job is running, it must be deleted before it can be rescheduled");
                }
                phase => debug!(job, ?phase, "nothing to reschedule"),
            }
        }
        rescheduled.sort();
        info!(rescheduled = rescheduled.len(), "fault snapshot ingested");
        rescheduled
    }

    /// Records sitting on evicted nodes or touching faulted devices.
    pub fn tasks_to_evict(&self) -> Vec<AllocationRecord> {
        let snapshot = self.snapshot();
        let mut evict: Vec<AllocationRecord> = self
            .handles()
            .iter()
            .flat_map(|handle| {
                let state = lock(handle);
                let records: Vec<AllocationRecord> = state
                    .records()
                    .filter(|record| snapshot.must_evict(record))
                    .cloned()
                    .collect();
                records
            })
            .collect();
        evict.sort_by(|a, b| a.task.cmp(&b.task));
        evict
    }

    /// Release a bound job's records and send it back to pending.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::UnknownJob`] if the job was never submitted
    /// - [`ScheduleError::InvalidTransition`] if the job is not bound
    pub fn reschedule_job(&self, job: &str) -> Result<Vec<AllocationRecord>> {
        {
            let mut record = self.jobs.get_mut(job).ok_or_else(|| {
                Report::new(ScheduleError::UnknownJob {
                    job: job.to_string(),
                })
            })?;
            record.apply(JobEvent::Requeue)?;
            record.bound.clear();
            record.super_pod = None;
        }
        let released = self.release_job_records(job);
        info!(job, released = released.len(), "job rescheduled");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use api_types::annotations;
    use api_types::TaskSpec;
    use test_log::test;

    use super::*;

    fn node(family: &str, free: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (annotations::FAMILY.to_string(), family.to_string()),
            (annotations::FREE.to_string(), free.to_string()),
        ])
    }

    fn job(id: &str, family: &str, tasks: &[(&str, usize)]) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            family: family.to_string(),
            tasks: tasks
                .iter()
                .map(|(name, npu)| TaskSpec {
                    name: name.to_string(),
                    npu: *npu,
                    vnpu_ratio: None,
                    exclusive: false,
                })
                .collect(),
            sp_block: None,
        }
    }

    fn task(job: &str, task: &str) -> TaskRef {
        TaskRef {
            job: job.to_string(),
            task: task.to_string(),
        }
    }

    fn context_with(nodes: &[(&str, &str, &str)]) -> SchedulerContext {
        let ctx = SchedulerContext::default();
        for (name, family, free) in nodes {
            ctx.upsert_node(name, &node(family, free)).unwrap();
        }
        ctx
    }

    #[test]
    fn validated_job_binds_and_runs() {
        let ctx = context_with(&[("n1", "ascend910", "0,1,2,3,4,5,6,7")]);
        let spec = job("j", "ascend910", &[("w0", 4)]);

        assert!(ctx.validate_job(&spec).pass);
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Validated));

        let bound = ctx.bind(&task("j", "w0"), "n1").unwrap();
        assert_eq!(bound.devices, vec![0, 1, 2, 3]);
        assert_eq!(bound.annotations[annotations::ASSIGNED], "j/w0=0,1,2,3");
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Bound));

        ctx.mark_running("j").unwrap();
        ctx.unbind(&task("j", "w0"), "n1");
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Released));
        assert_eq!(ctx.node_state("n1").unwrap().topology().free_slots().len(), 8);
    }

    #[test]
    fn unvalidated_jobs_cannot_be_scored() {
        let ctx = context_with(&[("n1", "ascend910", "0,1,2,3")]);
        let err = ctx.check_node_feasible(&task("j", "w0"), "n1").unwrap_err();
        assert!(matches!(err.current_context(), ScheduleError::UnknownJob { .. }));

        ctx.validate_job(&job("j", "ascend910", &[("w0", 3)]));
        let err = ctx.check_node_feasible(&task("j", "w0"), "n1").unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::ValidationFailed { .. }
        ));
    }

    #[test]
    fn bind_elsewhere_is_rejected() {
        let ctx = context_with(&[
            ("n1", "ascend910", "0,1,2,3,4,5,6,7"),
            ("n2", "ascend910", "0,1,2,3,4,5,6,7"),
        ]);
        ctx.validate_job(&job("j", "ascend910", &[("w0", 1)]));
        let first = ctx.bind(&task("j", "w0"), "n1").unwrap();
        let again = ctx.bind(&task("j", "w0"), "n1").unwrap();
        assert_eq!(first.devices, again.devices);

        let err = ctx.bind(&task("j", "w0"), "n2").unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::InsufficientTopology { .. }
        ));
    }

    #[test]
    fn failed_bind_leaves_job_scoring() {
        let ctx = context_with(&[("n1", "ascend910", "0,4")]);
        ctx.validate_job(&job("j", "ascend910", &[("w0", 2)]));

        assert!(ctx.bind(&task("j", "w0"), "n1").is_err());
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Scoring));
    }

    #[test]
    fn score_nodes_adds_sentinel_for_infeasible_and_skips_unknown() {
        let ctx = context_with(&[
            ("fits", "ascend910", "0,1,2,3,4,5,6,7"),
            ("full", "ascend910", "0"),
            ("other", "ascend910b", "0,1,2,3,4,5,6,7"),
        ]);
        ctx.validate_job(&job("j", "ascend910", &[("w0", 4)]));
        let nodes: Vec<String> = ["fits", "full", "other", "ghost"]
            .iter()
            .map(|n| n.to_string())
            .collect();
        let mut scores = HashMap::from([("fits".to_string(), 1.0)]);

        ctx.score_nodes(&task("j", "w0"), &nodes, &mut scores).unwrap();

        assert_eq!(scores["fits"], 1.0);
        assert_eq!(scores["full"], f64::from(WORST_SCORE));
        assert_eq!(scores["other"], f64::from(WORST_SCORE));
        assert!(!scores.contains_key("ghost"));
    }

    #[test]
    fn malformed_refresh_drops_the_node() {
        let ctx = context_with(&[("n1", "ascend910", "0,1")]);
        let err = ctx.upsert_node("n1", &node("ascend910", "0,0")).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::MalformedTopology { .. }
        ));
        assert!(ctx.node_names().is_empty());
    }

    #[test]
    fn refresh_keeps_bindings() {
        let ctx = context_with(&[("n1", "ascend910b", "0,1,2,3,4,5,6,7")]);
        ctx.validate_job(&job("j", "ascend910b", &[("w0", 2)]));
        ctx.bind(&task("j", "w0"), "n1").unwrap();

        // the store has not seen the write-back yet
        ctx.upsert_node("n1", &node("ascend910b", "0,1,2,3,4,5,6,7"))
            .unwrap();

        let state = ctx.node_state("n1").unwrap();
        assert_eq!(state.topology().free_slots(), vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(ctx.bound_node(&TaskId::new("j", "w0")).as_deref(), Some("n1"));
    }

    #[test]
    fn delete_job_releases_everything() {
        let ctx = context_with(&[
            ("n1", "ascend910", "0,1,2,3,4,5,6,7"),
            ("n2", "ascend910", "0,1,2,3,4,5,6,7"),
        ]);
        ctx.validate_job(&job("j", "ascend910", &[("w0", 8), ("w1", 8)]));
        ctx.bind(&task("j", "w0"), "n1").unwrap();
        ctx.bind(&task("j", "w1"), "n2").unwrap();
        ctx.mark_running("j").unwrap();

        let released = ctx.delete_job("j");

        assert_eq!(released.len(), 2);
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Released));
        assert_eq!(ctx.bound_node(&TaskId::new("j", "w0")), None);
        assert!(ctx.delete_job("j").is_empty());
    }

    #[test]
    fn lease_and_release_virtual() {
        let ctx = context_with(&[("n1", "ascend910b", "0,1,2,3,4,5,6,7")]);
        let a = TaskId::new("j", "a");
        let b = TaskId::new("j", "b");
        let sixty = Share::from_permille(600).unwrap();

        ctx.lease_virtual("n1", 3, sixty, &a).unwrap();
        let err = ctx.lease_virtual("n1", 3, sixty, &b).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::OverCommitted { .. }
        ));

        assert_eq!(ctx.release_virtual("n1", 3, &a), Some(sixty));
        assert_eq!(ctx.release_virtual("n1", 3, &a), None);
        ctx.lease_virtual("n1", 3, sixty, &b).unwrap();
    }

    #[test]
    fn lease_with_separator_in_task_id_is_rejected() {
        let ctx = context_with(&[("n1", "ascend910b", "0,1,2,3,4,5,6,7")]);
        let quarter = Share::from_permille(250).unwrap();

        for bad in [TaskId::new("j", "a=b"), TaskId::new("j;k", "a"), TaskId::new("j", "a/b")] {
            let err = ctx.lease_virtual("n1", 0, quarter, &bad).unwrap_err();
            assert!(matches!(
                err.current_context(),
                ScheduleError::ValidationFailed { .. }
            ));
        }
        assert_eq!(ctx.node_state("n1").unwrap().leases().in_use(0), 0);
    }

    #[test]
    fn reschedule_requires_a_bound_job() {
        let ctx = context_with(&[("n1", "ascend910", "0,1,2,3,4,5,6,7")]);
        ctx.validate_job(&job("j", "ascend910", &[("w0", 2)]));
        ctx.bind(&task("j", "w0"), "n1").unwrap();

        let requeued = ctx.pre_schedule_hook(ReschedulerState {
            rescheduling_jobs: vec!["j".to_string()],
            ..ReschedulerState::default()
        });

        assert_eq!(requeued, vec!["j".to_string()]);
        assert_eq!(ctx.job_phase("j"), Some(JobPhase::Pending));
        assert_eq!(ctx.node_state("n1").unwrap().topology().free_slots().len(), 8);
        assert!(ctx.reschedule_job("j").is_err());
    }
}
