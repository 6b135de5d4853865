use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::annotations;
use api_types::{JobSpec, ReschedulerState, TaskRef, TaskSpec};
use npu_scheduler::affinity::matrix::RING4;
use npu_scheduler::allocator;
use npu_scheduler::family::{FamilyRegistry, FamilyTag};
use npu_scheduler::jobs::JobPhase;
use npu_scheduler::requirement::{TaskId, TaskNpuRequirement};
use npu_scheduler::topology::{NodeState, Occupancy};
use npu_scheduler::vdevice::Share;
use npu_scheduler::{SchedulerContext, ScheduleError};
use test_log::test;

const ALL_EIGHT: &str = "0,1,2,3,4,5,6,7";

fn node(family: &str, free: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (annotations::FAMILY.to_string(), family.to_string()),
        (annotations::FREE.to_string(), free.to_string()),
    ])
}

fn single_task_job(id: &str, family: &str, npu: usize) -> JobSpec {
    JobSpec {
        id: id.to_string(),
        family: family.to_string(),
        tasks: vec![TaskSpec {
            name: "w0".to_string(),
            npu,
            vnpu_ratio: None,
            exclusive: false,
        }],
        sp_block: None,
    }
}

fn virtual_job(id: &str, ratio: f64, exclusive: bool) -> JobSpec {
    JobSpec {
        id: id.to_string(),
        family: "ascend910b".to_string(),
        tasks: vec![TaskSpec {
            name: "w0".to_string(),
            npu: 0,
            vnpu_ratio: Some(ratio),
            exclusive,
        }],
        sp_block: None,
    }
}

fn task(job: &str) -> TaskRef {
    TaskRef {
        job: job.to_string(),
        task: "w0".to_string(),
    }
}

#[test]
fn two_devices_on_an_empty_ring_node() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910", ALL_EIGHT)).unwrap();
    assert!(ctx.validate_job(&single_task_job("j", "ascend910", 2)).pass);

    let score = ctx.check_node_feasible(&task("j"), "n1").unwrap();
    assert_eq!(Some(score), RING4.lookup(2, 4));

    let bound = ctx.bind(&task("j"), "n1").unwrap();
    assert_eq!(bound.devices, vec![0, 1]);
    assert_eq!(bound.annotations[annotations::FREE], "2,3,4,5,6,7");
}

#[test]
fn one_free_slot_cannot_host_four() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910", "5")).unwrap();
    ctx.validate_job(&single_task_job("j", "ascend910", 4));

    let err = ctx.check_node_feasible(&task("j"), "n1").unwrap_err();
    assert!(matches!(
        err.current_context(),
        ScheduleError::InfeasibleNode { .. }
    ));

    let filtered = ctx.filter(&task("j"), &["n1".to_string()]);
    assert!(filtered.nodes.is_empty());
    assert!(filtered.failed_nodes.contains_key("n1"));
}

#[test]
fn leased_slot_is_withheld_from_whole_devices() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910b", ALL_EIGHT)).unwrap();
    let tenant = TaskId::new("tenant", "v0");
    ctx.lease_virtual("n1", 3, Share::from_permille(600).unwrap(), &tenant)
        .unwrap();

    let state = ctx.node_state("n1").unwrap();
    assert_eq!(state.topology().occupancy(3), Some(&Occupancy::Leased));
    assert!(state.records().all(|record| record.task == tenant));
    assert!(!state.topology().free_slots().contains(&3));
    assert!(!state.view(&BTreeSet::new()).free_by_group[0].contains(&3));

    ctx.validate_job(&single_task_job("whole", "ascend910b", 8));
    let err = ctx.check_node_feasible(&task("whole"), "n1").unwrap_err();
    assert!(matches!(
        err.current_context(),
        ScheduleError::InfeasibleNode { .. }
    ));

    ctx.validate_job(&single_task_job("half", "ascend910b", 4));
    let bound = ctx.bind(&task("half"), "n1").unwrap();
    assert_eq!(bound.devices, vec![0, 1, 2, 4]);
}

#[test]
fn release_twice_is_a_no_op() {
    let registry = FamilyRegistry::builtin();
    let profile = registry.get(FamilyTag::Ascend910).unwrap();
    let mut state = NodeState::from_annotations("n1", &node("ascend910", ALL_EIGHT), &registry)
        .unwrap();
    let requirement = TaskNpuRequirement {
        task: TaskId::new("j", "w0"),
        family: FamilyTag::Ascend910,
        npu: 4,
        exclusive: true,
        vnpu: None,
    };

    allocator::allocate(&mut state, &requirement, profile, &BTreeSet::new()).unwrap();
    assert!(allocator::release(&mut state, &requirement.task).is_some());
    let after_first = state.annotation_patch();

    assert!(allocator::release(&mut state, &requirement.task).is_none());
    assert_eq!(state.annotation_patch(), after_first);
    assert_eq!(state.topology().free_slots().len(), 8);
}

#[test]
fn unbind_twice_through_the_engine() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910", ALL_EIGHT)).unwrap();
    ctx.validate_job(&single_task_job("j", "ascend910", 1));
    ctx.bind(&task("j"), "n1").unwrap();

    let first = ctx.unbind(&task("j"), "n1");
    let second = ctx.unbind(&task("j"), "n1");

    assert!(second.error.is_none());
    assert_eq!(first.annotations, second.annotations);
    assert_eq!(ctx.job_phase("j"), Some(JobPhase::Pending));
}

#[test]
fn degraded_node_loses_to_a_healthy_one() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("degraded", &node("ascend910", ALL_EIGHT))
        .unwrap();
    ctx.upsert_node("healthy", &node("ascend910", ALL_EIGHT))
        .unwrap();
    ctx.pre_schedule_hook(ReschedulerState {
        degraded_nodes: vec!["degraded".to_string()],
        ..ReschedulerState::default()
    });
    ctx.validate_job(&single_task_job("j", "ascend910", 2));

    let degraded = ctx.check_node_feasible(&task("j"), "degraded").unwrap();
    let healthy = ctx.check_node_feasible(&task("j"), "healthy").unwrap();
    assert!(healthy < degraded);
}

#[test]
fn faulted_device_is_evicted_and_masked() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910", ALL_EIGHT)).unwrap();
    ctx.validate_job(&single_task_job("j", "ascend910", 4));
    ctx.bind(&task("j"), "n1").unwrap();

    ctx.pre_schedule_hook(ReschedulerState {
        faulted_devices: BTreeMap::from([("n1".to_string(), vec![1, 6])]),
        ..ReschedulerState::default()
    });

    let evictions = ctx.tasks_to_evict();
    assert_eq!(evictions.len(), 1);
    assert_eq!(evictions[0].task, TaskId::new("j", "w0"));

    ctx.validate_job(&single_task_job("other", "ascend910", 4));
    let err = ctx.check_node_feasible(&task("other"), "n1").unwrap_err();
    assert!(matches!(
        err.current_context(),
        ScheduleError::InfeasibleNode { .. }
    ));
}

#[test]
fn restart_rebuilds_bindings_from_annotations() {
    let before = SchedulerContext::default();
    before
        .upsert_node("n1", &node("ascend910b", ALL_EIGHT))
        .unwrap();
    before.validate_job(&single_task_job("j", "ascend910b", 3));
    let bound = before.bind(&task("j"), "n1").unwrap();
    before
        .lease_virtual("n1", 5, Share::from_permille(250).unwrap(), &TaskId::new("v", "t"))
        .unwrap();
    let persisted = before.node_annotations("n1").unwrap();

    let after = SchedulerContext::default();
    after.upsert_node("n1", &persisted).unwrap();

    let state = after.node_state("n1").unwrap();
    assert_eq!(
        state.record(&TaskId::new("j", "w0")).map(|r| r.devices.clone()),
        Some(bound.devices)
    );
    assert_eq!(state.leases().in_use(5), 250);
    similar_asserts::assert_eq!(after.node_annotations("n1").unwrap(), persisted);
}

#[test]
fn namespaced_jobs_survive_a_restart() {
    let before = SchedulerContext::default();
    before
        .upsert_node("n1", &node("ascend910b", ALL_EIGHT))
        .unwrap();
    assert!(before
        .validate_job(&single_task_job("default/train", "ascend910b", 2))
        .pass);
    let bound = before.bind(&task("default/train"), "n1").unwrap();
    let tenant = TaskId::new("team-a/serve", "w0");
    before
        .lease_virtual("n1", 6, Share::from_permille(500).unwrap(), &tenant)
        .unwrap();
    let persisted = before.node_annotations("n1").unwrap();
    assert_eq!(persisted[annotations::ASSIGNED], "default/train/w0=0,1");

    let after = SchedulerContext::default();
    after.upsert_node("n1", &persisted).unwrap();

    let state = after.node_state("n1").unwrap();
    let record = state.record(&TaskId::new("default/train", "w0")).unwrap();
    assert_eq!(record.devices, bound.devices);
    assert_eq!(record.job(), "default/train");
    assert_eq!(state.record(&tenant).map(|r| r.devices.clone()), Some(vec![6]));
    assert_eq!(
        after.bound_node(&TaskId::new("default/train", "w0")),
        Some("n1".to_string())
    );
    similar_asserts::assert_eq!(after.node_annotations("n1").unwrap(), persisted);
}

#[test]
fn unsafe_names_never_reach_the_annotations() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910b", ALL_EIGHT)).unwrap();

    let result = ctx.validate_job(&single_task_job("default/a=b", "ascend910b", 1));
    assert!(!result.pass);
    assert_eq!(result.reason, "IllegalName");

    let err = ctx.bind(&task("default/a=b"), "n1").unwrap_err();
    assert!(!matches!(
        err.current_context(),
        ScheduleError::MalformedTopology { .. }
    ));
    assert_eq!(ctx.node_annotations("n1").unwrap()[annotations::ASSIGNED], "");
}

#[test]
fn exclusive_virtual_task_keeps_its_slot() {
    let ctx = SchedulerContext::default();
    ctx.upsert_node("n1", &node("ascend910b", ALL_EIGHT)).unwrap();
    for job in [
        virtual_job("solo", 0.25, true),
        virtual_job("shared", 0.25, false),
        virtual_job("late", 0.25, false),
    ] {
        assert!(ctx.validate_job(&job).pass);
    }

    let solo = ctx.bind(&task("solo"), "n1").unwrap();
    let shared = ctx.bind(&task("shared"), "n1").unwrap();
    assert_eq!(solo.devices, vec![0]);
    assert_eq!(shared.devices, vec![1]);
    assert_eq!(solo.annotations[annotations::VNPU], "0@solo/w0=250!");

    let after = SchedulerContext::default();
    after
        .upsert_node("n1", &ctx.node_annotations("n1").unwrap())
        .unwrap();
    assert!(after.validate_job(&virtual_job("late", 0.25, false)).pass);
    let late = after.bind(&task("late"), "n1").unwrap();
    assert_eq!(late.devices, vec![1]);
    assert_eq!(after.node_state("n1").unwrap().leases().in_use(0), 250);
}
