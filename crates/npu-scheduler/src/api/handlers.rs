use std::collections::HashMap;
use std::sync::Arc;

use api_types::{
    BindArgs, BindResult, Eviction, ExtenderArgs, FilterResult, HostPriority, JobRef, JobSpec,
    NodeUpdate, PreScheduleResult, ReschedulerState, TaskRef, ValidationResult,
};
use poem::handler;
use poem::http::StatusCode;
use poem::web::{Data, Json};
use tracing::{info, warn};

use super::errors::to_poem_error;
use crate::context::SchedulerContext;

#[handler]
pub async fn validate(
    Json(job): Json<JobSpec>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<ValidationResult> {
    Json(ctx.validate_job(&job))
}

#[handler]
pub async fn prescheduler(
    Json(state): Json<ReschedulerState>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<PreScheduleResult> {
    Json(PreScheduleResult {
        rescheduled: ctx.pre_schedule_hook(state),
    })
}

#[handler]
pub async fn filter(
    Json(args): Json<ExtenderArgs>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<FilterResult> {
    Json(ctx.filter(&args.task, &args.nodes))
}

/// Raw scores in request order. Lower is better.
#[handler]
pub async fn score(
    Json(args): Json<ExtenderArgs>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> poem::Result<Json<Vec<HostPriority>>> {
    let mut scores = HashMap::new();
    ctx.score_nodes(&args.task, &args.nodes, &mut scores)
        .map_err(|report| to_poem_error(&report))?;

    let priorities = args
        .nodes
        .iter()
        .filter_map(|node| {
            scores.get(node).map(|score| HostPriority {
                host: node.clone(),
                score: *score,
            })
        })
        .collect();
    Ok(Json(priorities))
}

/// Failures are reported in the body so the framework can retry the task.
#[handler]
pub async fn bind(
    Json(args): Json<BindArgs>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<BindResult> {
    match ctx.bind(&args.task, &args.node) {
        Ok(result) => Json(result),
        Err(report) => Json(BindResult {
            node: args.node,
            error: Some(report.current_context().to_string()),
            ..BindResult::default()
        }),
    }
}

#[handler]
pub async fn unbind(
    Json(args): Json<BindArgs>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<BindResult> {
    Json(ctx.unbind(&args.task, &args.node))
}

#[handler]
pub async fn upsert_node(
    Json(update): Json<NodeUpdate>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> poem::Result<StatusCode> {
    ctx.upsert_node(&update.name, &update.annotations)
        .map_err(|report| to_poem_error(&report))?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
pub async fn start_job(
    Json(job): Json<JobRef>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> poem::Result<StatusCode> {
    ctx.mark_running(&job.job)
        .map_err(|report| to_poem_error(&report))?;
    Ok(StatusCode::NO_CONTENT)
}

#[handler]
pub async fn delete_job(
    Json(job): Json<JobRef>,
    ctx: Data<&Arc<SchedulerContext>>,
) -> Json<Vec<Eviction>> {
    let released = ctx.delete_job(&job.job);
    info!(job = %job.job, released = released.len(), "job deleted through api");
    Json(released.into_iter().map(to_eviction).collect())
}

#[handler]
pub async fn evictions(ctx: Data<&Arc<SchedulerContext>>) -> Json<Vec<Eviction>> {
    Json(ctx.tasks_to_evict().into_iter().map(to_eviction).collect())
}

#[handler]
pub async fn healthz(ctx: Data<&Arc<SchedulerContext>>) -> (StatusCode, String) {
    let state = ctx.lifecycle().state();
    if ctx.lifecycle().is_running() {
        (StatusCode::OK, state.to_string())
    } else {
        warn!(%state, "health probe while not running");
        (StatusCode::SERVICE_UNAVAILABLE, state.to_string())
    }
}

fn to_eviction(record: crate::allocator::AllocationRecord) -> Eviction {
    Eviction {
        task: TaskRef {
            job: record.task.job().to_string(),
            task: record.task.task().to_string(),
        },
        node: record.node,
        devices: record.devices,
    }
}
