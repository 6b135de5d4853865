use core::error::Error;

use error_stack::Report;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C = ScheduleError> = core::result::Result<T, Report<C>>;

/// Errors raised by the scheduling engine.
///
/// Per-node variants (`MalformedTopology`, `InfeasibleNode`) never abort a
/// multi-node call; callers skip the node and carry on.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ScheduleError {
    #[display("malformed topology on node {node}: {message}")]
    MalformedTopology { node: String, message: String },
    #[display("job {job} failed validation: {reason}")]
    ValidationFailed { job: String, reason: String },
    #[display("node {node} cannot host task {task}: {message}")]
    InfeasibleNode {
        node: String,
        task: String,
        message: String,
    },
    #[display("node {node} no longer satisfies task {task}")]
    InsufficientTopology { node: String, task: String },
    #[display("slot {slot} on node {node} over-committed: {requested} + {in_use} > 1000 per-mille")]
    OverCommitted {
        node: String,
        slot: usize,
        requested: u32,
        in_use: u32,
    },
    #[display("unsupported accelerator family: {family}")]
    UnsupportedFamily { family: String },
    #[display("unknown node: {node}")]
    UnknownNode { node: String },
    #[display("unknown job: {job}")]
    UnknownJob { job: String },
    #[display("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
    #[display("route conflict: {route}")]
    RouteConflict { route: String },
    #[display("configuration error: {message}")]
    Config { message: String },
}

impl Error for ScheduleError {}

impl ScheduleError {
    pub fn malformed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedTopology {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn infeasible(
        node: impl Into<String>,
        task: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InfeasibleNode {
            node: node.into(),
            task: task.into(),
            message: message.into(),
        }
    }
}
