//! HTTP extender API
//!
//! The host scheduling framework drives the engine through these calls,
//! all JSON over HTTP:
//!
//! - `POST /validate` - admit a job
//! - `POST /prescheduler` - start a cycle with the rescheduler's fault state
//! - `POST /filter` - feasible candidate nodes for a task
//! - `POST /score` - raw scores of candidate nodes, lower is better
//! - `POST /bind` / `POST /unbind` - commit or release a task's devices
//! - `POST /nodes` - push a node's annotations into the cycle snapshot
//! - `POST /jobs/start` / `POST /jobs/delete` - job lifecycle notifications
//! - `GET /evictions` - tasks that must leave faulted devices
//! - `GET /healthz` - liveness

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod server;

pub use errors::ApiError;
pub use routes::RouteTable;
pub use server::ExtenderServer;
