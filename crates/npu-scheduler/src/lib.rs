//! Topology-aware NPU scheduling engine.
//!
//! Validates jobs against per-family rules, scores candidate nodes by
//! interconnect locality, and commits whole-device and virtual-device
//! allocations that are written back as node annotations.

pub mod affinity;
pub mod allocator;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod family;
pub mod jobs;
pub mod lifecycle;
pub mod policy;
pub mod requirement;
pub mod reschedule;
pub mod simulate;
pub mod topology;
pub mod validator;
pub mod vdevice;

pub use context::SchedulerContext;
pub use error::{Result, ScheduleError};
