//! Daemon lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.
//! A start that fails before running goes straight back to `Idle`.

use std::sync::atomic::{AtomicU8, Ordering};

use error_stack::Report;
use tracing::info;

use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum LifecycleState {
    #[display("idle")]
    Idle = 0,
    #[display("starting")]
    Starting = 1,
    #[display("running")]
    Running = 2,
    #[display("stopping")]
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Idle as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// `Idle -> Starting`
    pub fn begin_start(&self) -> Result<()> {
        self.transition(LifecycleState::Idle, LifecycleState::Starting)
    }

    /// `Starting -> Running`
    pub fn mark_running(&self) -> Result<()> {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
    }

    /// `Starting -> Idle`
    pub fn abort_start(&self) -> Result<()> {
        self.transition(LifecycleState::Starting, LifecycleState::Idle)
    }

    /// `Running -> Stopping`
    pub fn begin_stop(&self) -> Result<()> {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
    }

    /// `Stopping -> Idle`
    pub fn mark_stopped(&self) -> Result<()> {
        self.transition(LifecycleState::Stopping, LifecycleState::Idle)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| {
                Report::new(ScheduleError::InvalidTransition {
                    subject: "daemon".to_string(),
                    from: LifecycleState::from_u8(actual).to_string(),
                    to: to.to_string(),
                })
            })?;
        info!(%from, %to, "lifecycle transition");
        Ok(())
    }
}
