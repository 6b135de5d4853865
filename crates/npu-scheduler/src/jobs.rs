//! Job phase tracking.

use std::collections::BTreeSet;

use api_types::JobSpec;
use error_stack::Report;

use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum JobPhase {
    #[display("pending")]
    Pending,
    #[display("validated")]
    Validated,
    #[display("scoring")]
    Scoring,
    #[display("bound")]
    Bound,
    #[display("running")]
    Running,
    #[display("released")]
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum JobEvent {
    /// Admission passed
    #[display("validate")]
    Validate,
    /// A filter, score or bind call touched the job
    #[display("score")]
    Score,
    /// The last task of the job was bound
    #[display("all-bound")]
    AllBound,
    /// The job's tasks started
    #[display("start")]
    Start,
    /// Bindings dropped before the job ran; back to the queue
    #[display("requeue")]
    Requeue,
    /// Every task of a running job was released
    #[display("drain")]
    Drain,
    #[display("delete")]
    Delete,
}

impl JobPhase {
    /// The phase `event` leads to, `None` if it is not allowed here.
    pub fn next(self, event: JobEvent) -> Option<JobPhase> {
        use JobEvent as E;
        use JobPhase as P;

        match (self, event) {
            (P::Pending, E::Validate) => Some(P::Validated),
            (P::Validated | P::Scoring, E::Score) => Some(P::Scoring),
            (P::Scoring, E::AllBound) => Some(P::Bound),
            (P::Bound, E::Start) => Some(P::Running),
            (P::Bound, E::Requeue) => Some(P::Pending),
            (P::Running, E::Drain) => Some(P::Released),
            (P::Released, E::Delete) => None,
            (_, E::Delete) => Some(P::Released),
            _ => None,
        }
    }
}

/// A submitted job and its progress through the phases.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub spec: JobSpec,
    phase: JobPhase,
    /// Names of the tasks currently holding devices
    pub bound: BTreeSet<String>,
    /// Super-pod the job's first bound task landed in
    pub super_pod: Option<String>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            phase: JobPhase::Pending,
            bound: BTreeSet::new(),
            super_pod: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Apply `event`.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::InvalidTransition`] if the current phase does not
    ///   accept `event`; the phase is left unchanged
    pub fn apply(&mut self, event: JobEvent) -> Result<JobPhase> {
        let next = self.phase.next(event).ok_or_else(|| {
            Report::new(ScheduleError::InvalidTransition {
                subject: format!("job {}", self.spec.id),
                from: self.phase.to_string(),
                to: event.to_string(),
            })
        })?;
        self.phase = next;
        Ok(next)
    }

    pub fn all_bound(&self) -> bool {
        self.spec
            .tasks
            .iter()
            .all(|task| self.bound.contains(&task.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(JobSpec {
            id: "default/job".to_string(),
            family: "ascend910".to_string(),
            tasks: vec![],
            sp_block: None,
        })
    }

    #[test]
    fn happy_path() {
        let mut job = record();
        for (event, phase) in [
            (JobEvent::Validate, JobPhase::Validated),
            (JobEvent::Score, JobPhase::Scoring),
            (JobEvent::Score, JobPhase::Scoring),
            (JobEvent::AllBound, JobPhase::Bound),
            (JobEvent::Start, JobPhase::Running),
            (JobEvent::Drain, JobPhase::Released),
        ] {
            assert_eq!(job.apply(event).unwrap(), phase);
        }
    }

    #[test]
    fn only_bound_jobs_requeue() {
        assert_eq!(JobPhase::Bound.next(JobEvent::Requeue), Some(JobPhase::Pending));
        assert_eq!(JobPhase::Running.next(JobEvent::Requeue), None);
        assert_eq!(JobPhase::Scoring.next(JobEvent::Requeue), None);
    }

    #[test]
    fn delete_releases_from_any_live_phase() {
        for phase in [
            JobPhase::Pending,
            JobPhase::Validated,
            JobPhase::Scoring,
            JobPhase::Bound,
            JobPhase::Running,
        ] {
            assert_eq!(phase.next(JobEvent::Delete), Some(JobPhase::Released));
        }
        assert_eq!(JobPhase::Released.next(JobEvent::Delete), None);
    }

    #[test]
    fn illegal_event_keeps_phase() {
        let mut job = record();
        let err = job.apply(JobEvent::Start).unwrap_err();

        assert_eq!(
            err.current_context(),
            &ScheduleError::InvalidTransition {
                subject: "job default/job".to_string(),
                from: "pending".to_string(),
                to: "start".to_string(),
            }
        );
        assert_eq!(job.phase(), JobPhase::Pending);
    }
}
