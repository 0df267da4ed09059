use crate::{
    executors::{JobHandle, Stage},
    registry::Lifecycle,
};
use std::time::Instant;
use thiserror::Error;

/// Liveness of one job within a supervisor invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    GraceTerminating,
    Terminated,
    Failed,
    Skipped,
    // handed to the batch queue, not tracked any further
    Submitted,
}

impl JobState {
    pub fn can_transition(&self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Pending, Running | Failed | Skipped | Submitted)
                | (Running, Completed | Failed | GraceTerminating)
                | (GraceTerminating, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::GraceTerminating)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid job state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// One basin's job in the current invocation, never persisted
#[derive(Debug)]
pub struct JobRecord {
    pub basin_id: String,
    // index of the output tree the basin belongs to
    pub layout: usize,
    pub stage: Option<Stage>,
    pub handle: Option<JobHandle>,
    pub started: Option<Instant>,
    pub lifecycle: Lifecycle,
    state: JobState,
    history: Vec<JobState>,
    forced: bool,
}

impl JobRecord {
    pub fn new(basin_id: String, layout: usize, stage: Option<Stage>) -> Self {
        Self {
            basin_id,
            layout,
            stage,
            handle: None,
            started: None,
            lifecycle: Lifecycle::Discovered,
            state: JobState::Pending,
            history: vec![JobState::Pending],
            forced: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// every state the job went through, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// true if the job had to be killed after its grace period
    pub fn forced(&self) -> bool {
        self.forced
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        self.history.push(next);

        Ok(())
    }

    /// attach a fresh handle, local jobs are running and queue jobs are submitted
    pub fn start(&mut self, handle: JobHandle) -> Result<(), InvalidTransition> {
        let next = match handle {
            JobHandle::Local(_) => JobState::Running,
            JobHandle::Queued(_) => JobState::Submitted,
        };

        self.transition(next)?;
        self.handle = Some(handle);
        self.started = Some(Instant::now());
        self.lifecycle.advance(Lifecycle::Running);

        Ok(())
    }

    /// TERMINATED is only reachable through GRACE_TERMINATING, `forced` records the kill
    pub fn terminate(&mut self, forced: bool) -> Result<(), InvalidTransition> {
        self.transition(JobState::Terminated)?;
        self.forced = forced;

        Ok(())
    }
}
