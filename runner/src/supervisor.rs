//! Wallclock bounded control loop over all eligible basins.
//!
//! Nothing in here survives an invocation. Every decision is re-derived from the ledger and
//! the on-disk progress of each basin, which makes killing and restarting the supervisor safe.

pub mod resubmit;
pub mod state;

pub use state::{InvalidTransition, JobRecord, JobState};

use crate::{
    config::{Phase, ResubmitConfig, SandboxConfig},
    executors::{DispatchRequest, ExecutorError, JobDispatcher, JobHandle, Stage, SubmissionId},
    generate::{self, GenerateError},
    layout::ExperimentLayout,
    partition::{PartitionGenerationError, PartitionPlanner},
    registry::{self, Basin, Ledger, Lifecycle, RegistryError},
    tracker::{IterationTracker, Progress, TrackerError},
};
use resubmit::ResubmitError;
use std::{
    io,
    path::PathBuf,
    process::ExitStatus,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Resubmit(#[from] ResubmitError),
    #[error("No basin under {0:?} passed config generation")]
    NoEligibleBasins(PathBuf),
}

/// basin-local failures while starting a job
#[derive(Debug, Error)]
enum LaunchError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Partition(#[from] PartitionGenerationError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// no basin has work left
    Complete,
    Resubmitted {
        incomplete: Vec<String>,
        submission: SubmissionId,
    },
    /// work is left but resubmission is disabled
    NotResubmitted { incomplete: Vec<String> },
    /// work is left but this invocation moved nothing forward
    Stalled { incomplete: Vec<String> },
}

#[derive(Debug)]
pub struct Supervision {
    pub outcome: Outcome,
    pub records: Vec<JobRecord>,
}

/// progress snapshot of a basin, `None` if it could not be read
type Snapshot = Option<(Progress, bool)>;

struct Tracked<'b> {
    basin: &'b Basin,
    record: JobRecord,
    before: Snapshot,
}

pub struct WallclockSupervisor<'a> {
    config: &'a SandboxConfig,
    phase: Phase,
    resubmit: bool,
    deadline: Instant,
}

impl<'a> WallclockSupervisor<'a> {
    /// the wallclock starts now, the deadline keeps `launcher.buffer` in reserve
    pub fn new(config: &'a SandboxConfig, phase: Phase, resubmit: bool) -> Self {
        let budget = config
            .launcher
            .wallclock
            .saturating_sub(config.launcher.buffer);

        Self {
            config,
            phase,
            resubmit,
            deadline: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    #[instrument(skip_all, level = "info")]
    pub fn run(&self) -> Result<Supervision, SupervisorError> {
        let basins = registry::discover(
            &self.config.general.input_dir,
            &self.config.simulation.gage_ids,
        )?;
        let layouts = ExperimentLayout::for_config(self.config);

        if self.phase.generates() {
            generate::generate_pending(self.config, &layouts, &basins)?;
        }

        self.supervise(&basins, &layouts)
    }

    /// Dispatch, supervise and reconcile every basin recorded in the ledgers of `layouts`
    pub fn supervise(
        &self,
        basins: &[Basin],
        layouts: &[ExperimentLayout],
    ) -> Result<Supervision, SupervisorError> {
        let trackers: Vec<IterationTracker> = layouts.iter().map(IterationTracker::new).collect();
        let mut jobs = self.workload(basins, layouts, &trackers)?;

        if jobs.is_empty() {
            return Err(SupervisorError::NoEligibleBasins(
                self.config.general.output_dir.clone(),
            ));
        }

        let deadline_hit = self.poll_loop(&mut jobs, layouts, &trackers)?;

        if deadline_hit {
            self.shutdown(&mut jobs)?;
        }

        let outcome = self.reconcile(&mut jobs, layouts, &trackers, deadline_hit)?;

        Ok(Supervision {
            outcome,
            records: jobs.into_iter().map(|job| job.record).collect(),
        })
    }

    fn snapshot(
        &self,
        tracker: &IterationTracker<'_>,
        basin_id: &str,
    ) -> Result<(Progress, bool), TrackerError> {
        Ok((
            tracker.progress(basin_id)?.progress,
            tracker.has_validation(basin_id)?,
        ))
    }

    /// one record per eligible basin and tree, in tree then discovery order
    fn workload<'b>(
        &self,
        basins: &'b [Basin],
        layouts: &[ExperimentLayout],
        trackers: &[IterationTracker<'_>],
    ) -> Result<Vec<Tracked<'b>>, SupervisorError> {
        let task = self.config.simulation.task_type;
        let mut jobs = Vec::new();

        for (index, layout) in layouts.iter().enumerate() {
            let passed = Ledger::new(layout.ledger_path()).load_passed()?;
            let eligible: Vec<&Basin> = registry::eligible(basins, &passed)
                .into_iter()
                .filter(|basin| layout.includes(&basin.id))
                .collect();

            info!(
                model = layout.model().unwrap_or("-"),
                "{} of {} basin(s) passed config generation",
                eligible.len(),
                basins.len()
            );

            for basin in eligible {
                let mut record = JobRecord::new(basin.id.clone(), index, None);
                record.lifecycle.advance(Lifecycle::ConfigGenerated);

                let before = match self.snapshot(&trackers[index], &basin.id) {
                    Ok((progress, validated)) => {
                        record.stage = Stage::select(task, progress, validated);
                        if record.stage.is_none() {
                            info!(basin = %basin.id, "Nothing left to do ({progress}, validated: {validated})");
                            record.transition(JobState::Skipped)?;
                        }

                        Some((progress, validated))
                    }
                    Err(error) => {
                        error!(basin = %basin.id, error = ?error, "Failed to read progress: {error}");
                        record.transition(JobState::Failed)?;

                        None
                    }
                };

                jobs.push(Tracked {
                    basin,
                    record,
                    before,
                });
            }
        }

        Ok(jobs)
    }

    /// Keep up to the concurrency budget running until all finished or the deadline hit.
    ///
    /// Returns whether the deadline was hit
    #[instrument(skip_all, level = "info")]
    fn poll_loop(
        &self,
        jobs: &mut [Tracked<'_>],
        layouts: &[ExperimentLayout],
        trackers: &[IterationTracker<'_>],
    ) -> Result<bool, SupervisorError> {
        let dispatcher = JobDispatcher::new(self.config);
        let planner = PartitionPlanner::new(
            self.config.formulation.np_per_basin,
            self.config.formulation.np_per_basin_adaptive,
            self.config.tools.partitioner.clone(),
            self.config.tools.partition_timeout,
        )
        .until(self.deadline);
        let concurrency = self.config.concurrency().max(1);
        let total = jobs.len();
        let mut cursor = 0;

        debug!(
            queued = dispatcher.is_queued(),
            "Supervising {total} job(s), {concurrency} at a time, {:?} left",
            self.remaining()
        );

        loop {
            while !self.deadline_passed() && running(jobs) < concurrency {
                let Some(index) = (cursor..total).find(|index| jobs[*index].record.state() == JobState::Pending) else {
                    break;
                };
                cursor = index + 1;

                let job = &mut jobs[index];
                let layout = &layouts[job.record.layout];
                let tracker = &trackers[job.record.layout];
                self.launch(index + 1, total, job, layout, tracker, &dispatcher, &planner)?;
            }

            poll(jobs)?;

            if jobs.iter().all(|job| job.record.state().is_terminal()) {
                return Ok(false);
            }

            let now = Instant::now();
            if now >= self.deadline {
                return Ok(true);
            }

            thread::sleep(
                self.config
                    .launcher
                    .poll_interval
                    .min(self.deadline.saturating_duration_since(now)),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        position: usize,
        total: usize,
        job: &mut Tracked<'_>,
        layout: &ExperimentLayout,
        tracker: &IterationTracker<'_>,
        dispatcher: &JobDispatcher<'_>,
        planner: &PartitionPlanner,
    ) -> Result<(), InvalidTransition> {
        let Some(stage) = job.record.stage else {
            return Ok(());
        };
        let progress = job
            .before
            .map(|(progress, _)| progress.to_string())
            .unwrap_or_else(|| "?".into());

        match self.start_job(job.basin, layout, tracker, stage, dispatcher, planner) {
            Ok(None) => {
                info!(basin = %job.basin.id, "Deadline reached while preparing {stage}, not dispatching");
            }
            Ok(Some(handle)) => {
                job.record.start(handle)?;
                info!(
                    basin = %job.basin.id,
                    "[{position}/{total}] {} {stage} (iteration {progress})",
                    job.basin.id
                );
            }
            Err(error) => {
                error!(basin = %job.basin.id, error = ?error, "Failed to dispatch {stage}: {error}");
                job.record.transition(JobState::Failed)?;
            }
        }

        Ok(())
    }

    fn start_job(
        &self,
        basin: &Basin,
        layout: &ExperimentLayout,
        tracker: &IterationTracker<'_>,
        stage: Stage,
        dispatcher: &JobDispatcher<'_>,
        planner: &PartitionPlanner,
    ) -> Result<Option<JobHandle>, LaunchError> {
        let paths = tracker.basin_paths(&basin.id)?;
        let num_cpus = tracker.meta(&basin.id)?.and_then(|meta| meta.num_cpus);
        let plan = match planner.plan_basin(basin, &paths, &self.config.base_placeholders()) {
            Err(PartitionGenerationError::Timeout(_)) if self.deadline_passed() => return Ok(None),
            plan => plan?,
        };

        // planning may have used up the rest of the wallclock
        if self.deadline_passed() {
            return Ok(None);
        }

        Ok(Some(dispatcher.dispatch(&DispatchRequest {
            basin,
            layout,
            paths: &paths,
            stage,
            plan: &plan,
            num_cpus,
        })?))
    }

    /// Stop all running jobs, SIGTERM first and SIGKILL for those outliving the grace period
    #[instrument(skip_all, level = "info")]
    fn shutdown(&self, jobs: &mut [Tracked<'_>]) -> Result<(), InvalidTransition> {
        let mut running: Vec<&mut Tracked<'_>> = jobs
            .iter_mut()
            .filter(|job| job.record.state() == JobState::Running)
            .collect();

        if running.is_empty() {
            return Ok(());
        }

        warn!(
            "Wallclock deadline reached, stopping {} running job(s)",
            running.len()
        );

        for job in running.iter_mut() {
            job.record.transition(JobState::GraceTerminating)?;
            if let Some(JobHandle::Local(local)) = job.record.handle.as_ref() {
                local.signal_graceful();
            }
        }

        let grace_end = Instant::now() + self.config.launcher.grace_period;

        for job in running {
            let remaining = grace_end.saturating_duration_since(Instant::now());
            let forced = match job.record.handle.as_mut() {
                Some(JobHandle::Local(local)) => match local.wait_grace(remaining) {
                    Ok(Some(status)) => {
                        debug!(basin = %job.basin.id, "Stopped gracefully with {status}");
                        false
                    }
                    Ok(None) | Err(_) => {
                        warn!(basin = %job.basin.id, "Did not stop within the grace period, killing it");
                        if let Err(error) = local.force_kill() {
                            warn!(basin = %job.basin.id, error = ?error, "Failed to reap killed job");
                        }
                        true
                    }
                },
                _ => false,
            };

            job.record.terminate(forced)?;
        }

        Ok(())
    }

    /// re-read every basin's progress and decide how this invocation ends
    #[instrument(skip_all, level = "info")]
    fn reconcile(
        &self,
        jobs: &mut [Tracked<'_>],
        layouts: &[ExperimentLayout],
        trackers: &[IterationTracker<'_>],
        deadline_hit: bool,
    ) -> Result<Outcome, SupervisorError> {
        let task = self.config.simulation.task_type;
        let mut incomplete = Vec::new();
        let mut submissions = Vec::new();
        let mut advanced = false;

        for job in jobs.iter_mut() {
            let layout = &layouts[job.record.layout];
            let label = match layout.model_dir() {
                Some(model_dir) => format!("{model_dir}/{}", job.basin.id),
                None => job.basin.id.clone(),
            };

            if let Some(JobHandle::Queued(id)) = &job.record.handle {
                submissions.push(id.clone());
            }

            match self.snapshot(&trackers[job.record.layout], &job.basin.id) {
                Ok((progress, validated)) => {
                    if let Some((before, was_validated)) = job.before {
                        advanced |= progress.current > before.current || (validated && !was_validated);
                    }

                    let needs_work = Stage::needs_work(task, progress, validated);
                    if validated {
                        job.record.lifecycle.advance(Lifecycle::Validated);
                    } else if !needs_work && job.record.state() != JobState::Failed {
                        job.record.lifecycle.advance(Lifecycle::Completed);
                    }

                    info!(
                        basin = %job.basin.id,
                        "{label}: {:?}, iteration {progress}, validated: {validated}",
                        job.record.state()
                    );

                    if needs_work {
                        incomplete.push(label);
                    }
                }
                Err(error) => {
                    warn!(basin = %job.basin.id, error = ?error, "Failed to re-read progress: {error}");
                    incomplete.push(label);
                }
            }
        }

        if incomplete.is_empty() {
            info!("All {} basin(s) completed", jobs.len());
            return Ok(Outcome::Complete);
        }

        if !deadline_hit && submissions.is_empty() && !advanced {
            error!(
                "{} basin(s) incomplete but nothing advanced, not resubmitting: {}",
                incomplete.len(),
                incomplete.join(", ")
            );
            return Ok(Outcome::Stalled { incomplete });
        }

        if !self.resubmit || matches!(self.config.launcher.resubmit, ResubmitConfig::Never) {
            warn!(
                "{} basin(s) incomplete, resubmission disabled: {}",
                incomplete.len(),
                incomplete.join(", ")
            );
            return Ok(Outcome::NotResubmitted { incomplete });
        }

        info!(
            "{} basin(s) incomplete, resubmitting: {}",
            incomplete.len(),
            incomplete.join(", ")
        );
        let submission = resubmit::resubmit(self.config, &submissions)?;

        Ok(Outcome::Resubmitted {
            incomplete,
            submission,
        })
    }
}

fn running(jobs: &[Tracked<'_>]) -> usize {
    jobs.iter()
        .filter(|job| job.record.state() == JobState::Running)
        .count()
}

/// non-blocking check of every running job
fn poll(jobs: &mut [Tracked<'_>]) -> Result<(), InvalidTransition> {
    for job in jobs
        .iter_mut()
        .filter(|job| job.record.state() == JobState::Running)
    {
        let finished = match job.record.handle.as_mut() {
            Some(JobHandle::Local(local)) => local
                .try_finished()
                .map(|status| status.map(|status| (status, local.elapsed()))),
            _ => continue,
        };

        settle(&mut job.record, finished)?;
    }

    Ok(())
}

/// move a running record on according to the liveness check of its job
fn settle(
    record: &mut JobRecord,
    finished: io::Result<Option<(ExitStatus, Duration)>>,
) -> Result<(), InvalidTransition> {
    match finished {
        Ok(None) => Ok(()),
        Ok(Some((status, elapsed))) if status.success() => {
            info!(basin = %record.basin_id, "Finished in {:.1} s", elapsed.as_secs_f64());
            record.transition(JobState::Completed)
        }
        Ok(Some((status, elapsed))) => {
            warn!(basin = %record.basin_id, "Failed after {:.1} s with {status}", elapsed.as_secs_f64());
            record.transition(JobState::Failed)
        }
        // a job that cannot be polled would otherwise hold the run until the deadline
        Err(error) => {
            error!(basin = %record.basin_id, error = ?error, "Lost track of job, marking it failed");
            record.transition(JobState::Failed)
        }
    }
}

#[cfg(test)]
mod supervisor_test;
