use crate::{
    command::{display_argv, CommandTemplate, Placeholders},
    layout::BasinPaths,
    registry::Basin,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// hard upper bound on workers per basin in adaptive mode
pub const MAX_WORKERS_PER_BASIN: u32 = 20;

#[derive(Debug, Error)]
pub enum PartitionGenerationError {
    #[error("Partition generator is an empty command")]
    EmptyCommand,
    #[error("Failed to spawn partition generator: {0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to wait for partition generator: {0}")]
    Wait(#[source] io::Error),
    #[error("Partition generator did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Partition generator failed with {0}")]
    Failed(ExitStatus),
    #[error("Partition generator finished but {0:?} was not written")]
    MissingArtifact(PathBuf),
    #[error("Failed to prepare {path:?}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
}

/// Number of worker processes for a basin with `catchment_count` divides
pub fn plan(catchment_count: u32, processor_budget: u32, adaptive: bool) -> u32 {
    let catchment_count = catchment_count.max(1);
    let processor_budget = processor_budget.max(1);

    if catchment_count <= processor_budget {
        catchment_count
    } else if adaptive {
        (catchment_count / processor_budget).min(MAX_WORKERS_PER_BASIN)
    } else {
        processor_budget
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub basin_id: String,
    pub worker_count: u32,
    pub partition: Option<PathBuf>,
}

/// Sizes basins and materializes their decomposition artifacts.
///
/// Holds no mutable state, planning one basin never affects another
#[derive(Debug, Clone)]
pub struct PartitionPlanner {
    processor_budget: u32,
    adaptive: bool,
    generator: CommandTemplate,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl PartitionPlanner {
    pub fn new(
        processor_budget: u32,
        adaptive: bool,
        generator: CommandTemplate,
        timeout: Duration,
    ) -> Self {
        Self {
            processor_budget,
            adaptive,
            generator,
            timeout,
            deadline: None,
        }
    }

    /// never wait for the partition generator past `deadline`
    pub fn until(self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    fn wait_limit(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.timeout,
        }
    }

    /// Plan a basin and make sure its partition artifact exists if it needs more than one
    /// worker. A budget of one processor never partitions.
    #[instrument(skip_all, fields(basin = %basin.id), level = "debug")]
    pub fn plan_basin(
        &self,
        basin: &Basin,
        paths: &BasinPaths,
        vars: &Placeholders,
    ) -> Result<PartitionPlan, PartitionGenerationError> {
        let worker_count = if self.processor_budget <= 1 {
            1
        } else {
            plan(basin.num_divides, self.processor_budget, self.adaptive)
        };

        let partition = if worker_count > 1 {
            Some(self.ensure_partition(basin, paths, worker_count, vars)?)
        } else {
            None
        };

        info!(
            basin = %basin.id,
            "Running basin {} on {worker_count} worker(s) ({} divides)",
            basin.id, basin.num_divides
        );

        Ok(PartitionPlan {
            basin_id: basin.id.clone(),
            worker_count,
            partition,
        })
    }

    fn ensure_partition(
        &self,
        basin: &Basin,
        paths: &BasinPaths,
        worker_count: u32,
        vars: &Placeholders,
    ) -> Result<PathBuf, PartitionGenerationError> {
        let artifact = paths.partition(worker_count);

        if is_fresh(&artifact, &basin.geopackage) {
            debug!(path = ?artifact, "Reusing partition artifact");
            return Ok(artifact);
        }

        let configs_dir = paths.configs_dir();
        fs::create_dir_all(&configs_dir).map_err(|source| PartitionGenerationError::Prepare {
            path: configs_dir.clone(),
            source,
        })?;

        let mut vars = vars.clone();
        vars.insert("basin_id", basin.id.clone());
        vars.insert("gpkg", basin.geopackage.to_string_lossy().into_owned());
        vars.insert("workers", worker_count.to_string());
        vars.insert("partition", artifact.to_string_lossy().into_owned());
        vars.insert("configs_dir", configs_dir.to_string_lossy().into_owned());
        vars.insert("output_dir", paths.output_dir().to_string_lossy().into_owned());

        let mut command = self
            .generator
            .to_command(&vars)
            .ok_or(PartitionGenerationError::EmptyCommand)?;

        debug!(
            "Partition command: {}",
            display_argv(&self.generator.render(&vars))
        );

        let limit = self.wait_limit();
        let start = Instant::now();
        let mut child = command
            .current_dir(paths.output_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(PartitionGenerationError::Spawn)?;

        let status = match child
            .wait_timeout(limit)
            .map_err(PartitionGenerationError::Wait)?
        {
            Some(status) => status,
            None => {
                warn!(basin = %basin.id, "Partition generator ran into timeout, killing it");
                let _ = child.kill();
                let _ = child.wait();

                return Err(PartitionGenerationError::Timeout(limit));
            }
        };

        debug!(
            "Partition generator finished in {} ms | status: {status}",
            start.elapsed().as_millis()
        );

        if !status.success() {
            return Err(PartitionGenerationError::Failed(status));
        }

        if !artifact.is_file() {
            return Err(PartitionGenerationError::MissingArtifact(artifact));
        }

        Ok(artifact)
    }
}

/// an artifact is stale once the descriptor it was cut from is newer
fn is_fresh(artifact: &Path, descriptor: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|metadata| metadata.modified());

    match (modified(artifact), modified(descriptor)) {
        (Ok(artifact), Ok(descriptor)) => artifact >= descriptor,
        (Ok(_), Err(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basin(root: &Path, num_divides: u32) -> Basin {
        let input_dir = root.join("in").join("01");
        fs::create_dir_all(input_dir.join("data")).unwrap();
        let geopackage = input_dir.join("data").join("01.gpkg");
        fs::write(&geopackage, "").unwrap();

        Basin {
            id: "01".into(),
            num_divides,
            input_dir,
            geopackage,
        }
    }

    fn shell(script: &str) -> CommandTemplate {
        CommandTemplate::new(["sh", "-c", script])
    }

    #[test]
    fn scenarios() {
        assert_eq!(plan(5, 10, true), 5);
        assert_eq!(plan(5, 10, false), 5);
        assert_eq!(plan(200, 10, true), 20);
        assert_eq!(plan(15, 10, false), 10);
        assert_eq!(plan(25, 10, true), 2);
        assert_eq!(plan(1000, 4, true), MAX_WORKERS_PER_BASIN);
    }

    #[test]
    fn worker_count_bounds() {
        for catchments in 1..=300 {
            for budget in 1..=32 {
                for adaptive in [true, false] {
                    let workers = plan(catchments, budget, adaptive);

                    assert!(workers >= 1);
                    assert!(workers <= catchments);
                    if adaptive && catchments > budget {
                        assert!(workers <= MAX_WORKERS_PER_BASIN);
                    } else {
                        assert!(workers <= budget);
                    }
                }
            }
        }
    }

    #[test]
    fn single_worker_needs_no_partition() {
        let dir = tempfile::tempdir().unwrap();
        let basin = basin(dir.path(), 1);
        let paths = BasinPaths::new(dir.path().join("out"));
        // a generator that would fail if called
        let planner = PartitionPlanner::new(8, true, shell("exit 1"), Duration::from_secs(5));

        let plan = planner
            .plan_basin(&basin, &paths, &Placeholders::new())
            .unwrap();

        assert_eq!(plan.worker_count, 1);
        assert_eq!(plan.partition, None);

        let budget_one = PartitionPlanner::new(1, true, shell("exit 1"), Duration::from_secs(5));
        let basin = Basin {
            num_divides: 90,
            ..basin
        };
        assert_eq!(
            budget_one
                .plan_basin(&basin, &paths, &Placeholders::new())
                .unwrap()
                .worker_count,
            1
        );
    }

    #[test]
    fn generates_artifact_at_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let basin = basin(dir.path(), 40);
        let paths = BasinPaths::new(dir.path().join("out"));
        fs::create_dir_all(paths.output_dir()).unwrap();
        let planner = PartitionPlanner::new(
            10,
            false,
            shell("echo \"$0 $1\" > {partition}"),
            Duration::from_secs(5),
        );

        let plan = planner
            .plan_basin(&basin, &paths, &Placeholders::new())
            .unwrap();

        assert_eq!(plan.worker_count, 10);
        assert_eq!(plan.partition, Some(paths.partition(10)));
        assert!(paths.partition(10).is_file());
    }

    #[test]
    fn fresh_artifacts_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let basin = basin(dir.path(), 40);
        let paths = BasinPaths::new(dir.path().join("out"));
        fs::create_dir_all(paths.configs_dir()).unwrap();
        fs::write(paths.partition(10), "{}").unwrap();
        let planner = PartitionPlanner::new(10, false, shell("exit 3"), Duration::from_secs(5));

        let plan = planner
            .plan_basin(&basin, &paths, &Placeholders::new())
            .unwrap();

        assert_eq!(plan.partition, Some(paths.partition(10)));
    }

    #[test]
    fn generator_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let basin = basin(dir.path(), 40);
        let paths = BasinPaths::new(dir.path().join("out"));
        fs::create_dir_all(paths.output_dir()).unwrap();

        let failing = PartitionPlanner::new(10, false, shell("exit 3"), Duration::from_secs(5));
        assert!(matches!(
            failing.plan_basin(&basin, &paths, &Placeholders::new()),
            Err(PartitionGenerationError::Failed(_))
        ));

        let silent = PartitionPlanner::new(10, false, shell("true"), Duration::from_secs(5));
        assert!(matches!(
            silent.plan_basin(&basin, &paths, &Placeholders::new()),
            Err(PartitionGenerationError::MissingArtifact(_))
        ));

        let hanging =
            PartitionPlanner::new(10, false, shell("sleep 5"), Duration::from_millis(100));
        assert!(matches!(
            hanging.plan_basin(&basin, &paths, &Placeholders::new()),
            Err(PartitionGenerationError::Timeout(_))
        ));
    }

    #[test]
    fn generator_wait_ends_at_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let basin = basin(dir.path(), 40);
        let paths = BasinPaths::new(dir.path().join("out"));
        let planner = PartitionPlanner::new(10, false, shell("sleep 5"), Duration::from_secs(60))
            .until(Instant::now() + Duration::from_millis(200));
        let start = Instant::now();

        assert!(matches!(
            planner.plan_basin(&basin, &paths, &Placeholders::new()),
            Err(PartitionGenerationError::Timeout(limit)) if limit <= Duration::from_millis(200)
        ));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
