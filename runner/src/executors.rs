mod local;
mod slurm;

pub use local::{LocalExecutor, LocalJob};
pub use slurm::{run_sbatch, SlurmExecutor, SubmissionId};

use crate::{
    command::{display_argv, CommandTemplate, Placeholders},
    config::{resolve_program, ExecutorConfig, SandboxConfig, TaskType},
    layout::{BasinPaths, ExperimentLayout},
    partition::PartitionPlan,
    registry::Basin,
    tracker::Progress,
};
use globset::{Glob, GlobMatcher};
use once_cell::sync::Lazy;
use serde_yaml::{Mapping, Value};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

static REALIZATION_GLOB: Lazy<GlobMatcher> = Lazy::new(|| {
    Glob::new("realization_*.json")
        .expect("static realization glob is valid")
        .compile_matcher()
});

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Required configuration {0:?} has not been generated")]
    MissingConfig(PathBuf),
    #[error("No realization document found in {0:?}")]
    MissingRealization(PathBuf),
    #[error("Expected exactly one realization document in {dir:?}, found {found}")]
    AmbiguousRealization { dir: PathBuf, found: usize },
    #[error("Basin {0} runs on multiple workers but has no partition")]
    MissingPartition(String),
    #[error("Failed to derive restart configuration {path:?}: {reason}")]
    RestartDerivation { path: PathBuf, reason: String },
    #[error("Failed to access {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0} is an empty command")]
    EmptyCommand(&'static str),
    #[error("Failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Submission failed with {status}: {stderr}")]
    Submit { status: ExitStatus, stderr: String },
    #[error("Submission did not finish within {0:?}")]
    SubmissionTimeout(Duration),
    #[error("Could not parse a submission id from `{0}`")]
    SubmissionId(String),
}

/// Pipeline stage of one basin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Run,
    Calibrate,
    Validate,
    Restart,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Calibrate => "calibrate",
            Self::Validate => "validate",
            Self::Restart => "restart",
        }
    }

    /// Stage a basin has to go through next, `None` once it has nothing left to do.
    ///
    /// Calibration resumes with `Restart` as soon as any iteration was completed and an
    /// existing validation output always ends the work of a basin.
    pub fn select(task: TaskType, progress: Progress, validated: bool) -> Option<Stage> {
        if validated {
            return None;
        }

        let calibration = || {
            if progress.reached_max() {
                None
            } else if progress.current == 0 {
                Some(Stage::Calibrate)
            } else {
                Some(Stage::Restart)
            }
        };

        match task {
            TaskType::Control => Some(Stage::Run),
            TaskType::Calibration | TaskType::Restart => calibration(),
            TaskType::Calibvalid => calibration().or(Some(Stage::Validate)),
            TaskType::Validation => Some(Stage::Validate),
        }
    }

    /// true while a basin still has work in a fresh invocation, plain runs happen once
    pub fn needs_work(task: TaskType, progress: Progress, validated: bool) -> bool {
        task != TaskType::Control && Self::select(task, progress, validated).is_some()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one stage of one basin
#[derive(Debug)]
pub struct DispatchRequest<'a> {
    pub basin: &'a Basin,
    pub layout: &'a ExperimentLayout,
    pub paths: &'a BasinPaths,
    pub stage: Stage,
    pub plan: &'a PartitionPlan,
    // recorded in the experiment metadata, overrides the worker count for queue submissions
    pub num_cpus: Option<u32>,
}

/// A fully resolved external command, every path in it is absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub stage: Stage,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub log: PathBuf,
}

impl StageCommand {
    pub fn build(
        config: &SandboxConfig,
        request: &DispatchRequest<'_>,
    ) -> Result<Self, ExecutorError> {
        let DispatchRequest {
            basin,
            layout,
            paths,
            stage,
            plan,
            ..
        } = request;

        let partition = match (&plan.partition, plan.worker_count) {
            (Some(partition), _) => Some(partition.to_string_lossy().into_owned()),
            (None, 1) => None,
            (None, _) => return Err(ExecutorError::MissingPartition(basin.id.clone())),
        };

        let mut vars = config.base_placeholders();
        vars.insert("basin_id", basin.id.clone());
        vars.insert("model", layout.model().unwrap_or_default().to_owned());
        vars.insert("input_dir", basin.input_dir.to_string_lossy().into_owned());
        vars.insert("output_dir", paths.output_dir().to_string_lossy().into_owned());
        vars.insert("gpkg", basin.geopackage.to_string_lossy().into_owned());
        vars.insert("workers", plan.worker_count.to_string());
        vars.insert("partition", partition.clone().unwrap_or_default());
        vars.insert("configs_dir", paths.configs_dir().to_string_lossy().into_owned());
        vars.insert("stage", stage.to_string());

        let (config_file, argv) = match stage {
            Stage::Run => {
                let realization = find_realization(&paths.realization_dir())?;
                let realization = realization.to_string_lossy().into_owned();
                let argv = simulation_argv(
                    config,
                    basin,
                    plan.worker_count,
                    &realization,
                    partition.as_deref(),
                );

                (realization, argv)
            }
            Stage::Calibrate => {
                let config_file = require(paths.calib_config())?;
                let argv = render(&config.tools.calibration, "tools.calibration", &vars, &config_file)?;

                (config_file, argv)
            }
            Stage::Restart => {
                let config_file = restart_config(paths)?;
                let argv = render(&config.tools.calibration, "tools.calibration", &vars, &config_file)?;

                (config_file, argv)
            }
            Stage::Validate => {
                let config_file = require(paths.validation_config())?;
                let argv = render(&config.tools.validation, "tools.validation", &vars, &config_file)?;

                (config_file, argv)
            }
        };

        let mut env = vec![
            ("BASIN_ID".to_owned(), basin.id.clone()),
            ("STAGE".to_owned(), stage.to_string()),
            ("CONFIG_FILE".to_owned(), config_file),
            ("NUM_WORKERS".to_owned(), plan.worker_count.to_string()),
            ("PARTITION_FILE".to_owned(), partition.unwrap_or_default()),
            ("OUTPUT_DIR".to_owned(), paths.output_dir().to_string_lossy().into_owned()),
        ];

        if cfg!(target_os = "macos") {
            let python = resolve_program(&config.tools.python)
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_else(|| config.tools.python.clone());
            env.push(("PYTHONEXECUTABLE".to_owned(), python));
        }

        Ok(Self {
            stage: *stage,
            argv,
            env,
            cwd: paths.output_dir().to_path_buf(),
            log: paths.stage_log(stage.as_str()),
        })
    }
}

fn require(path: PathBuf) -> Result<String, ExecutorError> {
    if path.is_file() {
        Ok(path.to_string_lossy().into_owned())
    } else {
        Err(ExecutorError::MissingConfig(path))
    }
}

fn render(
    template: &CommandTemplate,
    name: &'static str,
    vars: &Placeholders,
    config_file: &str,
) -> Result<Vec<String>, ExecutorError> {
    if template.is_empty() {
        return Err(ExecutorError::EmptyCommand(name));
    }

    let mut vars = vars.clone();
    vars.insert("config", config_file.to_owned());

    Ok(template.render(&vars))
}

fn simulation_argv(
    config: &SandboxConfig,
    basin: &Basin,
    worker_count: u32,
    realization: &str,
    partition: Option<&str>,
) -> Vec<String> {
    let gpkg = basin.geopackage.to_string_lossy().into_owned();
    let mut argv = Vec::new();

    if worker_count > 1 {
        argv.extend([config.tools.mpirun.clone(), "-np".into(), worker_count.to_string()]);
    }

    argv.extend([
        config.simulation_exe().to_string_lossy().into_owned(),
        gpkg.clone(),
        "all".into(),
        gpkg,
        "all".into(),
        realization.to_owned(),
    ]);

    if let Some(partition) = partition {
        argv.push(partition.to_owned());
    }

    argv
}

/// the single `realization_*.json` of a basin
fn find_realization(dir: &Path) -> Result<PathBuf, ExecutorError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(ExecutorError::MissingRealization(dir.to_path_buf()))
        }
        Err(source) => {
            return Err(ExecutorError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|name| REALIZATION_GLOB.is_match(name))
                    .unwrap_or(false)
        })
        .collect();

    match found.len() {
        0 => Err(ExecutorError::MissingRealization(dir.to_path_buf())),
        1 => Ok(found.swap_remove(0)),
        count => Err(ExecutorError::AmbiguousRealization {
            dir: dir.to_path_buf(),
            found: count,
        }),
    }
}

/// Restart configuration of a basin, derived from the calibration config when missing
fn restart_config(paths: &BasinPaths) -> Result<String, ExecutorError> {
    let restart = paths.restart_config();
    if restart.is_file() {
        return Ok(restart.to_string_lossy().into_owned());
    }

    let source = paths.calib_config();
    let content = match fs::read_to_string(&source) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(ExecutorError::MissingConfig(source))
        }
        Err(error) => {
            return Err(ExecutorError::Io {
                path: source,
                source: error,
            })
        }
    };

    let derivation_error = |reason: String| ExecutorError::RestartDerivation {
        path: restart.clone(),
        reason,
    };

    let mut document: Value =
        serde_yaml::from_str(&content).map_err(|error| derivation_error(error.to_string()))?;
    let root = document
        .as_mapping_mut()
        .ok_or_else(|| derivation_error("calibration config is not a mapping".into()))?;

    let general_key = Value::String("general".into());
    if !root.contains_key(&general_key) {
        root.insert(general_key.clone(), Value::Mapping(Mapping::new()));
    }
    root.get_mut(&general_key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| derivation_error("`general` is not a mapping".into()))?
        .insert(Value::String("restart".into()), Value::Bool(true));

    let content =
        serde_yaml::to_string(&document).map_err(|error| derivation_error(error.to_string()))?;
    let io_error = |source| ExecutorError::Io {
        path: restart.clone(),
        source,
    };
    let staging = restart.with_extension("yaml.partial");
    fs::write(&staging, content).map_err(io_error)?;
    fs::rename(&staging, &restart).map_err(io_error)?;

    info!(path = ?restart, "Derived restart configuration");

    Ok(restart.to_string_lossy().into_owned())
}

/// Handle of a dispatched job, queue submissions are fire and forget
#[derive(Debug)]
pub enum JobHandle {
    Local(LocalJob),
    Queued(SubmissionId),
}

/// Dispatch mode, never mixed within one run
#[derive(Debug, Clone)]
pub enum Executors {
    Local(LocalExecutor),
    Slurm(SlurmExecutor),
}

impl Executors {
    pub fn load(config: &SandboxConfig) -> Self {
        match &config.executor {
            ExecutorConfig::Local => Self::Local(LocalExecutor::load()),
            ExecutorConfig::Slurm {
                script,
                sbatch,
                extra_args,
            } => Self::Slurm(SlurmExecutor::load(
                sbatch.clone(),
                script.clone(),
                extra_args.clone(),
                config.tools.submission_timeout,
            )),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Slurm(_))
    }
}

/// Builds the external command of a basin's stage and hands it to the configured executor
#[derive(Debug)]
pub struct JobDispatcher<'a> {
    config: &'a SandboxConfig,
    executor: Executors,
}

impl<'a> JobDispatcher<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self {
            config,
            executor: Executors::load(config),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.executor.is_queued()
    }

    #[instrument(skip_all, fields(basin = %request.basin.id, stage = %request.stage), level = "info")]
    pub fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<JobHandle, ExecutorError> {
        let command = StageCommand::build(self.config, request)?;

        debug!("Stage command: {}", display_argv(&command.argv));

        match &self.executor {
            Executors::Local(executor) => executor.spawn(&command).map(JobHandle::Local),
            Executors::Slurm(executor) => {
                let job_name = match request.layout.model_dir() {
                    Some(model_dir) => format!("{model_dir}_{}", request.basin.id),
                    None => request.basin.id.clone(),
                };
                let cpus = request.num_cpus.unwrap_or(request.plan.worker_count);

                executor
                    .submit(&command, &job_name, cpus)
                    .map(JobHandle::Queued)
            }
        }
    }
}
