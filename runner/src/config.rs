use crate::command::{CommandTemplate, Placeholders};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// Resolve a program the way a shell would: paths are checked directly, bare names are
/// searched on `PATH`
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);

    if candidate.components().count() > 1 {
        return matches!(check_executable(candidate), Ok(true)).then(|| candidate.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|path| matches!(check_executable(path), Ok(true)))
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}: {source}")]
    ReadConfig { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Required directory {0:?} does not exist")]
    MissingDirectory(PathBuf),
    #[error("Required executable {name} ({program}) could not be found")]
    MissingExecutable { name: String, program: String },
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Pipeline phase selected on the command line, decides which tools must be present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generate,
    Run,
    All,
    Status,
    Clean,
}

impl Phase {
    pub fn generates(&self) -> bool {
        matches!(self, Self::Generate | Self::All)
    }

    pub fn dispatches(&self) -> bool {
        matches!(self, Self::Run | Self::All)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    pub general: GeneralConfig,
    pub formulation: FormulationConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    // dispatch mode, local child processes or batch queue submissions
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub sandbox_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct FormulationConfig {
    pub ngen_dir: PathBuf,
    #[serde(default)]
    pub models: Vec<String>,
    // named groups of formulations, referenced by `mapping`
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    // gage id -> formulation groups, an empty mapping runs every model for every gage
    #[serde(default)]
    pub mapping: BTreeMap<String, Vec<String>>,
    // processor budget per basin
    #[serde(default = "default_np_per_basin")]
    pub np_per_basin: u32,
    #[serde(default = "default_true")]
    pub np_per_basin_adaptive: bool,
    // concurrency budget, 0 falls back to the number of cpus
    #[serde(default = "default_basins_in_par")]
    pub basins_in_par: usize,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Control,
    Calibration,
    Validation,
    Calibvalid,
    Restart,
}

impl TaskType {
    pub fn calibrates(&self) -> bool {
        matches!(self, Self::Calibration | Self::Calibvalid | Self::Restart)
    }

    pub fn validates(&self) -> bool {
        matches!(self, Self::Validation | Self::Calibvalid)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default, deserialize_with = "one_or_many")]
    pub gage_ids: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ExecutorConfig {
    #[default]
    Local,
    Slurm {
        script: PathBuf,
        #[serde(default = "default_sbatch")]
        sbatch: String,
        #[serde(default)]
        extra_args: Vec<String>,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ResubmitConfig {
    // re-exec the current binary with the same arguments
    #[default]
    Exec,
    Sbatch {
        script: PathBuf,
        #[serde(default = "default_sbatch")]
        sbatch: String,
    },
    Never,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default = "default_exp_info_dir")]
    pub exp_info_dir: PathBuf,
    #[serde(default = "default_wallclock", with = "duration")]
    pub wallclock: Duration,
    #[serde(default = "default_buffer", with = "duration")]
    pub buffer: Duration,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_grace_period", with = "duration")]
    pub grace_period: Duration,
    #[serde(default)]
    pub resubmit: ResubmitConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            exp_info_dir: default_exp_info_dir(),
            wallclock: default_wallclock(),
            buffer: default_buffer(),
            poll_interval: default_poll_interval(),
            grace_period: default_grace_period(),
            resubmit: ResubmitConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_mpirun")]
    pub mpirun: String,
    // external config generation, required for the generate phase
    #[serde(default)]
    pub config_generator: Option<CommandTemplate>,
    #[serde(default = "default_partitioner")]
    pub partitioner: CommandTemplate,
    #[serde(default = "default_calibration")]
    pub calibration: CommandTemplate,
    #[serde(default = "default_validation")]
    pub validation: CommandTemplate,
    #[serde(default = "default_partition_timeout", with = "duration")]
    pub partition_timeout: Duration,
    #[serde(default = "default_generation_timeout", with = "duration")]
    pub generation_timeout: Duration,
    #[serde(default = "default_submission_timeout", with = "duration")]
    pub submission_timeout: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            mpirun: default_mpirun(),
            config_generator: None,
            partitioner: default_partitioner(),
            calibration: default_calibration(),
            validation: default_validation(),
            partition_timeout: default_partition_timeout(),
            generation_timeout: default_generation_timeout(),
            submission_timeout: default_submission_timeout(),
        }
    }
}

impl SandboxConfig {
    /// read and parse a config file, relative paths are resolved against its directory
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = std::path::absolute(&base).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, &base)
    }

    /// parse a config document, `base` must be absolute
    pub fn parse(content: &str, base: &Path) -> Result<Self, ConfigErrors> {
        let mut config: Self = serde_yaml::from_str(content)?;

        config.resolve_paths(base);
        debug!(config = ?config, "Loaded config");

        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.general.input_dir);
        resolve(&mut self.general.output_dir);
        resolve(&mut self.formulation.ngen_dir);
        if let Some(sandbox_dir) = self.general.sandbox_dir.as_mut() {
            resolve(sandbox_dir);
        }
        match &mut self.executor {
            ExecutorConfig::Slurm { script, .. } => resolve(script),
            ExecutorConfig::Local => {}
        }
        if let ResubmitConfig::Sbatch { script, .. } = &mut self.launcher.resubmit {
            resolve(script);
        }
    }

    /// Every formulation with its own output tree, `models` first, then the ones only
    /// named in `groups`
    pub fn all_models(&self) -> Vec<&str> {
        let formulation = &self.formulation;

        formulation
            .models
            .iter()
            .chain(formulation.groups.values().flatten())
            .map(String::as_str)
            .unique()
            .collect()
    }

    /// Gages mapped to `model`, `None` if the model runs for every gage
    pub fn gages_for(&self, model: &str) -> Option<BTreeSet<String>> {
        let formulation = &self.formulation;

        if formulation.mapping.is_empty() {
            return None;
        }

        Some(
            formulation
                .mapping
                .iter()
                .filter(|(_, groups)| {
                    groups.iter().any(|group| {
                        formulation
                            .groups
                            .get(group)
                            .is_some_and(|models| models.iter().any(|name| name == model))
                    })
                })
                .map(|(gage, _)| gage.clone())
                .collect(),
        )
    }

    /// path of the simulation executable
    pub fn simulation_exe(&self) -> PathBuf {
        self.formulation.ngen_dir.join("cmake_build").join("ngen")
    }

    /// concurrency budget for basins running side by side
    pub fn concurrency(&self) -> usize {
        match self.formulation.basins_in_par {
            0 => num_cpus::get(),
            number => number,
        }
    }

    /// placeholders that do not depend on a basin
    pub fn base_placeholders(&self) -> Placeholders {
        let mut vars = Placeholders::new();

        vars.insert("python", self.tools.python.clone());
        vars.insert("mpirun", self.tools.mpirun.clone());
        vars.insert("ngen_dir", self.formulation.ngen_dir.to_string_lossy().into_owned());
        if let Some(sandbox_dir) = &self.general.sandbox_dir {
            vars.insert("sandbox_dir", sandbox_dir.to_string_lossy().into_owned());
        }

        vars
    }

    /// the commands a phase is going to launch, (name, template)
    fn required_templates(&self, phase: Phase) -> Vec<(&'static str, &CommandTemplate)> {
        let mut templates = Vec::new();
        let task = self.simulation.task_type;

        if phase.generates() {
            if let Some(generator) = &self.tools.config_generator {
                templates.push(("tools.config_generator", generator));
            }
        }

        if phase.dispatches() {
            if self.formulation.np_per_basin > 1 {
                templates.push(("tools.partitioner", &self.tools.partitioner));
            }
            if task.calibrates() {
                templates.push(("tools.calibration", &self.tools.calibration));
            }
            if task.validates() {
                templates.push(("tools.validation", &self.tools.validation));
            }
        }

        templates
    }

    /// Check everything that can be checked before touching any basin.
    ///
    /// All problems are reported instead of stopping at the first one, this makes fixing a
    /// config a single round trip for users
    pub fn preflight_checks(&self, phase: Phase) -> Result<(), Vec<ConfigErrors>> {
        let mut errors = Vec::new();

        if matches!(phase, Phase::Clean) {
            return Ok(());
        }

        if !self.general.input_dir.is_dir() {
            error!(
                "general.input_dir does not exist or is not a directory: {}",
                self.general.input_dir.to_string_lossy()
            );
            errors.push(ConfigErrors::MissingDirectory(self.general.input_dir.clone()));
        }

        if let Some(sandbox_dir) = &self.general.sandbox_dir {
            if !sandbox_dir.is_dir() {
                error!(
                    "general.sandbox_dir does not exist: {}",
                    sandbox_dir.to_string_lossy()
                );
                errors.push(ConfigErrors::MissingDirectory(sandbox_dir.clone()));
            }
        }

        for (gage, groups) in &self.formulation.mapping {
            for group in groups {
                if !self.formulation.groups.contains_key(group) {
                    error!("formulation.mapping of {gage} names unknown group {group}");
                    errors.push(ConfigErrors::InvalidValue {
                        field: format!("formulation.mapping.{gage}"),
                        reason: format!("unknown formulation group `{group}`"),
                    });
                }
            }
        }

        if phase.generates() && self.tools.config_generator.is_none() {
            error!("tools.config_generator must be defined to generate configs");
            errors.push(ConfigErrors::InvalidValue {
                field: "tools.config_generator".into(),
                reason: "not defined".into(),
            });
        }

        let vars = self.base_placeholders();

        for (name, template) in self.required_templates(phase) {
            if template.is_empty() {
                error!("{name} is an empty command");
                errors.push(ConfigErrors::InvalidValue {
                    field: name.into(),
                    reason: "empty command".into(),
                });
                continue;
            }

            if template.references("sandbox_dir") && self.general.sandbox_dir.is_none() {
                error!("{name} references {{sandbox_dir}} but general.sandbox_dir is not set");
                errors.push(ConfigErrors::InvalidValue {
                    field: name.into(),
                    reason: "references {sandbox_dir} which is not set".into(),
                });
                continue;
            }

            let program = template.render(&vars).swap_remove(0);
            if resolve_program(&program).is_none() {
                error!("{name} program {program} is not an executable file or not on PATH");
                errors.push(ConfigErrors::MissingExecutable {
                    name: name.into(),
                    program,
                });
            }
        }

        if phase.dispatches() {
            if !self.simulation.task_type.calibrates() && !self.simulation.task_type.validates() {
                let exe = self.simulation_exe();
                if !matches!(check_executable(&exe), Ok(true)) {
                    error!(
                        "Simulation executable {} is missing or not executable",
                        exe.to_string_lossy()
                    );
                    errors.push(ConfigErrors::MissingExecutable {
                        name: "simulation".into(),
                        program: exe.to_string_lossy().into_owned(),
                    });
                }

                if self.formulation.np_per_basin > 1 && resolve_program(&self.tools.mpirun).is_none()
                {
                    error!("tools.mpirun ({}) could not be found", self.tools.mpirun);
                    errors.push(ConfigErrors::MissingExecutable {
                        name: "tools.mpirun".into(),
                        program: self.tools.mpirun.clone(),
                    });
                }
            }

            if let ExecutorConfig::Slurm { script, sbatch, .. } = &self.executor {
                check_submission(&mut errors, "executor", sbatch, script);
            }

            if let ResubmitConfig::Sbatch { script, sbatch } = &self.launcher.resubmit {
                check_submission(&mut errors, "launcher.resubmit", sbatch, script);
            }

            if self.launcher.wallclock <= self.launcher.buffer {
                error!("launcher.wallclock must be larger than launcher.buffer");
                errors.push(ConfigErrors::InvalidValue {
                    field: "launcher.wallclock".into(),
                    reason: "not larger than launcher.buffer".into(),
                });
            }

            if self.launcher.poll_interval.is_zero() {
                error!("launcher.poll_interval cannot be 0");
                errors.push(ConfigErrors::InvalidValue {
                    field: "launcher.poll_interval".into(),
                    reason: "zero".into(),
                });
            }
        }

        if self.formulation.np_per_basin == 0 {
            warn!("formulation.np_per_basin is 0, treating it as 1");
        }

        let duplicates = self
            .all_models()
            .into_iter()
            .map(crate::layout::model_dir_name)
            .duplicates()
            .collect_vec();
        for duplicate in duplicates {
            error!("Multiple formulation.models map onto the same output directory {duplicate}");
            errors.push(ConfigErrors::InvalidValue {
                field: "formulation.models".into(),
                reason: format!("duplicate output directory {duplicate}"),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_submission(errors: &mut Vec<ConfigErrors>, section: &str, sbatch: &str, script: &Path) {
    if resolve_program(sbatch).is_none() {
        error!("{section}.sbatch ({sbatch}) could not be found");
        errors.push(ConfigErrors::MissingExecutable {
            name: format!("{section}.sbatch"),
            program: sbatch.to_owned(),
        });
    }

    if !script.is_file() {
        error!(
            "{section}.script does not exist: {}",
            script.to_string_lossy()
        );
        errors.push(ConfigErrors::FileNotFound(script.to_path_buf()));
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Nothing(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
        OneOrMany::Nothing(()) => Vec::new(),
    })
}

/// durations as humantime strings ("8h", "2m 30s") or integer seconds
mod duration {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            Raw::Text(text) => humantime::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_np_per_basin() -> u32 {
    1
}

fn default_basins_in_par() -> usize {
    1
}

fn default_sbatch() -> String {
    "sbatch".into()
}

fn default_exp_info_dir() -> PathBuf {
    PathBuf::from("exp_info")
}

fn default_wallclock() -> Duration {
    Duration::from_secs(8 * 60 * 60)
}

fn default_buffer() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_python() -> String {
    "python".into()
}

fn default_mpirun() -> String {
    "mpirun".into()
}

fn default_partitioner() -> CommandTemplate {
    CommandTemplate::new([
        "{ngen_dir}/cmake_build/partitionGenerator",
        "{gpkg}",
        "{gpkg}",
        "{partition}",
        "{workers}",
        "",
        "",
    ])
}

fn default_calibration() -> CommandTemplate {
    CommandTemplate::new(["{python}", "-m", "ngen.cal", "{config}"])
}

fn default_validation() -> CommandTemplate {
    CommandTemplate::new(["{python}", "{sandbox_dir}/src/python/validation.py", "{config}"])
}

fn default_partition_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_generation_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_submission_timeout() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
