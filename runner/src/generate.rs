//! Config generation pass.
//!
//! The external generator runs for many basins side by side on a bounded thread pool, the
//! ledger and metadata are written afterwards on the calling thread only.

use crate::{
    command::{display_argv, CommandTemplate, Placeholders},
    config::SandboxConfig,
    layout::ExperimentLayout,
    meta::{ExperimentMeta, MetaError},
    registry::{Basin, Ledger, RegistryError},
    tracker::{IterationTracker, TrackerError},
};
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("tools.config_generator is not configured")]
    NotConfigured,
    #[error("Config generator is an empty command")]
    EmptyCommand,
    #[error("Failed to prepare {path:?}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
    #[error("Failed to spawn config generator: {0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to wait for config generator: {0}")]
    Wait(#[source] io::Error),
    #[error("Config generator did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Config generator failed with {0}")]
    Failed(ExitStatus),
    #[error("Failed to start generation pool: {0}")]
    Pool(#[from] ThreadPoolBuildError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Runs the external config generator for single basins
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    template: CommandTemplate,
    timeout: Duration,
    vars: Placeholders,
}

impl ConfigGenerator {
    pub fn new(template: CommandTemplate, timeout: Duration, vars: Placeholders) -> Self {
        Self {
            template,
            timeout,
            vars,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, GenerateError> {
        let template = config
            .tools
            .config_generator
            .clone()
            .ok_or(GenerateError::NotConfigured)?;

        Ok(Self::new(
            template,
            config.tools.generation_timeout,
            config.base_placeholders(),
        ))
    }

    /// generate the configs of one basin into its output directory
    pub fn generate(&self, basin: &Basin, layout: &ExperimentLayout) -> Result<(), GenerateError> {
        let paths = layout.basin(&basin.id);
        let output_dir = paths.output_dir();
        let log_path = paths.stage_log("generate");

        let prepare = |path: PathBuf| {
            move |source| GenerateError::Prepare {
                path: path.clone(),
                source,
            }
        };

        fs::create_dir_all(paths.configs_dir()).map_err(prepare(paths.configs_dir()))?;
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(prepare(parent.to_path_buf()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(prepare(log_path.clone()))?;
        let stderr = log.try_clone().map_err(prepare(log_path.clone()))?;

        let mut vars = self.vars.clone();
        vars.insert("basin_id", basin.id.clone());
        vars.insert("model", layout.model().unwrap_or_default().to_owned());
        vars.insert("input_dir", basin.input_dir.to_string_lossy().into_owned());
        vars.insert("output_dir", output_dir.to_string_lossy().into_owned());
        vars.insert("gpkg", basin.geopackage.to_string_lossy().into_owned());
        vars.insert("configs_dir", paths.configs_dir().to_string_lossy().into_owned());

        let mut command = self
            .template
            .to_command(&vars)
            .ok_or(GenerateError::EmptyCommand)?;

        debug!(
            basin = %basin.id,
            "Generator command: {}",
            display_argv(&self.template.render(&vars))
        );

        let start = Instant::now();
        let mut child = command
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(GenerateError::Spawn)?;

        let Some(status) = child.wait_timeout(self.timeout).map_err(GenerateError::Wait)? else {
            warn!(basin = %basin.id, "Config generator ran into timeout, killing it");
            let _ = child.kill();
            let _ = child.wait();

            return Err(GenerateError::Timeout(self.timeout));
        };

        debug!(
            basin = %basin.id,
            "Generated configs in {} ms | status: {status}",
            start.elapsed().as_millis()
        );

        if status.success() {
            Ok(())
        } else {
            Err(GenerateError::Failed(status))
        }
    }
}

/// Outcome of one generation pass over an output tree
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub model: Option<String>,
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl GenerationReport {
    pub fn log_summary(&self) {
        let seconds = self.elapsed.as_secs_f64();

        info!(
            "Config generation{} finished in {seconds:.1} s ({:.2} min)",
            self.model
                .as_deref()
                .map(|model| format!(" for {model}"))
                .unwrap_or_default(),
            seconds / 60.0
        );
        info!("Total basins: {}", self.total);
        info!("Succeeded: {}", self.succeeded.len());
        if self.failed.is_empty() {
            info!("Failed: 0");
        } else {
            warn!("Failed: {} ({})", self.failed.len(), self.failed.join(", "));
        }
    }
}

/// Generate configs for `basins` with at most `concurrency` generators at a time.
///
/// A failing basin is logged and left out of the ledger, the others are unaffected
#[instrument(skip_all, fields(model = layout.model().unwrap_or("-")), level = "info")]
pub fn generate_all(
    generator: &ConfigGenerator,
    basins: &[&Basin],
    layout: &ExperimentLayout,
    ledger: &Ledger,
    concurrency: usize,
) -> Result<GenerationReport, GenerateError> {
    let start = Instant::now();

    debug!("Starting generation pool with {concurrency} threads");
    let pool = ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .thread_name(|index| format!("generate-{index}"))
        .build()?;

    let results: Vec<(&Basin, Result<(), GenerateError>)> = pool.install(|| {
        basins
            .par_iter()
            .map(|basin| (*basin, generator.generate(basin, layout)))
            .collect()
    });

    let mut report = GenerationReport {
        model: layout.model().map(str::to_owned),
        total: basins.len(),
        ..Default::default()
    };
    let mut entries = Vec::new();

    for (basin, result) in results {
        match result.and_then(|()| write_meta(basin, layout)) {
            Ok(()) => {
                entries.push((basin.id.clone(), basin.num_divides));
                report.succeeded.push(basin.id.clone());
            }
            Err(error) => {
                error!(basin = %basin.id, error = ?error, "Config generation failed: {error}");
                report.failed.push(basin.id.clone());
            }
        }
    }

    ledger.record_passed(&entries)?;
    report.elapsed = start.elapsed();

    Ok(report)
}

fn write_meta(basin: &Basin, layout: &ExperimentLayout) -> Result<(), GenerateError> {
    let output_dir = layout.basin(&basin.id).output_dir().to_path_buf();
    let meta = ExperimentMeta {
        basin_id: basin.id.clone(),
        input_dir: basin.input_dir.clone(),
        cwd: output_dir.clone(),
        output_dir,
        num_cpus: None,
    };
    meta.write_once(&layout.meta_path(&basin.id))?;

    Ok(())
}

/// Basins of a tree that still need configs: not in the ledger and never iterated
pub fn pending<'b>(
    basins: &'b [Basin],
    tracker: &IterationTracker<'_>,
    ledger: &Ledger,
) -> Result<Vec<&'b Basin>, GenerateError> {
    let passed = ledger.load_passed()?;
    let mut pending = Vec::new();

    for basin in basins
        .iter()
        .filter(|basin| tracker.layout().includes(&basin.id) && !passed.contains(&basin.id))
    {
        let paths = tracker.basin_paths(&basin.id)?;
        match crate::tracker::current_iteration(paths.output_dir(), &basin.id) {
            Ok((0, _)) => pending.push(basin),
            Ok((current, _)) => {
                debug!(basin = %basin.id, current, "Basin already iterated, not regenerating");
            }
            Err(error) => {
                warn!(basin = %basin.id, error = ?error, "Failed to read progress, skipping generation");
            }
        }
    }

    Ok(pending)
}

/// Generation pass over every output tree of the config
pub fn generate_pending(
    config: &SandboxConfig,
    layouts: &[ExperimentLayout],
    basins: &[Basin],
) -> Result<Vec<GenerationReport>, GenerateError> {
    let generator = ConfigGenerator::from_config(config)?;
    let mut reports = Vec::with_capacity(layouts.len());

    for layout in layouts {
        let ledger = Ledger::new(layout.ledger_path());
        let tracker = IterationTracker::new(layout);
        let pending = pending(basins, &tracker, &ledger)?;

        if pending.is_empty() {
            info!(
                model = layout.model().unwrap_or("-"),
                "All basins already have configs"
            );
            continue;
        }

        let report = generate_all(&generator, &pending, layout, &ledger, config.concurrency())?;
        report.log_summary();
        reports.push(report);
    }

    Ok(reports)
}
