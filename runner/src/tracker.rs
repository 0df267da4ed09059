//! Calibration progress derived purely from on-disk artifacts.
//!
//! Nothing in here looks at processes, so answers stay valid across orchestrator restarts.

use crate::{
    layout::{
        BasinPaths, ExperimentLayout, CHECKPOINT_FILE, VALIDATION_DIR, VALIDATION_FILE,
        WORKER_SUFFIX,
    },
    meta::{ExperimentMeta, MetaError},
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

static CHECKPOINT_GLOB: Lazy<GlobMatcher> =
    Lazy::new(|| worker_glob(&format!("*{WORKER_SUFFIX}/{CHECKPOINT_FILE}")));

static VALIDATION_GLOB: Lazy<GlobMatcher> = Lazy::new(|| {
    worker_glob(&format!(
        "*{WORKER_SUFFIX}/{VALIDATION_DIR}/{VALIDATION_FILE}"
    ))
});

fn worker_glob(pattern: &str) -> GlobMatcher {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .expect("static worker glob is valid")
        .compile_matcher()
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("Failed to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse calibration config {path:?}: {source}")]
    CalibrationConfig {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Malformed checkpoint {path:?}, first value is `{value}`")]
    MalformedCheckpoint { path: PathBuf, value: String },
}

/// current iteration against the configured maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub current: u32,
    pub max: u32,
}

impl Progress {
    pub fn new(current: u32, max: u32) -> Self {
        Self { current, max }
    }

    pub fn reached_max(&self) -> bool {
        self.current >= self.max
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationCheckpoint {
    pub basin_id: String,
    pub progress: Progress,
    pub artifact: Option<PathBuf>,
}

/// First value of a checkpoint artifact, the last completed iteration.
///
/// `Ok(None)` for an empty artifact, `Err` carries the offending value
pub fn parse_checkpoint(content: &str) -> Result<Option<u32>, String> {
    let Some(first) = content
        .split(|c: char| c == ',' || c.is_whitespace())
        .find(|token| !token.is_empty())
    else {
        return Ok(None);
    };

    if let Ok(value) = first.parse::<u32>() {
        return Ok(Some(value));
    }

    // pandas style writers emit integral floats
    match first.parse::<f64>() {
        Ok(value)
            if value.is_finite()
                && value >= 0.0
                && value.fract() == 0.0
                && value <= f64::from(u32::MAX) =>
        {
            Ok(Some(value as u32))
        }
        _ => Err(first.to_owned()),
    }
}

/// first file below `root` matching `glob` (relative to `root`), in name order
fn find_artifact(root: &Path, glob: &GlobMatcher) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }

    WalkBuilder::new(root)
        .standard_filters(false)
        .max_depth(Some(3))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(Result::ok)
        .find(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|relative| glob.is_match(relative))
                .unwrap_or(false)
                && entry.path().is_file()
        })
        .map(|entry| entry.into_path())
}

#[derive(Debug)]
pub struct IterationTracker<'a> {
    layout: &'a ExperimentLayout,
    // only present calibration configs are cached, a missing one may still be generated
    max_iterations: Mutex<BTreeMap<String, u32>>,
}

impl<'a> IterationTracker<'a> {
    pub fn new(layout: &'a ExperimentLayout) -> Self {
        Self {
            layout,
            max_iterations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn layout(&self) -> &ExperimentLayout {
        self.layout
    }

    pub fn meta(&self, basin_id: &str) -> Result<Option<ExperimentMeta>, TrackerError> {
        Ok(ExperimentMeta::load(&self.layout.meta_path(basin_id))?)
    }

    /// paths of a basin, honouring the output directory recorded in its metadata
    pub fn basin_paths(&self, basin_id: &str) -> Result<BasinPaths, TrackerError> {
        Ok(match self.meta(basin_id)? {
            Some(meta) => BasinPaths::new(meta.output_dir),
            None => self.layout.basin(basin_id),
        })
    }

    pub fn progress(&self, basin_id: &str) -> Result<IterationCheckpoint, TrackerError> {
        let paths = self.basin_paths(basin_id)?;
        let max = self.max_iteration(basin_id, &paths)?;
        let (current, artifact) = current_iteration(paths.output_dir(), basin_id)?;

        Ok(IterationCheckpoint {
            basin_id: basin_id.to_owned(),
            progress: Progress::new(current, max),
            artifact,
        })
    }

    /// true once a validation output exists below the basin's output tree
    pub fn has_validation(&self, basin_id: &str) -> Result<bool, TrackerError> {
        let paths = self.basin_paths(basin_id)?;
        let found = find_artifact(paths.output_dir(), &VALIDATION_GLOB);

        if let Some(path) = &found {
            debug!(basin = %basin_id, path = ?path, "Validation output found");
        }

        Ok(found.is_some())
    }

    /// configured iteration count, 0 when no calibration is configured
    pub fn max_iteration(&self, basin_id: &str, paths: &BasinPaths) -> Result<u32, TrackerError> {
        if let Some(max) = self.max_iterations.lock().get(basin_id) {
            return Ok(*max);
        }

        let path = paths.calib_config();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(TrackerError::Io { path, source }),
        };

        let document: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|source| TrackerError::CalibrationConfig {
                path: path.clone(),
                source,
            })?;

        let max = match document
            .get("general")
            .and_then(|general| general.get("iterations"))
            .and_then(serde_yaml::Value::as_u64)
        {
            Some(iterations) => u32::try_from(iterations).unwrap_or(u32::MAX),
            None => {
                warn!(basin = %basin_id, path = ?path, "Calibration config has no general.iterations, assuming 0");
                0
            }
        };

        self.max_iterations.lock().insert(basin_id.to_owned(), max);

        Ok(max)
    }
}

/// Resume point of a basin, last completed iteration + 1, 0 without a checkpoint
pub fn current_iteration(
    output_dir: &Path,
    basin_id: &str,
) -> Result<(u32, Option<PathBuf>), TrackerError> {
    let Some(path) = find_artifact(output_dir, &CHECKPOINT_GLOB) else {
        info!(basin = %basin_id, "No {CHECKPOINT_FILE} found, assuming iteration 0");
        return Ok((0, None));
    };

    let content = fs::read_to_string(&path).map_err(|source| TrackerError::Io {
        path: path.clone(),
        source,
    })?;

    match parse_checkpoint(&content) {
        Ok(Some(last_completed)) => Ok((last_completed.saturating_add(1), Some(path))),
        Ok(None) => {
            debug!(basin = %basin_id, path = ?path, "Checkpoint is empty, assuming iteration 0");
            Ok((0, None))
        }
        Err(value) => Err(TrackerError::MalformedCheckpoint { path, value }),
    }
}

#[cfg(test)]
mod tracker_test;
