use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Failed to access experiment metadata {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse experiment metadata {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Paths of one basin's experiment, written once at its first successful config generation
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ExperimentMeta {
    pub basin_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,
}

impl ExperimentMeta {
    /// `None` if no metadata was written for this basin yet
    pub fn load(path: &Path) -> Result<Option<Self>, MetaError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(MetaError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|source| MetaError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write the document unless one already exists, returns whether it was written
    pub fn write_once(&self, path: &Path) -> Result<bool, MetaError> {
        let io_error = |source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            debug!(path = ?path, "Experiment metadata already present");
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content = serde_yaml::to_string(self).map_err(|source| MetaError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // write to a sibling first, readers never see a partial document
        let staging = path.with_extension("yml.partial");
        fs::write(&staging, content).map_err(io_error)?;
        fs::rename(&staging, path).map_err(io_error)?;

        Ok(true)
    }
}
