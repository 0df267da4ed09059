//! On-disk layout of an experiment.
//!
//! Every path the orchestrator hands to an external program is built here from explicit base
//! directories, nothing is derived from the working directory of the process.

use crate::config::SandboxConfig;
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::info;

pub const LEDGER_FILE: &str = "basins_passed.csv";
pub const CONFIGS_DIR: &str = "configs";
pub const CALIB_CONFIG: &str = "calib_config.yaml";
pub const RESTART_CONFIG: &str = "calib_config_restart.yaml";
pub const VALIDATION_CONFIG: &str = "valid_config.yaml";
pub const CHECKPOINT_FILE: &str = "best_params.txt";
pub const VALIDATION_DIR: &str = "output_sim_obs";
pub const VALIDATION_FILE: &str = "sim_obs_validation.csv";
pub const WORKER_SUFFIX: &str = "_worker";
pub const LOGS_DIR: &str = "logs";

/// Convert a formulation name into a directory name, e.g. "NOM, CFE, T-route" -> "nom_cfe"
pub fn model_dir_name(model: &str) -> String {
    model
        .replace("T-route", "")
        .replace(',', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// One output tree, either the whole output directory or the subtree of a single formulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    model: Option<String>,
    root: PathBuf,
    info_dir: PathBuf,
    // gages the formulation is mapped to, `None` for all of them
    gages: Option<BTreeSet<String>>,
}

impl ExperimentLayout {
    pub fn new(model: Option<String>, root: PathBuf, exp_info_dir: &Path) -> Self {
        let info_dir = root.join(exp_info_dir);

        Self {
            model,
            root,
            info_dir,
            gages: None,
        }
    }

    /// restrict the tree to the basins of `gages`
    pub fn with_gages(self, gages: Option<BTreeSet<String>>) -> Self {
        Self { gages, ..self }
    }

    /// one layout per configured formulation, or a single one for the bare output directory
    pub fn for_config(config: &SandboxConfig) -> Vec<Self> {
        let output_dir = &config.general.output_dir;
        let exp_info_dir = &config.launcher.exp_info_dir;

        let models = config.all_models();

        if models.is_empty() {
            vec![Self::new(None, output_dir.clone(), exp_info_dir)]
        } else {
            models
                .into_iter()
                .map(|model| {
                    Self::new(
                        Some(model.to_owned()),
                        output_dir.join(model_dir_name(model)),
                        exp_info_dir,
                    )
                    .with_gages(config.gages_for(model))
                })
                .collect()
        }
    }

    /// true if basin `basin_id` runs with this tree's formulation
    pub fn includes(&self, basin_id: &str) -> bool {
        self.gages
            .as_ref()
            .map_or(true, |gages| gages.contains(basin_id))
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// directory name of the formulation, used for job names
    pub fn model_dir(&self) -> Option<String> {
        self.model.as_deref().map(model_dir_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn meta_path(&self, basin_id: &str) -> PathBuf {
        self.info_dir.join(format!("info_{basin_id}.yml"))
    }

    pub fn basin(&self, basin_id: &str) -> BasinPaths {
        BasinPaths::new(self.root.join(basin_id))
    }

    /// Remove the whole output tree.
    ///
    /// Refuses to touch a tree that is, or contains, `protected` (the input root)
    pub fn clean(&self, protected: &Path) -> io::Result<bool> {
        if protected.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "refusing to remove {} since it contains the input directory",
                    self.root.display()
                ),
            ));
        }

        if !self.root.exists() {
            return Ok(false);
        }

        info!(path = ?self.root, "Removing output tree");
        fs::remove_dir_all(&self.root)?;

        Ok(true)
    }
}

/// Paths below the output directory of one basin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasinPaths {
    output_dir: PathBuf,
}

impl BasinPaths {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.output_dir.join(CONFIGS_DIR)
    }

    pub fn calib_config(&self) -> PathBuf {
        self.configs_dir().join(CALIB_CONFIG)
    }

    pub fn restart_config(&self) -> PathBuf {
        self.configs_dir().join(RESTART_CONFIG)
    }

    pub fn validation_config(&self) -> PathBuf {
        self.configs_dir().join(VALIDATION_CONFIG)
    }

    /// deterministic path of the decomposition for `workers` processes
    pub fn partition(&self, workers: u32) -> PathBuf {
        self.configs_dir().join(format!("partitions_{workers}.json"))
    }

    pub fn realization_dir(&self) -> PathBuf {
        self.output_dir.join("json")
    }

    pub fn stage_log(&self, stage: &str) -> PathBuf {
        self.output_dir.join(LOGS_DIR).join(format!("{stage}.log"))
    }
}
