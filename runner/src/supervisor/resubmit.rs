use crate::{
    config::{ResubmitConfig, SandboxConfig},
    executors::{run_sbatch, ExecutorError, SubmissionId},
};
use itertools::Itertools;
use std::{env, io, os::unix::process::CommandExt, path::Path, process::Command};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ResubmitError {
    #[error("Resubmission is disabled")]
    Disabled,
    #[error("Failed to locate the running executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[error("Failed to re-execute the launcher: {0}")]
    Exec(#[source] io::Error),
    #[error(transparent)]
    Submit(#[from] ExecutorError),
}

/// `sbatch` arguments of a launcher resubmission, it starts once `dependencies` ended
pub fn launcher_args(script: &Path, dependencies: &[SubmissionId], argv: &[String]) -> Vec<String> {
    let mut args = vec!["--parsable".to_owned()];

    if !dependencies.is_empty() {
        args.push(format!(
            "--dependency=afterany:{}",
            dependencies.iter().map(SubmissionId::as_str).join(":")
        ));
    }

    args.push(script.to_string_lossy().into_owned());
    args.extend(argv.iter().cloned());

    args
}

/// Start a fresh launcher for the remaining work.
///
/// In exec mode the current process is replaced and this only returns on failure
pub fn resubmit(
    config: &SandboxConfig,
    dependencies: &[SubmissionId],
) -> Result<SubmissionId, ResubmitError> {
    let argv: Vec<String> = env::args_os()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    match &config.launcher.resubmit {
        ResubmitConfig::Never => Err(ResubmitError::Disabled),
        ResubmitConfig::Sbatch { script, sbatch } => {
            let args = launcher_args(script, dependencies, &argv);
            let id = run_sbatch(
                sbatch,
                &args,
                &config.general.output_dir,
                config.tools.submission_timeout,
            )?;

            info!(submission = %id, "Resubmitted launcher through {sbatch}");

            Ok(id)
        }
        ResubmitConfig::Exec => {
            let exe = env::current_exe().map_err(ResubmitError::CurrentExe)?;

            info!("Restarting launcher {} in place", exe.display());

            Err(ResubmitError::Exec(
                Command::new(exe).args(env::args_os().skip(1)).exec(),
            ))
        }
    }
}
