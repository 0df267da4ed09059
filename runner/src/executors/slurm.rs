use super::{ExecutorError, StageCommand};
use itertools::Itertools;
use std::{
    fmt,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Id of a batch queue job as printed by `sbatch --parsable`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionId(String);

impl SubmissionId {
    /// first token of `<id>[;cluster]`
    pub fn parse(stdout: &str) -> Option<Self> {
        let id = stdout.lines().next()?.split(';').next()?.trim();

        (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| Self(id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run `sbatch` with a bounded wait and return the id of the submitted job
pub fn run_sbatch(
    sbatch: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<SubmissionId, ExecutorError> {
    let start = Instant::now();
    let mut child = Command::new(sbatch)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            program: sbatch.to_owned(),
            source,
        })?;

    let wait_error = |source| ExecutorError::Io {
        path: PathBuf::from(sbatch),
        source,
    };

    // drained while waiting, a full pipe would block sbatch
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let Some(status) = child.wait_timeout(timeout).map_err(wait_error)? else {
        warn!("{sbatch} ran into timeout, killing it");
        let _ = child.kill();
        let _ = child.wait();

        return Err(ExecutorError::SubmissionTimeout(timeout));
    };

    let stdout = collect(stdout).map_err(wait_error)?;
    let stderr = collect(stderr).map_err(wait_error)?;

    debug!(
        "{sbatch} finished in {} ms | status: {status}",
        start.elapsed().as_millis()
    );

    if !status.success() {
        return Err(ExecutorError::Submit {
            status,
            stderr: stderr.trim().to_owned(),
        });
    }

    SubmissionId::parse(&stdout).ok_or_else(|| ExecutorError::SubmissionId(stdout.trim().to_owned()))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(reader: JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "pipe reader panicked")))
}

/// Executor handing stages to a slurm batch queue
#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    sbatch: String,
    script: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl SlurmExecutor {
    pub fn load(sbatch: String, script: PathBuf, extra_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            sbatch,
            script,
            extra_args,
            timeout,
        }
    }

    /// arguments of the `sbatch` call for one stage, the stage argv is passed to the script
    pub fn submission_args(&self, command: &StageCommand, job_name: &str, cpus: u32) -> Vec<String> {
        let exports = command
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(",");

        let mut args = vec![
            "--parsable".to_owned(),
            format!("--cpus-per-task={cpus}"),
            format!("--ntasks-per-node={cpus}"),
            format!("--job-name={job_name}"),
            format!("--chdir={}", command.cwd.display()),
            format!("--output={}", command.log.display()),
            format!("--export=ALL,{exports}"),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push(self.script.to_string_lossy().into_owned());
        args.extend(command.argv.iter().cloned());

        args
    }

    pub fn submit(
        &self,
        command: &StageCommand,
        job_name: &str,
        cpus: u32,
    ) -> Result<SubmissionId, ExecutorError> {
        if let Some(parent) = command.log.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ExecutorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let args = self.submission_args(command, job_name, cpus);
        let id = run_sbatch(&self.sbatch, &args, &command.cwd, self.timeout)?;

        info!(submission = %id, "Submitted {job_name} ({}) with {cpus} cpu(s)", command.stage);

        Ok(id)
    }
}
