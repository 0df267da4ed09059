use super::{ExecutorError, StageCommand};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Executor spawning supervised child processes on this host
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn load() -> Self {
        Self
    }

    /// Spawn a stage as the leader of its own process group, output goes to the stage log
    pub fn spawn(&self, command: &StageCommand) -> Result<LocalJob, ExecutorError> {
        let log = open_log(command)?;
        let stderr = log.try_clone().map_err(|source| ExecutorError::Io {
            path: command.log.clone(),
            source,
        })?;

        let (program, args) = command
            .argv
            .split_first()
            .ok_or(ExecutorError::EmptyCommand("stage command"))?;

        let child = Command::new(program)
            .args(args)
            .envs(command.env.iter().map(|(key, value)| (key, value)))
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        info!(pid = child.id(), stage = %command.stage, "Started {program}");

        Ok(LocalJob {
            pid: Pid::from_raw(child.id() as i32),
            child,
            started: Instant::now(),
        })
    }
}

fn open_log(command: &StageCommand) -> Result<File, ExecutorError> {
    let io_error = |source| ExecutorError::Io {
        path: command.log.clone(),
        source,
    };

    if let Some(parent) = command.log.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&command.log)
        .map_err(io_error)
}

/// A running child process and its process group
#[derive(Debug)]
pub struct LocalJob {
    child: Child,
    pid: Pid,
    started: Instant,
}

impl LocalJob {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// non-blocking liveness check, `Some` once the child exited
    pub fn try_finished(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// ask the whole process group to shut down
    pub fn signal_graceful(&self) {
        self.signal(Signal::SIGTERM);
    }

    /// wait up to `grace` for the child to exit after `signal_graceful`
    pub fn wait_grace(&mut self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        self.child.wait_timeout(grace)
    }

    /// kill the whole process group and reap the child
    pub fn force_kill(&mut self) -> io::Result<ExitStatus> {
        self.signal(Signal::SIGKILL);

        self.child.wait()
    }

    fn signal(&self, signal: Signal) {
        match killpg(self.pid, signal) {
            Ok(()) => debug!(pid = self.child.id(), "Sent {signal} to process group"),
            // group already gone
            Err(Errno::ESRCH) => {}
            Err(error) => {
                warn!(pid = self.child.id(), error = ?error, "Failed to send {signal} to process group")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::Stage;
    use std::path::Path;

    fn shell(dir: &Path, script: &str) -> StageCommand {
        StageCommand {
            stage: Stage::Run,
            argv: vec!["sh".into(), "-c".into(), script.into()],
            env: vec![("BASIN_ID".into(), "01".into())],
            cwd: dir.to_path_buf(),
            log: dir.join("logs").join("run.log"),
        }
    }

    #[test]
    fn runs_in_output_dir_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalExecutor::load()
            .spawn(&shell(dir.path(), "pwd; echo basin=$BASIN_ID; echo oops >&2"))
            .unwrap();

        let status = job.wait_grace(Duration::from_secs(10)).unwrap().unwrap();
        assert!(status.success());

        let log = fs::read_to_string(dir.path().join("logs").join("run.log")).unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        assert!(log.contains(&*cwd.to_string_lossy()));
        assert!(log.contains("basin=01"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn graceful_termination_stops_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalExecutor::load()
            .spawn(&shell(dir.path(), "sleep 30 & wait"))
            .unwrap();

        assert!(job.try_finished().unwrap().is_none());
        job.signal_graceful();

        let status = job.wait_grace(Duration::from_secs(10)).unwrap();
        assert!(status.is_some());
        assert!(job.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn force_kill_after_ignored_term() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = LocalExecutor::load()
            .spawn(&shell(dir.path(), "trap '' TERM; while true; do sleep 1; done"))
            .unwrap();

        // give the shell time to install its trap
        std::thread::sleep(Duration::from_millis(200));
        job.signal_graceful();
        assert!(job.wait_grace(Duration::from_millis(300)).unwrap().is_none());

        let status = job.force_kill().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = shell(dir.path(), "true");
        command.argv = vec!["/nonexistent/ngen".into()];

        assert!(matches!(
            LocalExecutor::load().spawn(&command),
            Err(ExecutorError::Spawn { .. })
        ));
    }
}
