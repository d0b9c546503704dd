//! Worker process spawning and termination.
//!
//! The pool task decides *when* a slot gets a child; this module owns *how*:
//! writing the launch-spec file, starting the command, draining the child's
//! stdout/stderr into the operator log, and reporting the exit back to the
//! pool. Termination is polite first (SIGTERM), forceful second (SIGKILL);
//! the exit-watch task reaps the child either way, so no zombies survive a
//! recycle.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::bridge::protocol::LaunchSpec;
use crate::pool::PoolEvent;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to write launch spec: {0}")]
    LaunchSpec(#[source] std::io::Error),
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle on a running (or test-faked) worker process.
///
/// The `tokio::process::Child` itself is owned by the exit-watch task; the
/// pool signals the process by pid. A `pid` of `None` marks a detached
/// handle used by tests, for which both signals are no-ops.
#[derive(Debug)]
pub struct WorkerProc {
    pid: Option<u32>,
}

impl WorkerProc {
    pub fn detached() -> Self {
        Self { pid: None }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the worker to exit (SIGTERM).
    pub fn terminate(&self) {
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    /// Kill the worker outright (SIGKILL).
    pub fn kill(&self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    fn signal(&self, sig: nix::sys::signal::Signal) {
        let Some(pid) = self.pid else { return };
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        // ESRCH just means the child already exited and was reaped.
        if let Err(e) = nix::sys::signal::kill(pid, sig)
            && e != nix::errno::Errno::ESRCH
        {
            tracing::warn!(pid = %pid, signal = %sig, error = %e, "Failed to signal worker");
        }
    }
}

/// Extension point for different worker spawn strategies.
///
/// The production implementation starts an OS process; tests substitute a
/// recording fake so pool transitions can be driven without real children.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        spec: &LaunchSpec,
        events: mpsc::Sender<PoolEvent>,
    ) -> Result<WorkerProc, SpawnError>;
}

/// Spawner that runs the configured worker command as a child process.
pub struct ProcessSpawner {
    command: Vec<String>,
    runtime_dir: PathBuf,
}

impl ProcessSpawner {
    pub fn new(command: Vec<String>, runtime_dir: PathBuf) -> Self {
        Self {
            command,
            runtime_dir,
        }
    }

    fn write_launch_spec(&self, spec: &LaunchSpec) -> Result<PathBuf, std::io::Error> {
        let path = self.runtime_dir.join(format!("slot-{}.launch.json", spec.slot));
        let json = serde_json::to_vec_pretty(spec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        spec: &LaunchSpec,
        events: mpsc::Sender<PoolEvent>,
    ) -> Result<WorkerProc, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::EmptyCommand)?;
        let spec_path = self.write_launch_spec(spec).map_err(SpawnError::LaunchSpec)?;

        let mut child = Command::new(program)
            .args(args)
            .arg(&spec_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let pid = child.id();
        let slot = spec.slot;
        let generation = spec.generation;

        tracing::debug!(slot, generation, pid, program = %program, "Spawned worker");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(slot, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(slot, "stderr", stderr));
        }

        // The watch task owns the child; waiting reaps it on every exit path.
        tokio::spawn(async move {
            let status = child.wait().await;
            match status {
                Ok(status) => {
                    tracing::debug!(slot, generation, %status, "Worker exited");
                }
                Err(e) => {
                    tracing::warn!(slot, generation, error = %e, "Failed to wait for worker");
                }
            }
            let _ = events.send(PoolEvent::ChildExited { slot, generation }).await;
        });

        Ok(WorkerProc { pid })
    }
}

/// Drain a child output pipe into the operator log, prefixed by slot.
///
/// Actively reading keeps the pipe buffer from filling and silently wedging
/// the worker.
async fn drain_output<R: AsyncRead + Unpin>(slot: usize, source: &'static str, pipe: R) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if source == "stderr" {
                    tracing::warn!(target: "prefork::worker", slot, "{}", line);
                } else {
                    tracing::info!(target: "prefork::worker", slot, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(slot, source, error = %e, "Worker output pipe error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(runtime_dir: &std::path::Path) -> LaunchSpec {
        LaunchSpec {
            slot: 0,
            generation: 1,
            data_addr: runtime_dir.join("slot-0.sock"),
            control_addr: runtime_dir.join("control.sock"),
            bootstrap_ref: "app".to_string(),
            bridge_ref: "bridge".to_string(),
            app_env: "test".to_string(),
            debug: false,
            logging: false,
        }
    }

    #[test]
    fn detached_proc_signals_are_noops() {
        let proc = WorkerProc::detached();
        proc.terminate();
        proc.kill();
        assert_eq!(proc.pid(), None);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = ProcessSpawner::new(Vec::new(), dir.path().to_path_buf());
        let (tx, _rx) = mpsc::channel(1);

        let err = spawner.spawn(&spec(dir.path()), tx).unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[tokio::test]
    async fn spawn_writes_launch_spec_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spawner =
            ProcessSpawner::new(vec!["true".to_string()], dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(1);

        let proc = spawner.spawn(&spec(dir.path()), tx).unwrap();
        assert!(proc.pid().is_some());

        let spec_path = dir.path().join("slot-0.launch.json");
        let written: LaunchSpec =
            serde_json::from_slice(&std::fs::read(&spec_path).unwrap()).unwrap();
        assert_eq!(written.slot, 0);
        assert_eq!(written.generation, 1);

        match rx.recv().await {
            Some(PoolEvent::ChildExited { slot: 0, generation: 1 }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = ProcessSpawner::new(
            vec!["/nonexistent/prefork-worker".to_string()],
            dir.path().to_path_buf(),
        );
        let (tx, _rx) = mpsc::channel(1);

        let err = spawner.spawn(&spec(dir.path()), tx).unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }
}
