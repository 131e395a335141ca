//! Worker process description and the handle used to control a running
//! worker.
//!
//! A worker is any program that reads the request body on stdin, writes its
//! result on stdout and exits with status `0`. Each request gets its own
//! process so that a forced kill never depends on the worker cooperating.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{process::Command, sync::watch};
use tokio_util::sync::CancellationToken;

/// Program and arguments used to start a worker process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Builds the process command with piped stdin/stdout.
    ///
    /// On unix the worker leads a new process group, so everything it forks
    /// can be killed together with [`kill_process_group`]. `kill_on_drop`
    /// covers the leader if its monitor task is torn down unexpectedly.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Sends `SIGKILL` to the process group led by worker `pid`.
///
/// A group with no members left is not an error.
#[cfg(unix)]
pub(crate) fn kill_process_group(id: u64, pid: Option<u32>) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => tracing::debug!("Killed process group {pgid} of worker {id}"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to kill process group {pgid} of worker {id}: {e}"),
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_id: u64, _pid: Option<u32>) {}

/// Lifecycle of a worker process as seen by its monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// The process exited on its own. `code` is `None` when it was ended by a
    /// signal we did not send.
    Exited { code: Option<i32> },
    /// The process was killed through [`WorkerHandle::terminate`], a dropped
    /// handle, or a supervisor shutdown.
    Terminated,
}

impl WorkerState {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Exclusive handle to one spawned worker process.
///
/// Dropping the handle while the worker is still running kills it, so a
/// request that goes away for any reason never leaves its worker behind.
#[derive(Debug)]
pub struct WorkerHandle {
    id: u64,
    pid: Option<u32>,
    kill: CancellationToken,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub(crate) const fn new(
        id: u64,
        pid: Option<u32>,
        kill: CancellationToken,
        state: watch::Receiver<WorkerState>,
    ) -> Self {
        Self {
            id,
            pid,
            kill,
            state,
        }
    }

    /// Supervisor-assigned sequence number, unique per process lifetime.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// OS process id, if the platform reported one at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes independently of this
    /// handle.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Waits for the worker to leave [`WorkerState::Running`] without
    /// interfering with it.
    pub async fn wait(&self) -> WorkerState {
        let mut rx = self.state.clone();
        match rx.wait_for(|state| !state.is_running()).await {
            Ok(state) => *state,
            // The monitor is gone; `kill_on_drop` already reaped the child.
            Err(_) => WorkerState::Terminated,
        }
    }

    /// Resolves once the worker has been killed. Never resolves for a worker
    /// that exits on its own.
    pub(crate) async fn killed(&self) {
        let mut rx = self.state.clone();
        let observed = rx
            .wait_for(|state| *state == WorkerState::Terminated)
            .await
            .is_ok();
        if !observed {
            core::future::pending::<()>().await;
        }
    }

    /// Forcibly kills the worker and waits until its process has been reaped.
    ///
    /// Terminating a worker that already exited or was already terminated is
    /// a no-op that returns the existing final state.
    pub async fn terminate(&self) -> WorkerState {
        let current = self.state();
        if !current.is_running() {
            tracing::debug!(
                "Worker {} already stopped ({current:?}); nothing to terminate",
                self.id
            );
            return current;
        }

        tracing::debug!("Terminating worker {} (pid {:?})", self.id, self.pid);
        self.kill.cancel();
        self.wait().await
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state().is_running() {
            tracing::debug!("Worker {} handle dropped while running; killing", self.id);
            self.kill.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_collects_args_in_order() {
        let command = WorkerCommand::new("keepwarm-worker")
            .arg("--delay-ms")
            .args(["250", "--echo"]);
        assert_eq!(command.program(), Path::new("keepwarm-worker"));
        assert_eq!(
            command.get_args(),
            &[
                OsString::from("--delay-ms"),
                OsString::from("250"),
                OsString::from("--echo")
            ]
        );
    }

    #[tokio::test]
    async fn terminate_on_finished_worker_is_a_noop() {
        let (tx, rx) = watch::channel(WorkerState::Exited { code: Some(0) });
        let kill = CancellationToken::new();
        let handle = WorkerHandle::new(1, None, kill.clone(), rx);

        assert_eq!(handle.terminate().await, WorkerState::Exited { code: Some(0) });
        assert_eq!(handle.terminate().await, WorkerState::Exited { code: Some(0) });
        assert!(!kill.is_cancelled());
        drop(handle);
        assert!(!kill.is_cancelled());
        drop(tx);
    }

    #[tokio::test]
    async fn dropping_a_running_handle_requests_a_kill() {
        let (_tx, rx) = watch::channel(WorkerState::Running);
        let kill = CancellationToken::new();
        let handle = WorkerHandle::new(2, None, kill.clone(), rx);
        drop(handle);
        assert!(kill.is_cancelled());
    }
}
