//! Process supervisor that binds one worker to one result slot.
//!
//! [`JobSupervisor::spawn`] starts the configured worker program, hands it the
//! request body and returns a [`WorkerHandle`] immediately. A monitor task per
//! worker then:
//!
//! - writes the body to the worker's stdin and closes it,
//! - collects the worker's stdout while waiting for the process to exit,
//! - kills whatever the worker left running in its process group and
//!   publishes the output into the [`ResultSlot`] (or marks it abandoned on a
//!   non-zero exit),
//! - or, if the worker's cancellation token fires first, kills the whole
//!   process group and leaves the slot empty.
//!
//! All worker tokens are children of the supervisor's shutdown token, so
//! [`JobSupervisor::shutdown`] reaches every live worker.

use crate::{
    Error, ResultSlot, Result, WorkerCommand, WorkerHandle, WorkerState,
    worker::kill_process_group,
};
use bytes::Bytes;
use core::{pin::pin, sync::atomic::Ordering, time::Duration};
use portable_atomic::{AtomicU64, AtomicUsize};
use std::{io, process::ExitStatus, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdout},
    sync::watch,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Spawns, monitors and kills worker processes.
pub struct JobSupervisor {
    command: WorkerCommand,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl JobSupervisor {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of workers whose process has not been reaped yet.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Starts a worker for `body` that will publish into `slot`.
    ///
    /// Returns as soon as the process exists; completion is observed through
    /// the slot and the returned handle.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) started.
    /// - [`Error::Spawn`] if the OS refused to start the process.
    pub fn spawn(&self, body: Bytes, slot: ResultSlot) -> Result<WorkerHandle> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let child = self
            .command
            .to_command()
            .spawn()
            .map_err(|e| Error::Spawn {
                program: self.command.program().display().to_string(),
                context: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let kill = self.shutdown_token.child_token();
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);

        self.live.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            "Spawned worker {id} (pid {pid:?}) with {} byte body",
            body.len()
        );

        self.tracker.spawn(monitor(
            id,
            child,
            body,
            slot,
            kill.clone(),
            state_tx,
            Arc::clone(&self.live),
        ));

        Ok(WorkerHandle::new(id, pid, kill, state_rx))
    }

    /// Kills the worker behind `handle` and waits until it has been reaped.
    ///
    /// Idempotent: finished or already terminated workers are left alone.
    pub async fn terminate(&self, handle: &WorkerHandle) -> WorkerState {
        handle.terminate().await
    }

    /// Stops accepting work and kills every live worker.
    ///
    /// Waits up to `grace` for all monitor tasks to finish reaping their
    /// processes.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        tracing::info!("Refusing new workers");
        self.shutdown_token.cancel();
        self.tracker.close();

        tracing::debug!("Waiting for {} live workers to be reaped", self.live_workers());
        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => tracing::debug!("All workers reaped"),
            Err(_) => tracing::warn!(
                "Worker shutdown timed out ({} still live)",
                self.live_workers()
            ),
        }

        tracing::info!("Supervisor shutdown complete");
        Ok(())
    }
}

/// How long output already buffered in the pipe may take to drain once the
/// worker itself has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(50);

async fn monitor(
    id: u64,
    mut child: Child,
    body: Bytes,
    slot: ResultSlot,
    kill: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
    live: Arc<AtomicUsize>,
) {
    let pid = child.id();
    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut output = Vec::new();

    let finished = {
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A worker is free to ignore its input, so a broken pipe here
                // is expected and not an error.
                if let Err(e) = stdin.write_all(&body).await {
                    tracing::debug!("Worker {id} stopped reading its body: {e}");
                }
            }
        };
        let run = async {
            let mut feed = pin!(feed);
            let mut collect = pin!(read_output(stdout.as_mut(), &mut output));
            let mut fed = false;
            let mut collected = None;

            // The exit of the worker ends the run even if a process it left
            // behind still holds one of its pipes.
            let status = loop {
                tokio::select! {
                    () = &mut feed, if !fed => fed = true,
                    read = &mut collect, if collected.is_none() => collected = Some(read),
                    status = child.wait() => break status,
                }
            };
            kill_process_group(id, pid);

            let collected = match collected {
                Some(read) => read,
                None => timeout(OUTPUT_GRACE, collect).await.unwrap_or_else(|_| {
                    tracing::debug!("Worker {id} exited with its stdout still open");
                    Ok(())
                }),
            };
            (collected, status)
        };

        tokio::select! {
            result = run => Some(result),
            () = kill.cancelled() => None,
        }
    };

    match finished {
        Some((collected, status)) => {
            let code = status.as_ref().ok().and_then(ExitStatus::code);
            state_tx.send_replace(WorkerState::Exited { code });
            publish(id, &slot, collected.map(|()| output), status);
        }
        None => {
            kill_process_group(id, pid);
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill worker {id}: {e}");
            }
            match child.wait().await {
                Ok(status) => tracing::info!("Worker {id} terminated ({status})"),
                Err(e) => tracing::warn!("Failed to reap worker {id}: {e}"),
            }
            state_tx.send_replace(WorkerState::Terminated);
        }
    }

    live.fetch_sub(1, Ordering::AcqRel);
}

/// Reads the worker's stdout into `output` until EOF.
///
/// Bytes already read stay in `output` if the future is dropped early.
async fn read_output(
    stdout: Option<&mut ChildStdout>,
    output: &mut Vec<u8>,
) -> io::Result<()> {
    if let Some(stdout) = stdout {
        while stdout.read_buf(output).await? != 0 {}
    }
    Ok(())
}

fn publish(
    id: u64,
    slot: &ResultSlot,
    output: io::Result<Vec<u8>>,
    status: io::Result<ExitStatus>,
) {
    let written = match status {
        Err(e) => {
            tracing::warn!("Failed to wait for worker {id}: {e}");
            slot.abandon(format!("failed to wait for worker: {e}"))
        }
        Ok(status) if !status.success() => {
            tracing::warn!("Worker {id} exited without a result ({status})");
            slot.abandon(format!("worker exited with {status}"))
        }
        Ok(_) => match output {
            Ok(output) => {
                tracing::debug!("Worker {id} finished with {} byte result", output.len());
                slot.set(Bytes::from(output))
            }
            Err(e) => {
                tracing::warn!("Failed to read output of worker {id}: {e}");
                slot.abandon(format!("failed to read worker output: {e}"))
            }
        },
    };

    if let Err(e) = written {
        tracing::error!("Worker {id} result dropped: {e}");
    }
}
