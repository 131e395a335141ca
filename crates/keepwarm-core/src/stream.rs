//! Keep-alive response generator.
//!
//! A [`StreamSession`] drives one streamed response through the states
//! `INIT → POLLING → {COMPLETE | CANCELLED}`, with two further terminal
//! states for workers that die without a result (`FAILED`) or outlive the
//! configured maximum duration (`EXPIRED`).
//!
//! There is no out-of-band signal for a client going away, so every
//! keep-alive doubles as a liveness probe: when the response body has been
//! dropped by the transport, the send fails and the worker is killed. Between
//! probes the session sleeps for the poll interval, but wakes early when the
//! result slot settles or the response channel closes, so the poll interval
//! is only an upper bound on reaction time.

use crate::{ResultSlot, SlotState, StreamConfig, WorkerHandle, WorkerState};
use bytes::Bytes;
use std::io;
use tokio::{sync::mpsc, time::sleep};

/// Item type of the response body channel.
pub type Chunk = core::result::Result<Bytes, io::Error>;

/// Terminal state of a [`StreamSession`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The result was emitted as the final chunk.
    Complete,
    /// The client disconnected; the worker was killed.
    Cancelled,
    /// The worker exited without producing a result.
    Failed(String),
    /// The worker exceeded the configured maximum duration and was killed.
    Expired,
}

/// Per-request state of the response generator.
#[derive(Debug)]
pub struct StreamSession {
    slot: ResultSlot,
    worker: WorkerHandle,
    config: StreamConfig,
}

impl StreamSession {
    pub const fn new(slot: ResultSlot, worker: WorkerHandle, config: StreamConfig) -> Self {
        Self {
            slot,
            worker,
            config,
        }
    }

    /// Streams keep-alives and then the result into `tx` until the session
    /// reaches a terminal state.
    ///
    /// On every path other than [`StreamOutcome::Complete`] the worker is
    /// finished or killed before this returns. `Failed` and `Expired` end the
    /// body with an error item so the client sees a truncated response rather
    /// than a clean end of stream.
    pub async fn run(self, tx: mpsc::Sender<Chunk>) -> StreamOutcome {
        let Self {
            slot,
            worker,
            config,
        } = self;

        let outcome = match config.max_duration {
            Some(limit) => tokio::time::timeout(limit, drive(&slot, &worker, &config, &tx))
                .await
                .unwrap_or(StreamOutcome::Expired),
            None => drive(&slot, &worker, &config, &tx).await,
        };

        match &outcome {
            StreamOutcome::Complete => {
                tracing::debug!("Worker {} result delivered", worker.id());
            }
            StreamOutcome::Cancelled => {
                tracing::info!("Client disconnected; terminating worker {}", worker.id());
                let state = worker.terminate().await;
                tracing::debug!("Worker {} stopped ({state:?})", worker.id());
            }
            StreamOutcome::Failed(reason) => {
                tracing::warn!("Worker {} failed: {reason}", worker.id());
                let _ = tx.send(Err(io::Error::other(reason.clone()))).await;
            }
            StreamOutcome::Expired => {
                tracing::warn!(
                    "Worker {} exceeded {:?}; terminating",
                    worker.id(),
                    config.max_duration
                );
                worker.terminate().await;
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "worker exceeded maximum duration",
                    )))
                    .await;
            }
        }

        outcome
    }
}

async fn drive(
    slot: &ResultSlot,
    worker: &WorkerHandle,
    config: &StreamConfig,
    tx: &mpsc::Sender<Chunk>,
) -> StreamOutcome {
    // INIT
    sleep(config.settle_delay).await;

    // POLLING
    loop {
        if tx.send(Ok(Bytes::new())).await.is_err() {
            return StreamOutcome::Cancelled;
        }
        tracing::trace!("Connection alive");

        match slot.state() {
            SlotState::Ready(value) => {
                return if tx.send(Ok(value)).await.is_ok() {
                    StreamOutcome::Complete
                } else {
                    StreamOutcome::Cancelled
                };
            }
            SlotState::Abandoned(reason) => return StreamOutcome::Failed(reason),
            SlotState::Empty => {}
        }

        // Killed from elsewhere (supervisor shutdown); the slot will never
        // settle.
        if worker.state() == WorkerState::Terminated {
            return StreamOutcome::Failed("worker was terminated".to_string());
        }

        tokio::select! {
            () = sleep(config.poll_interval) => {}
            _ = slot.settled() => {}
            () = worker.killed() => {}
            () = tx.closed() => return StreamOutcome::Cancelled,
        }
    }
}
