#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod ingress;
pub mod slot;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use config::StreamConfig;
pub use error::{Error, Result};
pub use ingress::drain;
pub use slot::{ResultSlot, SlotState};
pub use stream::{StreamOutcome, StreamSession};
pub use supervisor::JobSupervisor;
pub use worker::{WorkerCommand, WorkerHandle, WorkerState};
