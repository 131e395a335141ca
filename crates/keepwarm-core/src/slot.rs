//! Set-once result cell shared between a worker monitor and a response
//! stream.
//!
//! A [`ResultSlot`] starts [`SlotState::Empty`] and transitions exactly once,
//! either to [`SlotState::Ready`] when the worker produced a value or to
//! [`SlotState::Abandoned`] when it exited without one. Any later write is
//! rejected with [`Error::SlotAlreadySet`].
//!
//! The slot is backed by a [`watch`] channel so readers can either sample it
//! ([`ResultSlot::state`]) or await the transition ([`ResultSlot::settled`])
//! instead of re-polling on a timer.

use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Observable state of a [`ResultSlot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No value has been written yet.
    Empty,
    /// The worker finished and published this value.
    Ready(Bytes),
    /// The worker exited without publishing a value.
    Abandoned(String),
}

impl SlotState {
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Shared, set-once container for a worker's result.
///
/// Cloning is cheap; all clones observe the same cell.
#[derive(Clone, Debug)]
pub struct ResultSlot {
    inner: Arc<watch::Sender<SlotState>>,
}

impl Default for ResultSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::Empty);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Publishes the worker's value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotAlreadySet`] if the slot already settled.
    pub fn set(&self, value: Bytes) -> Result<()> {
        self.settle(SlotState::Ready(value))
    }

    /// Marks the slot as settled without a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotAlreadySet`] if the slot already settled.
    pub fn abandon(&self, reason: impl Into<String>) -> Result<()> {
        self.settle(SlotState::Abandoned(reason.into()))
    }

    fn settle(&self, next: SlotState) -> Result<()> {
        let written = self.inner.send_if_modified(move |state| {
            if state.is_empty() {
                *state = next;
                true
            } else {
                false
            }
        });

        if written {
            Ok(())
        } else {
            Err(Error::SlotAlreadySet)
        }
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> SlotState {
        self.inner.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        !self.inner.borrow().is_empty()
    }

    /// Resolves once the slot leaves [`SlotState::Empty`], returning the
    /// settled state. Resolves immediately if it already settled.
    pub async fn settled(&self) -> SlotState {
        let mut rx = self.inner.subscribe();
        match rx.wait_for(|state| !state.is_empty()).await {
            Ok(state) => state.clone(),
            // The sender lives inside `self`, so the channel cannot close
            // while we are borrowing it.
            Err(_) => self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn starts_empty() {
        let slot = ResultSlot::new();
        assert_eq!(slot.state(), SlotState::Empty);
        assert!(!slot.is_set());
    }

    #[test]
    fn second_write_is_rejected() {
        let slot = ResultSlot::new();
        slot.set(Bytes::from_static(b"done")).unwrap();
        assert_eq!(
            slot.set(Bytes::from_static(b"again")),
            Err(Error::SlotAlreadySet)
        );
        assert_eq!(slot.abandon("late"), Err(Error::SlotAlreadySet));
        assert_eq!(slot.state(), SlotState::Ready(Bytes::from_static(b"done")));
    }

    #[test]
    fn abandon_settles_without_value() {
        let slot = ResultSlot::new();
        slot.abandon("exit status 3").unwrap();
        assert!(slot.is_set());
        assert_eq!(
            slot.state(),
            SlotState::Abandoned("exit status 3".to_string())
        );
    }

    #[test]
    fn clones_share_the_cell() {
        let writer = ResultSlot::new();
        let reader = writer.clone();
        writer.set(Bytes::from_static(b"shared")).unwrap();
        assert_eq!(
            reader.state(),
            SlotState::Ready(Bytes::from_static(b"shared"))
        );
    }

    #[tokio::test]
    async fn settled_wakes_on_write() {
        let slot = ResultSlot::new();
        let writer = slot.clone();

        let waiter = tokio::spawn(async move { slot.settled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        writer.set(Bytes::from_static(b"done")).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(state, SlotState::Ready(Bytes::from_static(b"done")));
    }

    #[tokio::test]
    async fn settled_returns_immediately_when_already_set() {
        let slot = ResultSlot::new();
        slot.set(Bytes::from_static(b"early")).unwrap();
        assert_eq!(
            slot.settled().await,
            SlotState::Ready(Bytes::from_static(b"early"))
        );
    }
}
