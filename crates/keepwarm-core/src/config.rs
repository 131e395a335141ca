use crate::{Error, Result};
use core::time::Duration;

/// Pause before the first keep-alive so the worker has a chance to start.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Period between keep-alive probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request bodies larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Number of chunks buffered between the stream generator and the transport.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 4;

/// Timing parameters shared by every [`StreamSession`].
///
/// The values are fixed for the lifetime of the process; individual requests
/// cannot override them.
///
/// [`StreamSession`]: crate::StreamSession
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Delay before the first keep-alive is emitted.
    pub settle_delay: Duration,
    /// Interval between keep-alive probes. Must be non-zero.
    pub poll_interval: Duration,
    /// Optional upper bound on how long a worker may run before the stream
    /// gives up and kills it. `None` waits indefinitely.
    pub max_duration: Option<Duration>,
    /// Capacity of the channel feeding the response body. Must be non-zero.
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_duration: None,
            buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
        }
    }
}

impl StreamConfig {
    /// Checks the invariants the stream generator relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the poll interval, the buffer size
    /// or the maximum duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "poll interval must be greater than 0".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "stream buffer size must be greater than 0".to_string(),
            });
        }
        if self.max_duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfig {
                reason: "max duration must be greater than 0 when set".to_string(),
            });
        }
        Ok(())
    }
}
