//! Constructor-time configuration for a session.
//!
//! No files, no environment: the only configuration surface of this core is
//! the server address, the two channel ports, and timing/budget constants.

use std::time::Duration;

use tglink_core::frame::DEFAULT_COMPRESS_THRESHOLD;

/// Byte-size budget per batch chunk; oversized batches split into multiple
/// round trips so one message cannot stall the transport.
pub const DEFAULT_BATCH_CHUNK_SIZE: usize = 500_000;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Server host name or address.
    pub server: String,
    /// Port of the synchronous request/response channel.
    pub sync_port: u16,
    /// Port of the asynchronous streaming channel.
    pub async_port: u16,
    /// Send/receive timeout for each request/response leg.
    pub timeout: Duration,
    /// Extra attempts after a timed-out send or receive before the
    /// transport is closed. Zero means a single attempt.
    pub retry: u32,
    /// Sleep between async-job polls ("try again" resends and ticket
    /// result fetches).
    pub poll_interval: Duration,
    /// Total window granted to an async job before the budget is declared
    /// exhausted.
    pub async_timeout: Duration,
    /// Receive timeout of the streaming loop; silence longer than this
    /// raises the edge-triggered timeout event.
    pub recv_timeout: Duration,
    /// `is_alive` window: the session counts as live only if streaming data
    /// arrived this recently.
    pub liveness_window: Duration,
    /// Overall deadline for one barrier round trip.
    pub barrier_timeout: Duration,
    /// Minimum payload size for frame compression.
    pub compress_threshold: usize,
    /// Byte budget per batch chunk.
    pub batch_chunk_size: usize,
    /// When set, `mark_for_disconnect` also trips the session cancel token,
    /// unblocking a foreground task stuck inside a synchronous call.
    pub interrupt_on_disconnect: bool,
}

impl LinkConfig {
    /// Configuration with default timings for the given endpoints.
    pub fn new(server: impl Into<String>, sync_port: u16, async_port: u16) -> Self {
        Self {
            server: server.into(),
            sync_port,
            async_port,
            ..Self::default()
        }
    }

    /// Number of poll attempts the async-job window allows.
    pub fn poll_budget(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        (self.async_timeout.as_millis() / interval).max(1) as u32
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            sync_port: 4501,
            async_port: 4500,
            timeout: Duration::from_secs(10),
            retry: 0,
            poll_interval: Duration::from_millis(300),
            async_timeout: Duration::from_secs(3),
            recv_timeout: Duration::from_secs(3),
            liveness_window: Duration::from_secs(3),
            barrier_timeout: Duration::from_secs(5),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            batch_chunk_size: DEFAULT_BATCH_CHUNK_SIZE,
            interrupt_on_disconnect: false,
        }
    }
}
