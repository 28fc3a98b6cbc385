//! Shared session state.
//!
//! One [`SessionCore`] exists per connection and is owned by the
//! orchestrator. The channel components hold references to read the
//! authorization handle and push narrow state transitions; the subscriber
//! specifically receives a [`SessionHandle`], never the whole session.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No session established.
    Disconnected,
    /// Session fully established (handshake + streaming + barrier passed).
    Connected,
    /// A fatal condition was observed from another thread; an ordered
    /// disconnect is pending on the owner's side.
    MarkForDisconnect,
}

/// Session state shared between the orchestrator and the two channels.
pub struct SessionCore {
    /// Random token minted once per process.
    session_id: u64,
    /// State plus last-disconnect cause, mutated under one lock so the
    /// cross-thread `mark_for_disconnect` cannot interleave with a
    /// connect/disconnect flip.
    state: Mutex<(ConnState, Option<String>)>,
    /// Server-issued authorization handle; present only while connected.
    api_handle: RwLock<Option<String>>,
    /// Negotiated API version string.
    api_version: RwLock<Option<String>>,
    /// Liveness clock: last-data-received instant. Written only by the
    /// subscriber task, read by `is_alive` queries.
    last_rx: Mutex<Option<Instant>>,
    /// Cancel token consulted by every blocking primitive. Replaced with a
    /// fresh token on each connect.
    cancel: RwLock<CancellationToken>,
}

impl SessionCore {
    /// New disconnected session with a random per-process id.
    pub fn new() -> Self {
        Self {
            session_id: rand::random(),
            state: Mutex::new((ConnState::Disconnected, None)),
            api_handle: RwLock::new(None),
            api_version: RwLock::new(None),
            last_rx: Mutex::new(None),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// The per-process session identifier.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state.lock().0
    }

    /// Cause recorded by the most recent mark-for-disconnect, if any.
    pub fn disconnect_cause(&self) -> Option<String> {
        self.state.lock().1.clone()
    }

    /// Flip to `Connected`, clearing any stale cause. Refused when a
    /// mark-for-disconnect raced in since the connect sequence started: the
    /// mark and its cause always win over the flip.
    pub(crate) fn set_connected(&self) -> bool {
        let mut state = self.state.lock();
        if state.0 == ConnState::MarkForDisconnect {
            return false;
        }
        *state = (ConnState::Connected, None);
        true
    }

    /// Flip to `Disconnected`. The last cause is preserved for inspection.
    pub(crate) fn set_disconnected(&self) {
        self.state.lock().0 = ConnState::Disconnected;
    }

    /// Atomically record a pending disconnect with its cause.
    pub(crate) fn mark_for_disconnect(&self, cause: &str) {
        let mut state = self.state.lock();
        *state = (ConnState::MarkForDisconnect, Some(cause.to_string()));
    }

    /// Authorization handle, if the handshake completed.
    pub fn api_handle(&self) -> Option<String> {
        self.api_handle.read().clone()
    }

    pub(crate) fn set_api_handle(&self, handle: &str) {
        *self.api_handle.write() = Some(handle.to_string());
    }

    pub(crate) fn clear_api_handle(&self) {
        *self.api_handle.write() = None;
    }

    /// Negotiated API version, if the handshake completed.
    pub fn api_version(&self) -> Option<String> {
        self.api_version.read().clone()
    }

    pub(crate) fn set_api_version(&self, version: &str) {
        *self.api_version.write() = Some(version.to_string());
    }

    /// Record streaming data arrival.
    pub(crate) fn touch_rx(&self) {
        *self.last_rx.lock() = Some(Instant::now());
    }

    /// Clear the liveness clock (entering zombie state).
    pub(crate) fn clear_rx(&self) {
        *self.last_rx.lock() = None;
    }

    /// True when streaming data arrived within `window`.
    pub fn rx_within(&self, window: Duration) -> bool {
        self.last_rx.lock().is_some_and(|t| t.elapsed() < window)
    }

    /// The current cancel token. Clones observe the same cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    /// Install a fresh cancel token (start of a new connect cycle).
    pub(crate) fn reset_cancel(&self) {
        *self.cancel.write() = CancellationToken::new();
    }

    /// Trip the cancel token, unblocking every suspended primitive that
    /// consults it.
    pub(crate) fn trip_cancel(&self) {
        self.cancel.read().cancel();
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrow write capability handed to the subscriber: liveness updates and
/// disconnect marking only.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl SessionHandle {
    /// Wrap a session core.
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// Record streaming data arrival.
    pub(crate) fn touch_rx(&self) {
        self.core.touch_rx();
    }

    /// Clear the liveness clock.
    pub(crate) fn clear_rx(&self) {
        self.core.clear_rx();
    }

    /// Mark the session for an ordered disconnect.
    pub(crate) fn mark_for_disconnect(&self, cause: &str) {
        self.core.mark_for_disconnect(cause);
    }

    /// Force-unblock foreground calls (teardown signal).
    pub(crate) fn trip_cancel(&self) {
        self.core.trip_cancel();
    }
}
