//! Connection orchestrator.
//!
//! Owns the whole session: the command-channel RPC client, the streaming
//! subscriber, the shared session state, and the event emitter. `connect`
//! runs the full establishment sequence and flips to connected only after
//! every step proved out; any failure tears down whatever had opened, so a
//! session is never half-connected.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use tglink_core::errors::LinkError;
use tglink_core::events::{EventEmitter, LinkEvent, SharedEmitter};
use tglink_core::wire::{RpcResult, codes, methods};

use crate::config::LinkConfig;
use crate::monitor::DutySnapshot;
use crate::rpc::{RpcCall, RpcClient};
use crate::session::{ConnState, SessionCore, SessionHandle};
use crate::subscriber::Subscriber;
use crate::transport::{Connector, TcpConnector};

/// Client identity presented during the handshake.
const CLIENT_NAME: &str = "tglink";
const API_MAJOR: u64 = 1;
const API_MINOR: u64 = 0;

/// One client session against one server.
pub struct Connection {
    cfg: LinkConfig,
    connector: Box<dyn Connector>,
    session: Arc<SessionCore>,
    emitter: SharedEmitter,
    rpc: RpcClient,
    subscriber: Subscriber,
    /// Serializes connect/disconnect; everything else is lock-free against
    /// the lifecycle.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Connection over an injected channel factory.
    pub fn new(cfg: LinkConfig, connector: Box<dyn Connector>) -> Self {
        let session = Arc::new(SessionCore::new());
        let emitter: SharedEmitter = Arc::new(EventEmitter::new());
        let rpc = RpcClient::new(&cfg, Arc::clone(&session));
        let subscriber = Subscriber::new(
            &cfg,
            SessionHandle::new(Arc::clone(&session)),
            Arc::clone(&emitter),
        );
        Self {
            cfg,
            connector,
            session,
            emitter,
            rpc,
            subscriber,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Production connection: TCP channels at the configured endpoints.
    pub fn tcp(cfg: LinkConfig) -> Self {
        let connector = Box::new(TcpConnector::new(
            cfg.server.clone(),
            cfg.sync_port,
            cfg.async_port,
        ));
        Self::new(cfg, connector)
    }

    /// Establish the session: command channel, handshake, streaming channel,
    /// one barrier round trip. Re-entrant; any prior session is torn down
    /// first.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
        self.session.reset_cancel();

        let request = self.connector.connect_request().await.map_err(|e| {
            LinkError::Transport(format!("failed to open command channel: {e}"))
        })?;
        self.rpc.open(request).await;

        if let Err(e) = self.handshake().await {
            self.teardown().await;
            return Err(e);
        }

        let stream = match self.connector.connect_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.teardown().await;
                return Err(LinkError::Transport(format!(
                    "failed to open streaming channel: {e}"
                )));
            }
        };
        self.subscriber.start(stream);

        // End-to-end proof: the key must travel out the command channel and
        // come back around through the stream.
        if let Err(e) = self.subscriber.barrier(&self.rpc, true).await {
            self.teardown().await;
            return Err(e);
        }

        // A fatal condition may have been marked from the receive task while
        // the sequence ran; the mark wins over the flip.
        if !self.session.set_connected() {
            let cause = self
                .session
                .disconnect_cause()
                .unwrap_or_else(|| "unknown".to_string());
            self.teardown().await;
            return Err(LinkError::Transport(format!(
                "session marked for disconnect during connect: {cause}"
            )));
        }
        info!(
            server = %self.cfg.server,
            session_id = self.session.session_id(),
            api_version = self.session.api_version().as_deref().unwrap_or("?"),
            "connected"
        );
        Ok(())
    }

    /// Ordered teardown: subscriber first, then the RPC client. Idempotent;
    /// disconnecting a disconnected session is a no-op.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.session.state() != ConnState::Disconnected {
            info!(session_id = self.session.session_id(), "disconnecting");
        }
        self.teardown().await;
    }

    /// Record a fatal condition from any task: mute the subscriber, flag the
    /// session, optionally unblock a stuck foreground call. The ordered
    /// disconnect remains the owner's responsibility.
    pub fn mark_for_disconnect(&self, cause: &str) {
        warn!(cause, "session marked for disconnect");
        self.subscriber.set_zombie();
        self.session.mark_for_disconnect(cause);
        if self.cfg.interrupt_on_disconnect {
            self.session.trip_cancel();
        }
    }

    /// Connected and streaming data arrived within the liveness window.
    pub fn is_alive(&self) -> bool {
        self.session.state() == ConnState::Connected
            && self.session.rx_within(self.cfg.liveness_window)
    }

    /// Issue one call on the command channel.
    pub async fn transmit(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        self.ensure_connected()?;
        self.rpc.call(method, params).await
    }

    /// Issue a batch on the command channel.
    pub async fn transmit_batch(&self, calls: &[RpcCall]) -> Result<Vec<RpcResult>, LinkError> {
        self.ensure_connected()?;
        self.rpc.call_batch(calls).await
    }

    /// One barrier round trip on the established session.
    pub async fn barrier(&self, baseline: bool) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.subscriber.barrier(&self.rpc, baseline).await
    }

    /// The session's event emitter; subscribe for stats, server events, and
    /// subscriber lifecycle notifications.
    pub fn events(&self) -> &EventEmitter {
        self.emitter.as_ref()
    }

    /// Convenience: a fresh event receiver.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<LinkEvent> {
        self.emitter.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.session.state()
    }

    /// True while fully connected.
    pub fn is_connected(&self) -> bool {
        self.session.state() == ConnState::Connected
    }

    /// True when a fatal condition awaits an ordered disconnect.
    pub fn is_marked_for_disconnect(&self) -> bool {
        self.session.state() == ConnState::MarkForDisconnect
    }

    /// Cause of the pending or most recent disconnect.
    pub fn disconnect_cause(&self) -> Option<String> {
        self.session.disconnect_cause()
    }

    /// The per-process session identifier sent during the handshake.
    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }

    /// Negotiated API version, if connected at least once.
    pub fn api_version(&self) -> Option<String> {
        self.session.api_version()
    }

    /// Duty-cycle view of the streaming receive loop.
    pub fn subscriber_duty(&self) -> DutySnapshot {
        self.subscriber.duty()
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.session.state() == ConnState::Connected {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    /// Version/session handshake on the freshly opened command channel.
    async fn handshake(&self) -> Result<(), LinkError> {
        let params = json!({
            "name": CLIENT_NAME,
            "major": API_MAJOR,
            "minor": API_MINOR,
            "session_id": self.session.session_id(),
        });
        let result = match self.rpc.call(methods::API_SYNC, params).await {
            Ok(v) => v,
            Err(LinkError::Server { code, message }) if code == codes::METHOD_NOT_SUPPORTED => {
                return Err(LinkError::VersionMismatch(format!(
                    "server does not support {} (client {API_MAJOR}.{API_MINOR}): {message}",
                    methods::API_SYNC
                )));
            }
            Err(e) => return Err(e),
        };

        let handle = result
            .get("api_h")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LinkError::Protocol(format!("handshake reply missing api_h: {result}"))
            })?;
        self.session.set_api_handle(handle);

        let version = result
            .get("api_vers")
            .and_then(Value::as_str)
            .map_or_else(|| format!("{API_MAJOR}.{API_MINOR}"), str::to_string);
        self.session.set_api_version(&version);
        Ok(())
    }

    /// Stop both channels and drop session artifacts. Caller holds the
    /// lifecycle lock.
    async fn teardown(&self) {
        self.subscriber.stop().await;
        self.rpc.close().await;
        self.session.clear_api_handle();
        self.session.set_disconnected();
    }
}
