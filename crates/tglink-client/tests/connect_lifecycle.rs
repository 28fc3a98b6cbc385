//! End-to-end lifecycle tests against a scripted in-memory server.
//!
//! The fake server answers the command channel per a per-test script and
//! echoes barrier keys back through the streaming channel, exercising the
//! full connect sequence without sockets.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tglink_client::{
    ConnState, Connection, Connector, LinkConfig, LinkError, RequestTransport, StreamTransport,
};
use tglink_core::events::{LinkEvent, ids};
use tglink_core::frame::FrameCodec;

/// Per-test behavior knobs of the fake server.
#[derive(Debug, Clone, Copy, Default)]
struct Script {
    refuse_request: bool,
    refuse_stream: bool,
    reject_handshake: bool,
    mute_barrier: bool,
    /// Method the server swallows without replying.
    hang_method: Option<&'static str>,
}

struct ChanRequest {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl RequestTransport for ChanRequest {
    async fn send(&mut self, payload: Bytes) -> io::Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server gone"))
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "server gone"))
    }
}

struct ChanStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl StreamTransport for ChanStream {
    async fn recv(&mut self) -> io::Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "server gone"))
    }
}

/// Scripted connector: each `connect_request` spawns a fresh server task,
/// each `connect_stream` installs a fresh stream sender the test (and the
/// barrier echo) can push through.
struct FakeConnector {
    script: Script,
    stream_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeConnector {
    fn new(script: Script) -> Self {
        Self {
            script,
            stream_tx: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_request(&self) -> io::Result<Box<dyn RequestTransport>> {
        if self.script.refuse_request {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (to_server, mut server_rx) = mpsc::unbounded_channel::<Bytes>();
        let (server_tx, from_server) = mpsc::unbounded_channel::<Bytes>();
        let script = self.script;
        let stream_slot = Arc::clone(&self.stream_tx);
        let log = Arc::clone(&self.requests);

        let _ = tokio::spawn(async move {
            let codec = FrameCodec::default();
            while let Some(frame) = server_rx.recv().await {
                let payload = codec.decode(&frame).expect("client sent corrupt frame");
                let req: Value = serde_json::from_slice(&payload).expect("client sent bad json");
                log.lock().unwrap().push(req.clone());
                let id = req["id"].clone();
                let method = req["method"].as_str().unwrap_or("");

                if script.hang_method == Some(method) {
                    continue;
                }

                let reply = match method {
                    "api_sync_v2" => {
                        if script.reject_handshake {
                            json!({"jsonrpc": "2.0", "id": id,
                                   "error": {"code": -32601, "message": "unknown method"}})
                        } else {
                            json!({"jsonrpc": "2.0", "id": id,
                                   "result": {"api_h": "HANDLE", "api_vers": "1.0"}})
                        }
                    }
                    "publish_now" => {
                        if !script.mute_barrier {
                            if let Some(tx) = stream_slot.lock().unwrap().as_ref() {
                                let ack = json!({"name": "barrier_ack",
                                                 "type": req["params"]["key"], "data": {}});
                                let _ =
                                    tx.send(Bytes::from(serde_json::to_vec(&ack).unwrap()));
                            }
                        }
                        json!({"jsonrpc": "2.0", "id": id, "result": null})
                    }
                    _ => json!({"jsonrpc": "2.0", "id": id, "result": "ok"}),
                };
                let _ = server_tx.send(Bytes::from(serde_json::to_vec(&reply).unwrap()));
            }
        });

        Ok(Box::new(ChanRequest {
            tx: to_server,
            rx: from_server,
        }))
    }

    async fn connect_stream(&self) -> io::Result<Box<dyn StreamTransport>> {
        if self.script.refuse_stream {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.stream_tx.lock().unwrap() = Some(tx);
        Ok(Box::new(ChanStream { rx }))
    }
}

fn harness(script: Script) -> (Connection, Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>, FakeHandles) {
    let connector = FakeConnector::new(script);
    let stream_tx = Arc::clone(&connector.stream_tx);
    let requests = Arc::clone(&connector.requests);
    let conn = Connection::new(LinkConfig::default(), Box::new(connector));
    (conn, stream_tx, FakeHandles { requests })
}

struct FakeHandles {
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeHandles {
    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

fn push(slot: &Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>, v: &Value) {
    let guard = slot.lock().unwrap();
    let tx = guard.as_ref().expect("streaming channel not open");
    tx.send(Bytes::from(serde_json::to_vec(v).unwrap())).unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_connect_disconnect_reconnect() {
    let (conn, stream, server) = harness(Script::default());

    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.api_version().as_deref(), Some("1.0"));

    // Handshake carried identity and session id; it ran before anything else.
    let reqs = server.requests();
    assert_eq!(reqs[0]["method"], "api_sync_v2");
    assert_eq!(reqs[0]["params"]["name"], "tglink");
    assert_eq!(
        reqs[0]["params"]["session_id"].as_u64().unwrap(),
        conn.session_id()
    );

    // The barrier ack credited liveness.
    assert!(conn.is_alive());

    // Later calls carry the authorization handle.
    let result = conn.transmit("ping", json!({})).await.unwrap();
    assert_eq!(result, json!("ok"));
    let reqs = server.requests();
    assert_eq!(reqs.last().unwrap()["params"]["api_h"], "HANDLE");

    // Streamed stats fan out as events.
    let mut events = conn.subscribe_events();
    push(&stream, &json!({"name": "global_stats", "data": {"tx_bps": 7}}));
    assert_matches!(
        events.recv().await.unwrap(),
        LinkEvent::GlobalStats { data, baseline: false } if data == json!({"tx_bps": 7})
    );

    conn.disconnect().await;
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert!(!conn.is_alive());
    assert_matches!(
        conn.transmit("ping", json!({})).await,
        Err(LinkError::NotConnected)
    );

    // Re-entrant connect works on the same connection object.
    conn.connect().await.unwrap();
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn refused_command_channel_leaves_no_partial_state() {
    let (conn, _stream, _server) = harness(Script {
        refuse_request: true,
        ..Script::default()
    });

    let err = conn.connect().await.unwrap_err();
    assert_matches!(err, LinkError::Transport(msg) if msg.contains("command channel"));
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert_matches!(
        conn.transmit("ping", json!({})).await,
        Err(LinkError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_leaves_no_partial_state() {
    let (conn, stream, _server) = harness(Script {
        reject_handshake: true,
        ..Script::default()
    });

    let err = conn.connect().await.unwrap_err();
    assert_matches!(err, LinkError::VersionMismatch(_));
    assert_eq!(conn.state(), ConnState::Disconnected);
    // The streaming channel was never opened.
    assert!(stream.lock().unwrap().is_none());
    assert_matches!(
        conn.transmit("ping", json!({})).await,
        Err(LinkError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn refused_streaming_channel_leaves_no_partial_state() {
    let (conn, _stream, _server) = harness(Script {
        refuse_stream: true,
        ..Script::default()
    });

    let err = conn.connect().await.unwrap_err();
    assert_matches!(err, LinkError::Transport(msg) if msg.contains("streaming channel"));
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert_matches!(
        conn.transmit("ping", json!({})).await,
        Err(LinkError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn silent_barrier_leaves_no_partial_state() {
    let (conn, _stream, _server) = harness(Script {
        mute_barrier: true,
        ..Script::default()
    });

    let err = conn.connect().await.unwrap_err();
    assert_matches!(err, LinkError::BarrierTimeout(_));
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert_matches!(
        conn.transmit("ping", json!({})).await,
        Err(LinkError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn server_stopped_push_marks_the_session() {
    let (conn, stream, _server) = harness(Script::default());
    conn.connect().await.unwrap();
    let mut events = conn.subscribe_events();

    push(
        &stream,
        &json!({"name": "server_event", "type": ids::SERVER_STOPPED,
                "data": {"cause": "maintenance"}}),
    );

    assert_eq!(
        events.recv().await.unwrap(),
        LinkEvent::ServerStopped {
            cause: "maintenance".into()
        }
    );
    assert!(conn.is_marked_for_disconnect());
    assert!(conn.disconnect_cause().unwrap().contains("maintenance"));
    assert!(!conn.is_alive());

    // The ordered disconnect is still the owner's call, and it succeeds.
    conn.disconnect().await;
    assert_eq!(conn.state(), ConnState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn stream_death_crashes_subscriber_and_marks_session() {
    let (conn, stream, _server) = harness(Script::default());
    conn.connect().await.unwrap();
    let mut events = conn.subscribe_events();

    // Kill the streaming channel out from under the subscriber.
    let _ = stream.lock().unwrap().take();

    assert_matches!(
        events.recv().await.unwrap(),
        LinkEvent::SubscriberCrashed { .. }
    );
    assert!(conn.is_marked_for_disconnect());
    conn.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn mark_for_disconnect_interrupts_foreground_call() {
    let connector = FakeConnector::new(Script {
        hang_method: Some("block_forever"),
        ..Script::default()
    });
    let cfg = LinkConfig {
        interrupt_on_disconnect: true,
        ..LinkConfig::default()
    };
    let conn = Arc::new(Connection::new(cfg, Box::new(connector)));
    conn.connect().await.unwrap();

    let caller = Arc::clone(&conn);
    let task = tokio::spawn(async move { caller.transmit("block_forever", json!({})).await });

    // Let the call reach its receive leg, then pull the plug.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    conn.mark_for_disconnect("operator abort");

    let err = timeout(Duration::from_secs(5), task)
        .await
        .expect("interrupt must unblock the call")
        .unwrap()
        .unwrap_err();
    assert_matches!(err, LinkError::Interrupted(_));
    assert!(conn.is_marked_for_disconnect());
}

#[tokio::test(start_paused = true)]
async fn stale_stream_traffic_does_not_leak_after_disconnect() {
    let (conn, stream, _server) = harness(Script::default());
    conn.connect().await.unwrap();
    let mut events = conn.subscribe_events();

    conn.disconnect().await;

    // A sender from the old session may still hold buffered traffic; none of
    // it may surface as events.
    if let Some(tx) = stream.lock().unwrap().as_ref() {
        let v = json!({"name": "global_stats", "data": {"tx_bps": 1}});
        let _ = tx.send(Bytes::from(serde_json::to_vec(&v).unwrap()));
    }
    assert!(timeout(Duration::from_secs(1), events.recv()).await.is_err());
}
