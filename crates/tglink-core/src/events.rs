//! Link events and the broadcast emitter.
//!
//! Two event families share one enum: server-pushed events decoded from the
//! streaming channel (numeric-id wire contract, see [`ids`]) and events the
//! subscriber generates locally (stats snapshots, timeout/resume edges,
//! crash notification).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// Server event identifiers. These are wire values owned by the server
/// protocol and must stay byte-for-byte compatible.
pub mod ids {
    /// A port started transmitting.
    pub const PORT_STARTED: u64 = 0;
    /// A port stopped transmitting.
    pub const PORT_STOPPED: u64 = 1;
    /// A port was paused.
    pub const PORT_PAUSED: u64 = 2;
    /// A paused port resumed.
    pub const PORT_RESUMED: u64 = 3;
    /// A port finished its transmit job.
    pub const PORT_JOB_DONE: u64 = 4;
    /// A port was acquired, possibly forcibly.
    pub const PORT_ACQUIRED: u64 = 5;
    /// A port was released.
    pub const PORT_RELEASED: u64 = 6;
    /// A port hit an error condition.
    pub const PORT_ERROR: u64 = 7;
    /// A port attribute changed.
    pub const PORT_ATTR_CHANGED: u64 = 8;
    /// The server is shutting down.
    pub const SERVER_STOPPED: u64 = 100;
}

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Events delivered to session consumers, in wire arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Port started transmitting.
    PortStarted {
        /// Port index.
        port_id: u32,
    },
    /// Port stopped transmitting.
    PortStopped {
        /// Port index.
        port_id: u32,
    },
    /// Port paused.
    PortPaused {
        /// Port index.
        port_id: u32,
    },
    /// Port resumed.
    PortResumed {
        /// Port index.
        port_id: u32,
    },
    /// Port finished its transmit job.
    PortJobDone {
        /// Port index.
        port_id: u32,
    },
    /// Port acquired, possibly stolen from another session.
    PortAcquired {
        /// Port index.
        port_id: u32,
        /// User name of the acquirer.
        who: String,
        /// Session id of the acquirer.
        session_id: u64,
        /// True when the acquisition was forced.
        force: bool,
    },
    /// Port released.
    PortReleased {
        /// Port index.
        port_id: u32,
        /// User name of the releaser.
        who: String,
        /// Session id of the releaser.
        session_id: u64,
    },
    /// Port error condition.
    PortError {
        /// Port index.
        port_id: u32,
    },
    /// Port attribute changed.
    PortAttrChanged {
        /// Port index.
        port_id: u32,
        /// New attribute object.
        attr: Value,
    },
    /// Server is shutting down.
    ServerStopped {
        /// Cause string reported by the server.
        cause: String,
    },

    /// Global statistics snapshot.
    GlobalStats {
        /// Raw snapshot payload.
        data: Value,
        /// Treat this snapshot as the new delta reference point.
        baseline: bool,
    },
    /// Per-flow statistics snapshot.
    FlowStats {
        /// Raw snapshot payload.
        data: Value,
        /// Treat this snapshot as the new delta reference point.
        baseline: bool,
    },
    /// Latency statistics snapshot.
    LatencyStats {
        /// Raw snapshot payload.
        data: Value,
        /// Treat this snapshot as the new delta reference point.
        baseline: bool,
    },

    /// No data arrived on the streaming channel for the receive timeout.
    /// Edge-triggered: emitted once per silent period.
    SubscriberTimeout {
        /// The receive timeout that elapsed.
        timeout: Duration,
    },
    /// Data resumed after a silent period. Edge-triggered.
    SubscriberResumed,
    /// The receive loop died from an unrecovered error; the session can no
    /// longer trust event delivery.
    SubscriberCrashed {
        /// Rendered error.
        reason: String,
    },
}

fn port_id(data: &Value) -> Option<u32> {
    data.get("port_id").and_then(Value::as_u64).map(|v| v as u32)
}

/// Decode one server-pushed event by its numeric wire id.
///
/// Unknown ids and malformed payloads return `None`; the caller drops them
/// (the id set is closed today, but dropping keeps newer servers usable).
pub fn decode_server_event(id: u64, data: &Value) -> Option<LinkEvent> {
    let event = match id {
        ids::PORT_STARTED => LinkEvent::PortStarted { port_id: port_id(data)? },
        ids::PORT_STOPPED => LinkEvent::PortStopped { port_id: port_id(data)? },
        ids::PORT_PAUSED => LinkEvent::PortPaused { port_id: port_id(data)? },
        ids::PORT_RESUMED => LinkEvent::PortResumed { port_id: port_id(data)? },
        ids::PORT_JOB_DONE => LinkEvent::PortJobDone { port_id: port_id(data)? },
        ids::PORT_ACQUIRED => LinkEvent::PortAcquired {
            port_id: port_id(data)?,
            who: data.get("who")?.as_str()?.to_string(),
            session_id: data.get("session_id")?.as_u64()?,
            force: data.get("force").and_then(Value::as_bool).unwrap_or(false),
        },
        ids::PORT_RELEASED => LinkEvent::PortReleased {
            port_id: port_id(data)?,
            who: data.get("who")?.as_str()?.to_string(),
            session_id: data.get("session_id")?.as_u64()?,
        },
        ids::PORT_ERROR => LinkEvent::PortError { port_id: port_id(data)? },
        ids::PORT_ATTR_CHANGED => LinkEvent::PortAttrChanged {
            port_id: port_id(data)?,
            attr: data.get("attr").cloned().unwrap_or(Value::Null),
        },
        ids::SERVER_STOPPED => LinkEvent::ServerStopped {
            cause: data
                .get("cause")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
        other => {
            warn!(event_id = other, "unknown server event id, dropping");
            return None;
        }
    };
    Some(event)
}

/// Fan-out hub for session events.
///
/// Thin wrapper over a broadcast channel: emitting never waits, so the
/// streaming loop can publish from its hot path. A receiver that falls more
/// than the channel capacity behind loses its oldest events instead of
/// exerting backpressure on the loop.
pub struct EventEmitter {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Hub with a custom backlog capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver an event to every current receiver. Returns how many will
    /// see it; zero (nobody listening) is not an error.
    pub fn emit(&self, event: LinkEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// A receiver that observes events emitted from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared emitter handle.
pub type SharedEmitter = Arc<EventEmitter>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_port_lifecycle_events() {
        let data = json!({"port_id": 3});
        assert_eq!(
            decode_server_event(ids::PORT_STARTED, &data),
            Some(LinkEvent::PortStarted { port_id: 3 })
        );
        assert_eq!(
            decode_server_event(ids::PORT_STOPPED, &data),
            Some(LinkEvent::PortStopped { port_id: 3 })
        );
        assert_eq!(
            decode_server_event(ids::PORT_JOB_DONE, &data),
            Some(LinkEvent::PortJobDone { port_id: 3 })
        );
    }

    #[test]
    fn decode_port_acquired_with_metadata() {
        let data = json!({"port_id": 1, "who": "alice", "session_id": 42, "force": true});
        assert_eq!(
            decode_server_event(ids::PORT_ACQUIRED, &data),
            Some(LinkEvent::PortAcquired {
                port_id: 1,
                who: "alice".into(),
                session_id: 42,
                force: true,
            })
        );
    }

    #[test]
    fn decode_server_stopped() {
        let data = json!({"cause": "maintenance"});
        assert_eq!(
            decode_server_event(ids::SERVER_STOPPED, &data),
            Some(LinkEvent::ServerStopped {
                cause: "maintenance".into()
            })
        );
    }

    #[test]
    fn unknown_event_id_is_dropped() {
        assert_eq!(decode_server_event(9999, &json!({"port_id": 1})), None);
    }

    #[test]
    fn malformed_payload_is_dropped() {
        assert_eq!(decode_server_event(ids::PORT_STARTED, &json!({})), None);
        assert_eq!(
            decode_server_event(ids::PORT_ACQUIRED, &json!({"port_id": 1})),
            None
        );
    }

    #[test]
    fn emitting_into_the_void_is_harmless() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.emit(LinkEvent::SubscriberResumed), 0);
    }

    #[tokio::test]
    async fn every_receiver_sees_every_event() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        assert_eq!(emitter.emit(LinkEvent::PortStarted { port_id: 0 }), 2);
        assert_eq!(a.recv().await.unwrap(), LinkEvent::PortStarted { port_id: 0 });
        assert_eq!(b.recv().await.unwrap(), LinkEvent::PortStarted { port_id: 0 });
    }

    #[tokio::test]
    async fn receivers_start_from_their_subscription_point() {
        let emitter = EventEmitter::new();
        let _ = emitter.emit(LinkEvent::PortStopped { port_id: 1 });

        let mut rx = emitter.subscribe();
        let _ = emitter.emit(LinkEvent::PortStarted { port_id: 2 });
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::PortStarted { port_id: 2 });
        // The pre-subscription event never shows up.
        assert!(rx.try_recv().is_err());
    }
}
