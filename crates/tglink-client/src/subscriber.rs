//! Background subscriber for the streaming channel.
//!
//! One spawned task owns the stream transport and loops on bounded receives.
//! Arriving messages are decoded and fanned out through the shared
//! [`EventEmitter`]; silence and resumption are reported as edge-triggered
//! events. The loop never heals itself: a transport error flips the session
//! to mark-for-disconnect and the loop dies, leaving recovery to the
//! connection owner.
//!
//! The barrier protocol also lives here: [`Subscriber::barrier`] injects a
//! keyed marker through the command channel and waits for its acknowledgment
//! to come back around through the stream, proving both channels belong to
//! one live server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use tglink_core::errors::LinkError;
use tglink_core::events::{LinkEvent, SharedEmitter, decode_server_event};
use tglink_core::frame::FrameCodec;
use tglink_core::wire::{StreamMessage, channels, methods};

use crate::config::LinkConfig;
use crate::monitor::{DutyMonitor, DutySnapshot};
use crate::rpc::RpcClient;
use crate::session::SessionHandle;
use crate::transport::StreamTransport;

/// Barrier ack poll cadence and per-attempt budget.
const ACK_POLL: Duration = Duration::from_millis(1);
const ACK_POLLS_PER_ATTEMPT: u32 = 100;

/// Lifecycle of the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    /// No loop running.
    Dead = 0,
    /// Loop running, messages dispatched.
    Active = 1,
    /// Loop running, messages drained and discarded. The channel stays warm
    /// so a later reconnect does not race stale buffered traffic.
    Zombie = 2,
}

impl SubscriberState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SubscriberState::Active,
            2 => SubscriberState::Zombie,
            _ => SubscriberState::Dead,
        }
    }
}

/// Expected-key slot for the in-flight barrier attempt.
struct BarrierSlot {
    expected: Mutex<Option<u64>>,
    acked: AtomicBool,
}

impl BarrierSlot {
    fn arm(&self, key: u64) {
        *self.expected.lock() = Some(key);
        self.acked.store(false, Ordering::SeqCst);
    }

    fn disarm(&self) {
        *self.expected.lock() = None;
        self.acked.store(false, Ordering::SeqCst);
    }

    fn observe(&self, key: u64) {
        if *self.expected.lock() == Some(key) {
            self.acked.store(true, Ordering::SeqCst);
        }
    }

    fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

/// State shared between the owner-facing handle and the receive loop.
struct Shared {
    state: AtomicU8,
    emitter: SharedEmitter,
    session: SessionHandle,
    recv_timeout: Duration,
    interrupt_on_disconnect: bool,
    barrier: BarrierSlot,
    duty: Mutex<DutyMonitor>,
}

impl Shared {
    fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Decode and dispatch one frame. Returns the payload size for duty
    /// accounting. Malformed payloads are dropped, never fatal; the framing
    /// below us is length-delimited, so one bad body cannot desync the
    /// stream.
    fn handle_frame(&self, codec: &FrameCodec, frame: &Bytes) -> usize {
        let payload = match codec.decode(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "undecodable stream frame, dropping");
                return frame.len();
            }
        };
        let n = payload.len();

        // Zombie drains: no liveness credit, no dispatch.
        if self.state() != SubscriberState::Active {
            return n;
        }
        self.session.touch_rx();

        let msg: StreamMessage = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed stream message, dropping");
                return n;
            }
        };
        self.dispatch(&msg);
        n
    }

    fn dispatch(&self, msg: &StreamMessage) {
        match msg.name.as_str() {
            channels::GLOBAL_STATS => {
                let _ = self.emitter.emit(LinkEvent::GlobalStats {
                    data: msg.data.clone(),
                    baseline: msg.baseline,
                });
            }
            channels::FLOW_STATS => {
                let _ = self.emitter.emit(LinkEvent::FlowStats {
                    data: msg.data.clone(),
                    baseline: msg.baseline,
                });
            }
            channels::LATENCY_STATS => {
                let _ = self.emitter.emit(LinkEvent::LatencyStats {
                    data: msg.data.clone(),
                    baseline: msg.baseline,
                });
            }
            channels::SERVER_EVENT => {
                let Some(id) = msg.type_tag.as_u64() else {
                    warn!(tag = %msg.type_tag, "non-numeric server event id, dropping");
                    return;
                };
                let Some(event) = decode_server_event(id, &msg.data) else {
                    return;
                };
                if let LinkEvent::ServerStopped { cause } = &event {
                    self.on_server_stopped(cause);
                }
                let _ = self.emitter.emit(event);
            }
            channels::BARRIER_ACK => {
                if let Some(key) = msg.type_tag.as_u64() {
                    self.barrier.observe(key);
                }
            }
            other => {
                warn!(channel = other, "unknown stream channel, dropping");
            }
        }
    }

    /// Server announced shutdown: stop trusting the stream and schedule an
    /// ordered disconnect on the owner's side.
    fn on_server_stopped(&self, cause: &str) {
        warn!(cause, "server stopped, marking session for disconnect");
        self.state
            .store(SubscriberState::Zombie as u8, Ordering::SeqCst);
        self.session.clear_rx();
        self.session
            .mark_for_disconnect(&format!("server stopped: {cause}"));
        if self.interrupt_on_disconnect {
            self.session.trip_cancel();
        }
    }

    /// Loop died on a transport error. Ordered stops set the state to
    /// `Dead` beforehand and skip this path.
    fn on_crash(&self, reason: &str) {
        let prev = self
            .state
            .swap(SubscriberState::Dead as u8, Ordering::SeqCst);
        if SubscriberState::from_u8(prev) == SubscriberState::Dead {
            return;
        }
        error!(reason, "subscriber loop crashed");
        self.session.clear_rx();
        let _ = self.emitter.emit(LinkEvent::SubscriberCrashed {
            reason: reason.to_string(),
        });
        self.session
            .mark_for_disconnect(&format!("subscriber crashed: {reason}"));
        if self.interrupt_on_disconnect {
            self.session.trip_cancel();
        }
    }
}

/// Owner-facing handle of the streaming subscriber.
pub struct Subscriber {
    shared: Arc<Shared>,
    barrier_gate: tokio::sync::Mutex<()>,
    barrier_timeout: Duration,
    run: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl Subscriber {
    /// Subscriber bound to a session and emitter. The loop starts later via
    /// [`Subscriber::start`].
    pub fn new(cfg: &LinkConfig, session: SessionHandle, emitter: SharedEmitter) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(SubscriberState::Dead as u8),
                emitter,
                session,
                recv_timeout: cfg.recv_timeout,
                interrupt_on_disconnect: cfg.interrupt_on_disconnect,
                barrier: BarrierSlot {
                    expected: Mutex::new(None),
                    acked: AtomicBool::new(false),
                },
                duty: Mutex::new(DutyMonitor::new()),
            }),
            barrier_gate: tokio::sync::Mutex::new(()),
            barrier_timeout: cfg.barrier_timeout,
            run: Mutex::new(None),
        }
    }

    /// Current loop state.
    pub fn state(&self) -> SubscriberState {
        self.shared.state()
    }

    /// True while the loop runs and dispatches.
    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Smoothed duty-cycle view of the receive loop.
    pub fn duty(&self) -> DutySnapshot {
        self.shared.duty.lock().snapshot()
    }

    /// Spawn the receive loop over a fresh stream transport.
    pub fn start(&self, transport: Box<dyn StreamTransport>) {
        let stop = CancellationToken::new();
        *self.shared.duty.lock() = DutyMonitor::new();
        self.shared
            .state
            .store(SubscriberState::Active as u8, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_loop(shared, transport, stop.clone()));
        *self.run.lock() = Some((task, stop));
    }

    /// Ordered stop: ends the loop without the crash path and waits for it.
    pub async fn stop(&self) {
        let run = self.run.lock().take();
        if let Some((task, stop)) = run {
            self.shared
                .state
                .store(SubscriberState::Dead as u8, Ordering::SeqCst);
            stop.cancel();
            let _ = task.await;
        }
        self.shared.session.clear_rx();
        self.shared.barrier.disarm();
    }

    /// Flip an active loop to zombie: keep draining the socket, stop
    /// dispatching, stop crediting liveness.
    pub fn set_zombie(&self) {
        let _ = self.shared.state.compare_exchange(
            SubscriberState::Active as u8,
            SubscriberState::Zombie as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.shared.session.clear_rx();
    }

    /// One barrier round trip: inject a random key through the command
    /// channel, wait for its acknowledgment on the stream. Concurrent
    /// callers are serialized; the round re-publishes its key until the
    /// deadline.
    pub async fn barrier(&self, rpc: &RpcClient, baseline: bool) -> Result<(), LinkError> {
        let _gate = self.barrier_gate.lock().await;
        let deadline = Instant::now() + self.barrier_timeout;

        // One key per round, re-published on every attempt: an ack that
        // arrives later than one attempt's poll window still satisfies the
        // round instead of being discarded as foreign.
        let key = u64::from(rand::random::<u32>());
        self.shared.barrier.arm(key);

        loop {
            trace!(key, baseline, "barrier attempt");
            let sent = rpc
                .call(methods::PUBLISH_NOW, json!({ "key": key, "baseline": baseline }))
                .await;
            if let Err(e) = sent {
                self.shared.barrier.disarm();
                return Err(e);
            }

            for _ in 0..ACK_POLLS_PER_ATTEMPT {
                if self.shared.barrier.is_acked() {
                    self.shared.barrier.disarm();
                    debug!(key, "barrier acknowledged");
                    return Ok(());
                }
                sleep(ACK_POLL).await;
            }

            if Instant::now() >= deadline {
                self.shared.barrier.disarm();
                return Err(LinkError::BarrierTimeout(format!(
                    "no barrier acknowledgment within {:?}",
                    self.barrier_timeout
                )));
            }
        }
    }
}

/// The receive loop. Bounded receives; silence raises the edge-triggered
/// timeout event, resumption raises its counterpart.
async fn run_loop(shared: Arc<Shared>, mut transport: Box<dyn StreamTransport>, stop: CancellationToken) {
    let codec = FrameCodec::default();
    // Starved until the first frame: startup silence is not an edge, and the
    // first data to ever arrive reports the stream as resumed.
    let mut starved = true;

    let crash_reason = loop {
        let received = tokio::select! {
            () = stop.cancelled() => break None,
            res = timeout(shared.recv_timeout, transport.recv()) => res,
        };

        match received {
            Err(_) => {
                // Silence. Report the edge once, and only while dispatching.
                if !starved && shared.state() == SubscriberState::Active {
                    starved = true;
                    let _ = shared.emitter.emit(LinkEvent::SubscriberTimeout {
                        timeout: shared.recv_timeout,
                    });
                }
            }
            Ok(Err(e)) => break Some(format!("stream receive failed: {e}")),
            Ok(Ok(frame)) => {
                if starved {
                    starved = false;
                    if shared.state() == SubscriberState::Active {
                        let _ = shared.emitter.emit(LinkEvent::SubscriberResumed);
                    }
                }
                let started = Instant::now();
                let bytes = shared.handle_frame(&codec, &frame);
                if let Some(snap) = shared.duty.lock().record(started.elapsed(), bytes) {
                    trace!(
                        busy_fraction = snap.busy_fraction,
                        bits_per_sec = snap.bits_per_sec,
                        "subscriber duty"
                    );
                }
            }
        }
    };

    match crash_reason {
        None => {
            shared
                .state
                .store(SubscriberState::Dead as u8, Ordering::SeqCst);
        }
        Some(reason) => shared.on_crash(&reason),
    }
}
