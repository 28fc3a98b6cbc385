//! Synchronous request/response client over the command channel.
//!
//! One outstanding exchange at a time: the transport handle lives under an
//! async mutex held for the full send/receive round trip (the underlying
//! strict req/reply discipline cannot interleave exchanges). Each leg is
//! bounded by the configured timeout and retried within its budget; a hard
//! failure or an exhausted budget closes the transport for good — a
//! half-completed exchange would desynchronize the channel, so the client
//! never resumes the same handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tglink_core::errors::LinkError;
use tglink_core::frame::FrameCodec;
use tglink_core::wire::{RpcRequest, RpcResult, codes, methods, parse_response};

use crate::config::LinkConfig;
use crate::session::SessionCore;
use crate::transport::RequestTransport;

/// One entry of a batch: method plus parameter map.
#[derive(Debug, Clone)]
pub struct RpcCall {
    /// Method name.
    pub method: String,
    /// Parameter map.
    pub params: Value,
}

impl RpcCall {
    /// Build a batch entry.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Why a bounded transport leg did not complete.
enum LegFailure {
    TimedOut,
    Cancelled,
}

/// JSON-RPC client for the command channel.
pub struct RpcClient {
    transport: tokio::sync::Mutex<Option<Box<dyn RequestTransport>>>,
    connected: AtomicBool,
    id_gen: AtomicU64,
    session: Arc<SessionCore>,
    codec: FrameCodec,
    timeout: Duration,
    retry: u32,
    poll_interval: Duration,
    poll_budget: u32,
    chunk_size: usize,
}

impl RpcClient {
    /// Client bound to a session. The transport is attached later via
    /// [`RpcClient::open`].
    pub fn new(cfg: &LinkConfig, session: Arc<SessionCore>) -> Self {
        Self {
            transport: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            id_gen: AtomicU64::new(1),
            session,
            codec: FrameCodec::new(cfg.compress_threshold),
            timeout: cfg.timeout,
            retry: cfg.retry,
            poll_interval: cfg.poll_interval,
            poll_budget: cfg.poll_budget(),
            chunk_size: cfg.batch_chunk_size,
        }
    }

    /// Attach an open transport. Replaces any previous handle.
    pub async fn open(&self, transport: Box<dyn RequestTransport>) {
        *self.transport.lock().await = Some(transport);
        self.connected.store(true, Ordering::Release);
    }

    /// Close the transport, if open.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        *self.transport.lock().await = None;
    }

    /// True while a transport handle is attached.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.id_gen.fetch_add(1, Ordering::Relaxed)
    }

    fn build_request(&self, method: &str, params: Value) -> RpcRequest {
        RpcRequest::new(
            method,
            params,
            self.next_id(),
            self.session.api_handle().as_deref(),
        )
    }

    /// Issue one call, transparently driving the async-job sub-protocol.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        self.call_with_retry(method, params, self.retry).await
    }

    /// Issue one call with an explicit transport retry budget.
    pub async fn call_with_retry(
        &self,
        method: &str,
        params: Value,
        retry: u32,
    ) -> Result<Value, LinkError> {
        let cancel = self.session.cancel_token();
        let rc = self
            .invoke(method, &params, retry, Some(&cancel))
            .await?;

        match rc.err_code() {
            Some(codes::TRY_AGAIN | codes::WORK_IN_PROGRESS) => {
                self.long_poll(method, &params, retry, rc, &cancel).await
            }
            _ => rc.into_result(),
        }
    }

    /// Encode many requests into chunked wire messages and await each chunk
    /// independently. The output always has one entry per input call, in
    /// input order; entries of a failed chunk are tagged individually so
    /// partial success survives.
    pub async fn call_batch(&self, calls: &[RpcCall]) -> Result<Vec<RpcResult>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let cancel = self.session.cancel_token();
        let mut chunks: Vec<Vec<Value>> = Vec::new();
        let mut current: Vec<Value> = Vec::new();
        let mut size = 0usize;
        for call in calls {
            let env = serde_json::to_value(self.build_request(&call.method, call.params.clone()))
                .map_err(|e| LinkError::Protocol(format!("failed to encode request: {e}")))?;
            size += env.to_string().len();
            current.push(env);
            if size > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
                size = 0;
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let mut results = Vec::with_capacity(calls.len());
        for chunk in &chunks {
            match self.exchange_chunk(chunk, &cancel).await {
                Ok(mut rcs) => results.append(&mut rcs),
                Err(e) => {
                    warn!(error = %e, chunk_len = chunk.len(), "batch chunk failed");
                    results.extend(chunk.iter().map(|_| RpcResult::from_link_error(&e)));
                }
            }
        }

        debug_assert_eq!(results.len(), calls.len());
        Ok(results)
    }

    async fn exchange_chunk(
        &self,
        chunk: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<RpcResult>, LinkError> {
        let buf = serde_json::to_vec(chunk)
            .map_err(|e| LinkError::Protocol(format!("failed to encode batch: {e}")))?;
        let reply = self.exchange(&buf, self.retry, Some(cancel)).await?;
        let rcs = parse_response(&reply)?;
        if rcs.len() != chunk.len() {
            return Err(LinkError::Protocol(format!(
                "batch reply arity mismatch: sent {}, got {}",
                chunk.len(),
                rcs.len()
            )));
        }
        Ok(rcs)
    }

    /// One request, one normalized reply. No async-job handling.
    async fn invoke(
        &self,
        method: &str,
        params: &Value,
        retry: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<RpcResult, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let req = self.build_request(method, params.clone());
        let buf = serde_json::to_vec(&req)
            .map_err(|e| LinkError::Protocol(format!("failed to encode request: {e}")))?;
        let reply = self.exchange(&buf, retry, cancel).await?;
        let mut results = parse_response(&reply)?;
        if results.len() != 1 {
            return Err(LinkError::Protocol(format!(
                "expected a single reply, got {}",
                results.len()
            )));
        }
        results
            .pop()
            .ok_or_else(|| LinkError::Protocol("empty reply".to_string()))
    }

    /// Full round trip under the transport lock. Any exit other than a
    /// successful reply leaves the transport closed.
    async fn exchange(
        &self,
        buf: &[u8],
        retry: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes, LinkError> {
        let mut guard = self.transport.lock().await;
        let mut transport = guard.take().ok_or(LinkError::NotConnected)?;
        let payload = self.codec.encode(buf);

        // Send leg.
        let mut left = retry;
        loop {
            match self.bounded(transport.send(payload.clone()), cancel).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Transport(format!("send failed: {e}")));
                }
                Err(LegFailure::TimedOut) => {
                    if left == 0 {
                        self.connected.store(false, Ordering::Release);
                        return Err(LinkError::Transport(
                            "failed to send message to server".to_string(),
                        ));
                    }
                    left -= 1;
                }
                Err(LegFailure::Cancelled) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Interrupted("send cancelled".to_string()));
                }
            }
        }

        // Receive leg.
        let mut left = retry;
        let frame = loop {
            match self.bounded(transport.recv(), cancel).await {
                Ok(Ok(frame)) => break frame,
                Ok(Err(e)) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Transport(format!("receive failed: {e}")));
                }
                Err(LegFailure::TimedOut) => {
                    if left == 0 {
                        self.connected.store(false, Ordering::Release);
                        return Err(LinkError::Transport(
                            "failed to get server response".to_string(),
                        ));
                    }
                    left -= 1;
                }
                Err(LegFailure::Cancelled) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(LinkError::Interrupted("receive cancelled".to_string()));
                }
            }
        };

        *guard = Some(transport);
        drop(guard);

        Ok(self.codec.decode(&frame)?)
    }

    /// Bound a transport leg by the per-call timeout and, when supplied,
    /// the session cancel token.
    async fn bounded<F, T>(&self, fut: F, cancel: Option<&CancellationToken>) -> Result<T, LegFailure>
    where
        F: std::future::Future<Output = T>,
    {
        match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Err(LegFailure::Cancelled),
                    res = timeout(self.timeout, fut) => res.map_err(|_| LegFailure::TimedOut),
                }
            }
            None => timeout(self.timeout, fut)
                .await
                .map_err(|_| LegFailure::TimedOut),
        }
    }

    /// Drive the long-poll sub-protocol after a "try again" or
    /// "work in progress" reply. One shared attempt budget covers both
    /// phases, matching the overall async-job window.
    async fn long_poll(
        &self,
        method: &str,
        params: &Value,
        retry: u32,
        mut rc: RpcResult,
        cancel: &CancellationToken,
    ) -> Result<Value, LinkError> {
        let mut tries = self.poll_budget;

        // Server transiently busy: resend the original call.
        while rc.err_code() == Some(codes::TRY_AGAIN) {
            if tries == 0 {
                return Err(LinkError::ServerBusy(format!(
                    "server stayed busy for {:?}",
                    self.poll_interval * self.poll_budget
                )));
            }
            tries -= 1;
            self.poll_sleep(cancel).await?;
            rc = self.invoke(method, params, retry, Some(cancel)).await?;
        }

        // Accepted with a ticket: poll for the eventual result.
        loop {
            let ticket_msg = match &rc {
                RpcResult::Err { code, message } if *code == codes::WORK_IN_PROGRESS => {
                    message.clone()
                }
                _ => break,
            };
            let ticket: i64 = ticket_msg.trim().parse().map_err(|_| {
                LinkError::Protocol(format!("malformed async ticket id: {ticket_msg:?}"))
            })?;
            let ticket_params = json!({ "ticket_id": ticket });

            if tries == 0 {
                self.cancel_async_task(&ticket_params).await;
                return Err(LinkError::Timeout(format!(
                    "async job {ticket} did not finish within {:?}",
                    self.poll_interval * self.poll_budget
                )));
            }
            tries -= 1;

            if let Err(e) = self.poll_sleep(cancel).await {
                self.cancel_async_task(&ticket_params).await;
                return Err(e);
            }

            rc = match self
                .invoke(methods::GET_ASYNC_RESULTS, &ticket_params, retry, Some(cancel))
                .await
            {
                Ok(rc) => rc,
                Err(e @ LinkError::Interrupted(_)) => {
                    self.cancel_async_task(&ticket_params).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
        }

        rc.into_result()
    }

    async fn poll_sleep(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        tokio::select! {
            () = cancel.cancelled() => Err(LinkError::Interrupted(
                "session cancelled during async poll".to_string(),
            )),
            () = sleep(self.poll_interval) => Ok(()),
        }
    }

    /// Best-effort cancellation of a server-side ticket, so an abandoned
    /// poll never leaves the server holding resources. Ignores the tripped
    /// cancel token by design.
    async fn cancel_async_task(&self, ticket_params: &Value) {
        if let Err(e) = self
            .invoke(methods::CANCEL_ASYNC_TASK, ticket_params, 0, None)
            .await
        {
            debug!(error = %e, "best-effort async task cancel failed");
        }
    }
}
