//! JSON-RPC 2.0 wire envelope and streaming message model.
//!
//! The field layout and reserved error codes are a server contract and must
//! not change: `{"jsonrpc": "2.0", "method", "id", "params"}` requests, a
//! `result`-or-`error` reply (single or order-correlated array), and
//! streaming units of `{"name", "type", "data", "baseline"}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::LinkError;

/// Protocol version tag carried on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Key under which the authorization handle is injected into `params`.
pub const API_HANDLE_KEY: &str = "api_h";

/// Reserved JSON-RPC error codes consumed specially by the client.
pub mod codes {
    /// The server does not know the method (surfaces as a version mismatch
    /// during the handshake).
    pub const METHOD_NOT_SUPPORTED: i64 = -32601;
    /// The server is transiently busy; resend the original call.
    pub const TRY_AGAIN: i64 = -32001;
    /// The server accepted the call and returned a ticket id in the error
    /// message; poll for the result.
    pub const WORK_IN_PROGRESS: i64 = -32002;
    /// An async result was requested for a ticket that has none.
    pub const NO_RESULTS: i64 = -32003;
}

/// RPC methods issued by the transport core itself.
pub mod methods {
    /// Version/session handshake; returns the authorization handle.
    pub const API_SYNC: &str = "api_sync_v2";
    /// Barrier injection on the command channel.
    pub const PUBLISH_NOW: &str = "publish_now";
    /// Fetch the result of a ticketed async job.
    pub const GET_ASYNC_RESULTS: &str = "get_async_results";
    /// Best-effort cancellation of a ticketed async job.
    pub const CANCEL_ASYNC_TASK: &str = "cancel_async_task";
}

/// Reserved streaming channel names.
pub mod channels {
    /// Global statistics snapshots.
    pub const GLOBAL_STATS: &str = "global_stats";
    /// Per-flow statistics snapshots.
    pub const FLOW_STATS: &str = "flow_stats";
    /// Latency statistics snapshots.
    pub const LATENCY_STATS: &str = "latency_stats";
    /// Server-pushed events; the numeric event id rides in `type`.
    pub const SERVER_EVENT: &str = "server_event";
    /// Barrier acknowledgments; the barrier key rides in `type`.
    pub const BARRIER_ACK: &str = "barrier_ack";
}

/// One JSON-RPC request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    /// Protocol version tag, always "2.0".
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: String,
    /// Correlation id, unique per process.
    pub id: u64,
    /// Parameter map; always present, even if empty.
    pub params: Value,
}

impl RpcRequest {
    /// Build a request. `params` must be an object or `Value::Null` (which
    /// becomes the empty object); the authorization handle is injected into
    /// the parameter map when present.
    pub fn new(method: &str, params: Value, id: u64, api_handle: Option<&str>) -> Self {
        let mut map = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                // Non-object params are preserved under a single key rather
                // than dropped; the server contract expects an object.
                let mut map = Map::new();
                let _ = map.insert("value".to_string(), other);
                map
            }
        };
        if let Some(h) = api_handle {
            let _ = map.insert(API_HANDLE_KEY.to_string(), Value::String(h.to_string()));
        }
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            id,
            params: Value::Object(map),
        }
    }
}

/// Error member of a JSON-RPC reply. The server reports details either in
/// `specific_err` (preferred when present) or `message`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code.
    pub code: i64,
    /// Generic message.
    #[serde(default)]
    pub message: Option<String>,
    /// Detailed message; takes precedence over `message`.
    #[serde(default)]
    pub specific_err: Option<String>,
}

impl RpcErrorBody {
    /// The most specific message the server provided.
    pub fn text(&self) -> &str {
        self.specific_err
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("")
    }
}

/// One normalized call outcome: a value on success, code plus message on
/// failure. Batch replies produce one of these per request, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult {
    /// Success payload.
    Ok(Value),
    /// Server-reported failure.
    Err {
        /// Numeric error code. Client-side failures injected into batch
        /// results use `-1`.
        code: i64,
        /// Human-readable message.
        message: String,
    },
}

impl RpcResult {
    /// Client-side failure marker used to tag batch entries that were never
    /// answered (transport failed before or during their chunk).
    pub const CLIENT_ERR: i64 = -1;

    /// True for the success variant.
    pub fn is_ok(&self) -> bool {
        matches!(self, RpcResult::Ok(_))
    }

    /// The error code, if this is a failure.
    pub fn err_code(&self) -> Option<i64> {
        match self {
            RpcResult::Ok(_) => None,
            RpcResult::Err { code, .. } => Some(*code),
        }
    }

    /// Convert into a `Result`, mapping server failures to
    /// [`LinkError::Server`].
    pub fn into_result(self) -> Result<Value, LinkError> {
        match self {
            RpcResult::Ok(v) => Ok(v),
            RpcResult::Err { code, message } => Err(LinkError::Server { code, message }),
        }
    }

    /// Build a failure from a client-side error.
    pub fn from_link_error(e: &LinkError) -> Self {
        RpcResult::Err {
            code: Self::CLIENT_ERR,
            message: e.to_string(),
        }
    }
}

/// Parse one single (non-batch) reply object.
pub fn parse_single_response(v: &Value) -> Result<RpcResult, LinkError> {
    let obj = v
        .as_object()
        .ok_or_else(|| LinkError::Protocol(format!("reply is not an object: {v}")))?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(LinkError::Protocol(format!("malformed reply: {v}")));
    }

    if let Some(err) = obj.get("error") {
        let body: RpcErrorBody = serde_json::from_value(err.clone())
            .map_err(|e| LinkError::Protocol(format!("malformed error member: {e}")))?;
        return Ok(RpcResult::Err {
            code: body.code,
            message: body.text().to_string(),
        });
    }

    match obj.get("result") {
        Some(result) => Ok(RpcResult::Ok(result.clone())),
        None => Err(LinkError::Protocol(format!(
            "reply carries neither result nor error: {v}"
        ))),
    }
}

/// Parse a reply buffer into normalized results. A batch (array) reply
/// yields one entry per element in wire order; a single reply yields one.
pub fn parse_response(buf: &[u8]) -> Result<Vec<RpcResult>, LinkError> {
    let v: Value = serde_json::from_slice(buf)
        .map_err(|e| LinkError::Protocol(format!("failed to decode reply: {e}")))?;

    match v {
        Value::Array(items) => items.iter().map(parse_single_response).collect(),
        other => Ok(vec![parse_single_response(&other)?]),
    }
}

/// One decoded unit from the streaming channel.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Channel discriminator.
    pub name: String,
    /// Implementation-defined tag: numeric event id for `server_event`,
    /// barrier key for `barrier_ack`.
    #[serde(rename = "type", default)]
    pub type_tag: Value,
    /// Typed payload.
    #[serde(default)]
    pub data: Value,
    /// Marks a snapshot as the new reference point for delta statistics.
    #[serde(default)]
    pub baseline: bool,
}
