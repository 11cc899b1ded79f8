//! Relay protocol: frame types and codec for broker-connector sessions.
//!
//! Every frame is one JSON text message on the WebSocket:
//! `{"type": TAG, "id": <correlation id>, "payload": {..}}`.
//!
//! Frame flow:
//! - connector → broker: `AUTH`, `RESPONSE`, `STREAM_CHUNK`, `STREAM_END`,
//!   `ERROR`, `PING`, `PONG`
//! - broker → connector: `AUTH_OK`, `AUTH_FAIL`, `REQUEST`, `CANCEL`,
//!   `PING`, `PONG`
//!
//! Bodies that may contain arbitrary bytes travel base64-encoded; the codec
//! is the only place that touches raw JSON.

use std::collections::HashMap;

use {
    base64::Engine,
    serde::{Deserialize, Serialize},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Maximum decoded size of a single `STREAM_CHUNK` body.
pub const MAX_CHUNK_BYTES: usize = 256 * 1024; // 256 KiB
/// Maximum decoded size of a `REQUEST`/`RESPONSE` body.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024; // 8 MiB
/// How long either side waits for the AUTH handshake to complete.
pub const AUTH_TIMEOUT_SECS: u64 = 10;
/// Heartbeat interval on an idle session.
pub const PING_INTERVAL_SECS: u64 = 30;
/// Default end-to-end request deadline.
pub const REQUEST_TIMEOUT_SECS: u64 = 300;
/// Per-request buffer of undelivered stream chunks before the caller is
/// declared a slow consumer.
pub const STREAM_BUFFER_CHUNKS: usize = 8;
/// Bounded drain interval for in-flight requests on shutdown.
pub const DRAIN_TIMEOUT_SECS: u64 = 30;

// ── Error codes ──────────────────────────────────────────────────────────────

/// Machine-readable error kinds carried in `ERROR` frames and HTTP error
/// bodies. Secrets never appear next to these.
pub mod codes {
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const INVALID_API_KEY: &str = "invalid_api_key";
    pub const MISSING_MODEL: &str = "missing_model";
    pub const MODEL_NOT_FOUND: &str = "model_not_found";
    pub const NO_CONNECTOR: &str = "no_connector";
    pub const SESSION_LOST: &str = "session_lost";
    pub const TIMEOUT: &str = "timeout";
    pub const LLM_UNAVAILABLE: &str = "llm_unavailable";
    pub const LLM_ERROR: &str = "llm_error";
    pub const FRAME_TOO_LARGE: &str = "frame_too_large";
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    pub const SHUTDOWN: &str = "shutdown";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// One envelope on the duplex transport.
///
/// The `id` is opaque on the wire and scopes all frames belonging to one
/// request within a single session. Auth frames use an `auth-` bootstrap id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(flatten)]
    pub payload: FramePayload,
}

/// Discriminated union of all frame payloads, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FramePayload {
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    AuthFail(AuthFailPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    StreamChunk(StreamChunkPayload),
    StreamEnd(StreamEndPayload),
    Error(ErrorPayload),
    Cancel(CancelPayload),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl FramePayload {
    /// Wire tag for logging. Matches the serialized `type` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH",
            Self::AuthOk(_) => "AUTH_OK",
            Self::AuthFail(_) => "AUTH_FAIL",
            Self::Request(_) => "REQUEST",
            Self::Response(_) => "RESPONSE",
            Self::StreamChunk(_) => "STREAM_CHUNK",
            Self::StreamEnd(_) => "STREAM_END",
            Self::Error(_) => "ERROR",
            Self::Cancel(_) => "CANCEL",
            Self::Ping(_) => "PING",
            Self::Pong(_) => "PONG",
        }
    }

    /// Terminal payloads end the in-flight record for their correlation id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Response(_) | Self::StreamEnd(_) | Self::Error(_)
        )
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    pub connector_version: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFailPayload {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_b64: String,
    /// Upstream credential injected by the broker. Never present in frames
    /// toward the external caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_b64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunkPayload {
    pub chunk_b64: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEndPayload {
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status: u16,
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelPayload {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {}

// ── Constructors ─────────────────────────────────────────────────────────────

impl Frame {
    pub fn auth(id: impl Into<String>, token: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Auth(AuthPayload {
                token: token.into(),
                connector_version: env!("CARGO_PKG_VERSION").to_string(),
                models,
            }),
        }
    }

    pub fn auth_ok(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::AuthOk(AuthOkPayload {
                session_id: session_id.into(),
            }),
        }
    }

    pub fn auth_fail(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::AuthFail(AuthFailPayload {
                error: error.into(),
            }),
        }
    }

    pub fn request(id: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Request(payload),
        }
    }

    pub fn response(id: impl Into<String>, payload: ResponsePayload) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Response(payload),
        }
    }

    pub fn stream_chunk(id: impl Into<String>, chunk: &[u8]) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::StreamChunk(StreamChunkPayload {
                chunk_b64: encode_body(chunk),
                done: false,
            }),
        }
    }

    pub fn stream_end(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::StreamEnd(StreamEndPayload { done: true }),
        }
    }

    pub fn error(
        id: impl Into<String>,
        status: u16,
        error: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Error(ErrorPayload {
                status,
                error: error.into(),
                code: code.into(),
            }),
        }
    }

    pub fn cancel(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Cancel(CancelPayload {}),
        }
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Ping(PingPayload {}),
        }
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: FramePayload::Pong(PongPayload {}),
        }
    }
}

/// Bootstrap id for the AUTH handshake.
pub fn auth_id() -> String {
    format!("auth-{}", short_hex())
}

/// Id for heartbeat pings.
pub fn ping_id() -> String {
    format!("ping-{}", short_hex())
}

/// Correlation id for one external request. 128-bit random, so collisions
/// within a session are negligible.
pub fn correlation_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

/// Broker-assigned session id.
pub fn session_id() -> String {
    format!("sess-{}", short_hex())
}

fn short_hex() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

// ── Body encoding ────────────────────────────────────────────────────────────

pub fn encode_body(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_body(b64: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| Error::InvalidBody {
            detail: e.to_string(),
        })
}

/// Decoded size of a base64 string, computed from its length and padding
/// without allocating. Saturates on garbage like an all-padding body; the
/// actual base64 decode rejects those later.
fn b64_decoded_len(b64: &str) -> usize {
    let padding = b64.bytes().rev().take_while(|&b| b == b'=').count();
    ((b64.len() / 4) * 3).saturating_sub(padding)
}

// ── Limits ───────────────────────────────────────────────────────────────────

/// Decode-time size caps. Oversized frames are rejected before the body is
/// ever decoded, bounding per-frame memory.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_chunk_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: MAX_CHUNK_BYTES,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame body exceeds {max} bytes (got {len})")]
    FrameTooLarge {
        /// Correlation id of the offending frame, available when the
        /// envelope itself parsed.
        id: String,
        len: usize,
        max: usize,
    },
    #[error("invalid base64 body: {detail}")]
    InvalidBody { detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serialize a frame to one transport text message, enforcing body caps.
pub fn encode(frame: &Frame, limits: &FrameLimits) -> Result<String> {
    check_limits(frame, limits)?;
    Ok(serde_json::to_string(frame)?)
}

/// Parse one transport text message, enforcing body caps.
///
/// Unknown tags and schema mismatches surface as `Error::Json`; an
/// oversized body surfaces as `Error::FrameTooLarge` carrying the frame id
/// so the session can answer with a same-id `ERROR` before tearing down.
pub fn decode(text: &str, limits: &FrameLimits) -> Result<Frame> {
    let frame: Frame = serde_json::from_str(text)?;
    check_limits(&frame, limits)?;
    Ok(frame)
}

fn check_limits(frame: &Frame, limits: &FrameLimits) -> Result<()> {
    let (len, max) = match &frame.payload {
        FramePayload::StreamChunk(p) => (b64_decoded_len(&p.chunk_b64), limits.max_chunk_bytes),
        FramePayload::Request(p) => (b64_decoded_len(&p.body_b64), limits.max_body_bytes),
        FramePayload::Response(p) => (b64_decoded_len(&p.body_b64), limits.max_body_bytes),
        _ => return Ok(()),
    };
    if len > max {
        return Err(Error::FrameTooLarge {
            id: frame.id.clone(),
            len,
            max,
        });
    }
    Ok(())
}
