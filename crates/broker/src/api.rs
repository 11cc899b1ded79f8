//! External OpenAI-compatible HTTP surface.
//!
//! Thin by design: authenticate, sniff `model` and `stream` out of the
//! body, resolve a route, hand the request to the owning session and turn
//! the frames coming back into an HTTP response. Streaming responses are
//! passed through chunk-for-chunk as SSE; nothing buffers a whole body.

use std::{convert::Infallible, sync::Arc};

use {
    axum::{
        Json, Router,
        body::Body,
        extract::{DefaultBodyLimit, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    bytes::Bytes,
    secrecy::ExposeSecret,
    sha2::{Digest, Sha256},
    tokio::{
        sync::{mpsc, oneshot},
        time::{Instant, timeout_at},
    },
    tokio_stream::wrappers::ReceiverStream,
    tracing::{debug, info, warn},
};

use backhaul_protocol::{
    self as protocol, codes, Frame, RequestPayload, ResponsePayload,
};

use crate::{
    registry::{RelayReply, ResponseSink, SessionHandle, StreamEvent, stream_sink},
    state::BrokerState,
};

/// Router for the external API listener.
pub fn router(state: Arc<BrokerState>) -> Router {
    let body_cap = state.config.limits.max_body_bytes;
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        // Twice the frame cap so oversized-but-sane bodies still get the
        // JSON 413 from the handler instead of a bare rejection.
        .layer(DefaultBodyLimit::max(body_cap * 2))
        .with_state(state)
}

// ── Error bodies ─────────────────────────────────────────────────────────────

/// OpenAI-style error body: `{"error":{"message","type","code"}}`.
pub fn error_response(
    status: u16,
    message: impl Into<String>,
    error_type: &str,
    code: &str,
) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": {
            "message": message.into(),
            "type": error_type,
            "code": code,
        }
    });
    (status, Json(body)).into_response()
}

/// Error class for relayed error codes, mirroring what the HTTP status
/// would suggest to an OpenAI SDK.
fn error_type_for(code: &str) -> &'static str {
    match code {
        codes::INVALID_API_KEY | codes::INVALID_TOKEN => "authentication_error",
        codes::MISSING_MODEL | codes::MODEL_NOT_FOUND | codes::FRAME_TOO_LARGE => {
            "invalid_request_error"
        },
        codes::NO_CONNECTOR | codes::SESSION_LOST | codes::SLOW_CONSUMER | codes::SHUTDOWN => {
            "service_unavailable"
        },
        codes::TIMEOUT => "timeout",
        codes::LLM_UNAVAILABLE | codes::LLM_ERROR => "bad_gateway",
        _ => "internal_error",
    }
}

// ── Auth ─────────────────────────────────────────────────────────────────────

/// Validate the caller's bearer key. Hash comparison avoids timing
/// side-channels (no configured keys disables auth).
fn check_user_key(state: &BrokerState, headers: &HeaderMap) -> Option<Response> {
    if !state.config.api_auth_enabled() {
        return None;
    }

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let valid = provided.is_some_and(|token| {
        let provided_hash = Sha256::digest(token.as_bytes());
        state
            .config
            .user_keys
            .iter()
            .any(|key| Sha256::digest(key.as_bytes()) == provided_hash)
    });

    if valid {
        None
    } else {
        warn!("rejected request with missing or invalid api key");
        Some(error_response(
            401,
            "missing or invalid API key",
            "authentication_error",
            codes::INVALID_API_KEY,
        ))
    }
}

// ── In-flight guard ──────────────────────────────────────────────────────────

/// Cleans up the in-flight record if the handler never reached a terminal
/// state: removes the sink and sends a best-effort CANCEL so the connector
/// releases its upstream call. Covers caller disconnects and deadlines.
struct InflightGuard {
    session: Arc<SessionHandle>,
    correlation_id: String,
    armed: bool,
}

impl InflightGuard {
    fn new(session: Arc<SessionHandle>, correlation_id: String) -> Self {
        Self {
            session,
            correlation_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.armed && self.session.remove(&self.correlation_id).is_some() {
            debug!(correlation_id = %self.correlation_id, "cancelling abandoned request");
            self.session
                .try_send(Frame::cancel(self.correlation_id.clone()));
        }
    }
}

// ── POST /v1/chat/completions ────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.is_shutting_down() {
        return error_response(
            503,
            "broker is shutting down",
            "service_unavailable",
            codes::SHUTDOWN,
        );
    }
    if let Some(rejection) = check_user_key(&state, &headers) {
        return rejection;
    }
    if body.len() > state.config.limits.max_body_bytes {
        return error_response(
            413,
            "request body too large",
            "invalid_request_error",
            codes::FRAME_TOO_LARGE,
        );
    }

    // The body stays opaque apart from the routing fields.
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    let Some(model) = parsed.get("model").and_then(|v| v.as_str()).map(String::from) else {
        return error_response(
            400,
            "missing 'model' field in request",
            "invalid_request_error",
            codes::MISSING_MODEL,
        );
    };
    let streaming = parsed
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let Some(route) = state.router.get_route(&model) else {
        warn!(model = %model, "no route for model");
        return error_response(
            404,
            format!("model '{model}' not found"),
            "invalid_request_error",
            codes::MODEL_NOT_FOUND,
        );
    };
    let Some(session) = state.registry.get(&route.session_id) else {
        // The session died between the route lookup and now.
        return error_response(
            503,
            format!("no active connector for model '{model}'"),
            "service_unavailable",
            codes::NO_CONNECTOR,
        );
    };

    let correlation_id = protocol::correlation_id();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let request = RequestPayload {
        method: "POST".into(),
        path: "/v1/chat/completions".into(),
        headers: [("content-type".to_string(), content_type)].into(),
        body_b64: protocol::encode_body(&body),
        llm_api_key: route
            .credential
            .as_ref()
            .map(|secret| secret.expose_secret().clone()),
    };

    info!(
        correlation_id = %correlation_id,
        session_id = %session.session_id,
        model = %model,
        streaming,
        "forwarding request"
    );

    let deadline = Instant::now() + state.config.request_timeout;
    if streaming {
        streaming_response(session, correlation_id, request, deadline).await
    } else {
        buffered_response(session, correlation_id, request, deadline).await
    }
}

/// Non-streaming: wait on a single-shot slot and map the terminal frame.
async fn buffered_response(
    session: Arc<SessionHandle>,
    correlation_id: String,
    request: RequestPayload,
    deadline: Instant,
) -> Response {
    let (tx, rx) = oneshot::channel();
    session.register(&correlation_id, ResponseSink::Single(tx));
    let mut guard = InflightGuard::new(Arc::clone(&session), correlation_id.clone());

    if session
        .send(Frame::request(correlation_id.clone(), request))
        .await
        .is_err()
    {
        return error_response(
            503,
            "connector disconnected",
            "service_unavailable",
            codes::SESSION_LOST,
        );
    }

    match timeout_at(deadline, rx).await {
        Ok(Ok(RelayReply::Response(payload))) => {
            guard.disarm();
            upstream_response(payload)
        },
        Ok(Ok(RelayReply::Error(payload))) => {
            guard.disarm();
            error_response(
                payload.status,
                payload.error,
                error_type_for(&payload.code),
                &payload.code,
            )
        },
        Ok(Err(_)) => {
            guard.disarm();
            error_response(
                503,
                "connector disconnected",
                "service_unavailable",
                codes::SESSION_LOST,
            )
        },
        Err(_) => {
            // Guard drop cancels the request on the connector.
            drop(guard);
            error_response(504, "request timeout", "timeout", codes::TIMEOUT)
        },
    }
}

/// Translate a RESPONSE frame into the HTTP response, body verbatim.
fn upstream_response(payload: ResponsePayload) -> Response {
    let body = match protocol::decode_body(&payload.body_b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("connector sent undecodable response body: {e}");
            return error_response(
                500,
                "internal server error",
                "internal_error",
                codes::INTERNAL_ERROR,
            );
        },
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(payload.status).unwrap_or(StatusCode::OK))
        .header(
            header::CONTENT_TYPE,
            payload
                .headers
                .get("content-type")
                .map(String::as_str)
                .unwrap_or("application/json"),
        );
    if let Some(request_id) = payload.headers.get("x-request-id") {
        builder = builder.header("x-request-id", request_id);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming: the first event decides the HTTP response, the rest are
/// pumped into the SSE body in arrival order.
async fn streaming_response(
    session: Arc<SessionHandle>,
    correlation_id: String,
    request: RequestPayload,
    deadline: Instant,
) -> Response {
    let (tx, mut rx) = stream_sink();
    session.register(&correlation_id, ResponseSink::Stream(tx));
    let mut guard = InflightGuard::new(Arc::clone(&session), correlation_id.clone());

    if session
        .send(Frame::request(correlation_id.clone(), request))
        .await
        .is_err()
    {
        return error_response(
            503,
            "connector disconnected",
            "service_unavailable",
            codes::SESSION_LOST,
        );
    }

    let first = match timeout_at(deadline, rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            guard.disarm();
            return error_response(
                503,
                "connector disconnected",
                "service_unavailable",
                codes::SESSION_LOST,
            );
        },
        Err(_) => {
            drop(guard);
            return error_response(504, "request timeout", "timeout", codes::TIMEOUT);
        },
    };

    match first {
        StreamEvent::Error(payload) => {
            guard.disarm();
            error_response(
                payload.status,
                payload.error,
                error_type_for(&payload.code),
                &payload.code,
            )
        },
        StreamEvent::End => {
            guard.disarm();
            sse_response(Body::from(DONE_EVENT))
        },
        StreamEvent::Chunk(first_chunk) => {
            let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
            tokio::spawn(pump_stream(rx, body_tx, first_chunk, guard, deadline));
            sse_response(Body::from_stream(ReceiverStream::new(body_rx)))
        },
    }
}

const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Copy stream events into the HTTP body until a terminal event, the
/// deadline, or the caller going away. Chunk bytes pass through verbatim;
/// `data: [DONE]` is appended only when the upstream did not send its own.
async fn pump_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    body_tx: mpsc::Sender<Result<Bytes, Infallible>>,
    first_chunk: Vec<u8>,
    mut guard: InflightGuard,
    deadline: Instant,
) {
    let mut done_seen = contains_done(&first_chunk);
    if body_tx.send(Ok(Bytes::from(first_chunk))).await.is_err() {
        // Caller went away; guard drop cancels upstream.
        return;
    }

    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(StreamEvent::Chunk(chunk))) => {
                done_seen = done_seen || contains_done(&chunk);
                if body_tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                    return;
                }
            },
            Ok(Some(StreamEvent::End)) => {
                guard.disarm();
                if !done_seen {
                    let _ = body_tx.send(Ok(Bytes::from_static(DONE_EVENT))).await;
                }
                return;
            },
            Ok(Some(StreamEvent::Error(payload))) => {
                // Mid-stream failure: close the body without a terminator so
                // the caller can tell the stream did not complete.
                guard.disarm();
                info!(code = %payload.code, status = payload.status, "stream ended with error");
                return;
            },
            Ok(None) => {
                // Session lost or slow-consumer eviction; record is gone.
                guard.disarm();
                return;
            },
            Err(_) => {
                // Deadline: guard drop cancels upstream.
                return;
            },
        }
    }
}

fn contains_done(chunk: &[u8]) -> bool {
    chunk
        .windows(DONE_MARKER.len())
        .any(|window| window == DONE_MARKER)
}

const DONE_MARKER: &[u8] = b"data: [DONE]";

// ── GET /v1/models ───────────────────────────────────────────────────────────

async fn list_models(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejection) = check_user_key(&state, &headers) {
        return rejection;
    }

    let data: Vec<serde_json::Value> = state
        .router
        .models()
        .into_iter()
        .map(|model| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "created": 0,
                "owned_by": "backhaul",
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn done_marker_detection() {
        assert!(contains_done(b"data: [DONE]\n\n"));
        assert!(contains_done(b"data: {\"x\":1}\n\ndata: [DONE]\n\n"));
        assert!(!contains_done(b"data: {\"delta\":\"he\"}\n\n"));
        assert!(!contains_done(b""));
    }

    #[test]
    fn error_types_map_to_codes() {
        assert_eq!(error_type_for(codes::TIMEOUT), "timeout");
        assert_eq!(error_type_for(codes::SESSION_LOST), "service_unavailable");
        assert_eq!(error_type_for(codes::LLM_ERROR), "bad_gateway");
        assert_eq!(error_type_for(codes::MODEL_NOT_FOUND), "invalid_request_error");
        assert_eq!(error_type_for("mystery"), "internal_error");
    }

    #[tokio::test]
    async fn error_body_shape() {
        let response = error_response(404, "model 'x' not found", "invalid_request_error", codes::MODEL_NOT_FOUND);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], "model_not_found");
        assert_eq!(value["error"]["type"], "invalid_request_error");
        assert_eq!(value["error"]["message"], "model 'x' not found");
    }
}
