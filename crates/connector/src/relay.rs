//! Request execution on the connector side.
//!
//! Each REQUEST frame runs in its own task with a cancellation token in the
//! active-request registry. CANCEL fires the token; once cancelled, no
//! further frames are emitted for that correlation id — the CANCEL is the
//! terminator as far as the broker is concerned.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    futures::StreamExt,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use backhaul_protocol::{
    codes, decode_body, Frame, RequestPayload, ResponsePayload,
};

use crate::upstream::LlmClient;

/// In-flight request registry: correlation id → cancellation handle.
#[derive(Default)]
pub struct ActiveRequests {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and install the token for a new request.
    pub fn insert(&self, correlation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().expect("active requests poisoned");
        inner.insert(correlation_id.to_string(), token.clone());
        token
    }

    pub fn remove(&self, correlation_id: &str) {
        let mut inner = self.inner.lock().expect("active requests poisoned");
        inner.remove(correlation_id);
    }

    /// Fire the cancel signal for one request, if it is still running.
    pub fn cancel(&self, correlation_id: &str) {
        let inner = self.inner.lock().expect("active requests poisoned");
        if let Some(token) = inner.get(correlation_id) {
            token.cancel();
        } else {
            debug!(correlation_id, "cancel for unknown request ignored");
        }
    }

    /// Fire every cancel signal; used when the session dies.
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().expect("active requests poisoned");
        for token in inner.values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("active requests poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execute one REQUEST end to end, emitting response frames through the
/// session's outbound queue.
pub async fn handle_request(
    correlation_id: String,
    payload: RequestPayload,
    upstream: Arc<LlmClient>,
    outbound: mpsc::Sender<Frame>,
    active: Arc<ActiveRequests>,
    max_chunk_bytes: usize,
) {
    let token = active.insert(&correlation_id);

    tokio::select! {
        _ = token.cancelled() => {
            info!(correlation_id = %correlation_id, "request cancelled");
        },
        _ = run_request(&correlation_id, payload, &upstream, &outbound, max_chunk_bytes) => {},
    }

    active.remove(&correlation_id);
}

async fn run_request(
    correlation_id: &str,
    payload: RequestPayload,
    upstream: &LlmClient,
    outbound: &mpsc::Sender<Frame>,
    max_chunk_bytes: usize,
) {
    let body = match decode_body(&payload.body_b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(correlation_id, "undecodable request body: {e}");
            send(outbound, Frame::error(
                correlation_id,
                400,
                "invalid request body",
                codes::INTERNAL_ERROR,
            ))
            .await;
            return;
        },
    };

    // The same sniff the broker does; the connector decides how to consume
    // the backend response from it.
    let streaming = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false);

    info!(
        correlation_id,
        method = %payload.method,
        path = %payload.path,
        streaming,
        has_llm_api_key = payload.llm_api_key.is_some(),
        "request received"
    );

    if streaming {
        run_streaming(correlation_id, &payload, body, upstream, outbound, max_chunk_bytes).await;
    } else {
        run_buffered(correlation_id, &payload, body, upstream, outbound).await;
    }
}

/// Non-streaming: one buffered round trip, one RESPONSE frame. Backend
/// error statuses pass through verbatim inside the RESPONSE.
async fn run_buffered(
    correlation_id: &str,
    payload: &RequestPayload,
    body: Vec<u8>,
    upstream: &LlmClient,
    outbound: &mpsc::Sender<Frame>,
) {
    match upstream
        .forward(
            &payload.method,
            &payload.path,
            &payload.headers,
            body,
            payload.llm_api_key.as_deref(),
        )
        .await
    {
        Ok((status, mut headers, response_body)) => {
            // The relayed body is no longer chunked.
            headers.remove("transfer-encoding");
            headers.remove("content-length");
            send(outbound, Frame::response(correlation_id, ResponsePayload {
                status,
                headers,
                body_b64: backhaul_protocol::encode_body(&response_body),
            }))
            .await;
            info!(correlation_id, status, "response relayed");
        },
        Err(e) => {
            send(outbound, error_frame(correlation_id, &e)).await;
        },
    }
}

/// Streaming: forward backend bytes as a bounded STREAM_CHUNK sequence with
/// exactly one terminator.
async fn run_streaming(
    correlation_id: &str,
    payload: &RequestPayload,
    body: Vec<u8>,
    upstream: &LlmClient,
    outbound: &mpsc::Sender<Frame>,
    max_chunk_bytes: usize,
) {
    let response = match upstream
        .forward_streaming(
            &payload.method,
            &payload.path,
            &payload.headers,
            body,
            payload.llm_api_key.as_deref(),
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            send(outbound, error_frame(correlation_id, &e)).await;
            return;
        },
    };

    let status = response.status().as_u16();
    if status >= 400 {
        // Error before any stream bytes: surface the backend's own words.
        let detail = response.text().await.unwrap_or_default();
        send(outbound, Frame::error(correlation_id, status, detail, codes::LLM_ERROR)).await;
        return;
    }

    let mut stream = response.bytes_stream();
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                for part in bytes.chunks(max_chunk_bytes) {
                    if !send(outbound, Frame::stream_chunk(correlation_id, part)).await {
                        return;
                    }
                }
            },
            Err(e) => {
                warn!(correlation_id, "backend stream failed: {e}");
                let frame = if e.is_timeout() {
                    Frame::error(correlation_id, 504, "request timeout", codes::TIMEOUT)
                } else {
                    Frame::error(correlation_id, 502, "backend stream failed", codes::LLM_ERROR)
                };
                send(outbound, frame).await;
                return;
            },
        }
    }

    send(outbound, Frame::stream_end(correlation_id)).await;
    info!(correlation_id, "stream relayed");
}

fn error_frame(correlation_id: &str, error: &crate::error::Error) -> Frame {
    match error {
        crate::error::Error::Reqwest(e) if e.is_timeout() => {
            Frame::error(correlation_id, 504, "request timeout", codes::TIMEOUT)
        },
        _ => {
            warn!(correlation_id, "backend unavailable: {error}");
            Frame::error(
                correlation_id,
                502,
                "backend unavailable",
                codes::LLM_UNAVAILABLE,
            )
        },
    }
}

/// Queue a frame; returns false when the session writer is gone.
async fn send(outbound: &mpsc::Sender<Frame>, frame: Frame) -> bool {
    outbound.send(frame).await.is_ok()
}
