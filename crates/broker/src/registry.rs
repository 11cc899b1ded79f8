//! Live session registry and per-request response sinks.
//!
//! One `SessionHandle` exists per authenticated connector session. The
//! handle owns the session's bounded outbound frame queue (drained by the
//! single writer task) and the in-flight map from correlation id to the
//! sink the HTTP handler is waiting on.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use {
    backhaul_protocol::{
        codes, ErrorPayload, Frame, FramePayload, ResponsePayload, STREAM_BUFFER_CHUNKS,
        decode_body,
    },
    secrecy::Secret,
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, warn},
};

/// Outbound frame queue depth per session.
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// Reply delivered to a non-streaming request handler.
#[derive(Debug)]
pub enum RelayReply {
    Response(ResponsePayload),
    Error(ErrorPayload),
}

/// Event delivered to a streaming request handler, in connector emit order.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Vec<u8>),
    End,
    Error(ErrorPayload),
}

/// Where frames for one correlation id are delivered.
pub enum ResponseSink {
    Single(oneshot::Sender<RelayReply>),
    Stream(mpsc::Sender<StreamEvent>),
}

/// One authenticated connector session on the broker side.
///
/// The in-flight map is owned by the session: the reader task produces into
/// it, HTTP handlers consume from their own sinks. The outbound queue is the
/// only path to the socket, keeping frame emission serialized.
pub struct SessionHandle {
    pub session_id: String,
    pub models: Vec<String>,
    pub credential: Option<Secret<String>>,
    outbound: mpsc::Sender<Frame>,
    in_flight: Mutex<HashMap<String, ResponseSink>>,
}

impl SessionHandle {
    pub fn new(
        session_id: String,
        models: Vec<String>,
        credential: Option<Secret<String>>,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        let handle = Arc::new(Self {
            session_id,
            models,
            credential,
            outbound,
            in_flight: Mutex::new(HashMap::new()),
        });
        (handle, rx)
    }

    /// Queue a frame for the writer task. Fails when the session is gone.
    pub async fn send(&self, frame: Frame) -> Result<(), SessionGone> {
        self.outbound.send(frame).await.map_err(|_| SessionGone)
    }

    /// Best-effort enqueue from sync contexts (drop guards, dispatch).
    pub fn try_send(&self, frame: Frame) {
        if let Err(e) = self.outbound.try_send(frame) {
            debug!(session_id = %self.session_id, "outbound queue unavailable: {e}");
        }
    }

    /// Install the sink for a new correlation id.
    pub fn register(&self, correlation_id: &str, sink: ResponseSink) {
        let mut in_flight = self.in_flight.lock().expect("in_flight poisoned");
        in_flight.insert(correlation_id.to_string(), sink);
    }

    /// Remove and return the sink for a correlation id, if still present.
    pub fn remove(&self, correlation_id: &str) -> Option<ResponseSink> {
        let mut in_flight = self.in_flight.lock().expect("in_flight poisoned");
        in_flight.remove(correlation_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in_flight poisoned").len()
    }

    /// Route one inbound frame to its in-flight sink.
    ///
    /// Terminal frames destroy the record; a frame for an unknown id is
    /// dropped with a warning (it may be a late terminator after a local
    /// cancel). A streaming consumer that cannot keep up within the bounded
    /// chunk buffer is cancelled upstream rather than stalling the session.
    pub fn dispatch(&self, frame: Frame) {
        let correlation_id = frame.id;
        let mut in_flight = self.in_flight.lock().expect("in_flight poisoned");
        if !in_flight.contains_key(&correlation_id) {
            drop(in_flight);
            warn!(
                session_id = %self.session_id,
                correlation_id = %correlation_id,
                "frame for unknown correlation id dropped"
            );
            return;
        }

        match frame.payload {
            FramePayload::Response(payload) => match in_flight.remove(&correlation_id) {
                Some(ResponseSink::Single(tx)) => {
                    let _ = tx.send(RelayReply::Response(payload));
                },
                Some(ResponseSink::Stream(_)) => {
                    warn!(correlation_id = %correlation_id, "RESPONSE on streaming sink dropped");
                },
                None => {},
            },
            FramePayload::Error(payload) => match in_flight.remove(&correlation_id) {
                Some(ResponseSink::Single(tx)) => {
                    let _ = tx.send(RelayReply::Error(payload));
                },
                Some(ResponseSink::Stream(tx)) => {
                    let _ = tx.try_send(StreamEvent::Error(payload));
                },
                None => {},
            },
            FramePayload::StreamEnd(_) => match in_flight.remove(&correlation_id) {
                Some(ResponseSink::Stream(tx)) => {
                    let _ = tx.try_send(StreamEvent::End);
                },
                Some(ResponseSink::Single(_)) => {
                    warn!(correlation_id = %correlation_id, "STREAM_END on single sink dropped");
                },
                None => {},
            },
            FramePayload::StreamChunk(payload) => {
                let chunk = match decode_body(&payload.chunk_b64) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(correlation_id = %correlation_id, "undecodable chunk dropped: {e}");
                        return;
                    },
                };
                let overflowed = match in_flight.get(&correlation_id) {
                    Some(ResponseSink::Stream(tx)) => matches!(
                        tx.try_send(StreamEvent::Chunk(chunk)),
                        Err(mpsc::error::TrySendError::Full(_))
                    ),
                    Some(ResponseSink::Single(_)) => {
                        warn!(correlation_id = %correlation_id, "STREAM_CHUNK on single sink dropped");
                        false
                    },
                    None => false,
                };
                if overflowed {
                    // The external caller stopped reading. Cancel upstream
                    // and drop the record; the closed sink tells the
                    // handler the stream is over.
                    warn!(
                        session_id = %self.session_id,
                        correlation_id = %correlation_id,
                        code = codes::SLOW_CONSUMER,
                        "stream buffer overflow, cancelling"
                    );
                    in_flight.remove(&correlation_id);
                    drop(in_flight);
                    self.try_send(Frame::cancel(correlation_id));
                }
            },
            payload => {
                warn!(
                    session_id = %self.session_id,
                    correlation_id = %correlation_id,
                    tag = payload.tag(),
                    "unexpected frame type for in-flight request, dropped"
                );
            },
        }
    }

    /// Fail every in-flight request on this session. Called on transport
    /// loss (after the router has been updated) and on shutdown.
    pub fn fail_all(&self, status: u16, message: &str, code: &str) {
        let drained: Vec<(String, ResponseSink)> = {
            let mut in_flight = self.in_flight.lock().expect("in_flight poisoned");
            in_flight.drain().collect()
        };
        for (correlation_id, sink) in drained {
            debug!(
                session_id = %self.session_id,
                correlation_id = %correlation_id,
                code,
                "failing in-flight request"
            );
            let payload = ErrorPayload {
                status,
                error: message.to_string(),
                code: code.to_string(),
            };
            match sink {
                ResponseSink::Single(tx) => {
                    let _ = tx.send(RelayReply::Error(payload));
                },
                ResponseSink::Stream(tx) => {
                    let _ = tx.try_send(StreamEvent::Error(payload));
                },
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session is gone")]
pub struct SessionGone;

// ── Registry ─────────────────────────────────────────────────────────────────

/// Broker-global table of live sessions, keyed by session id.
#[derive(Default)]
pub struct ConnectorRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        sessions.insert(handle.session_id.clone(), handle);
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        sessions.remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.get(session_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().expect("registry poisoned").len()
    }

    /// Total in-flight requests across sessions; drives the shutdown drain.
    pub fn in_flight_total(&self) -> usize {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.values().map(|s| s.in_flight_count()).sum()
    }

    pub fn all(&self) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.values().cloned().collect()
    }
}

/// Buffer depth handed to streaming sinks.
pub fn stream_sink() -> (mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
    mpsc::channel(STREAM_BUFFER_CHUNKS)
}
