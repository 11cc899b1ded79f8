//! Broker-side connector sessions over the `/ws` endpoint.
//!
//! Each accepted transport must open with AUTH within the handshake
//! timeout. An authenticated session runs a reader (this task) and a writer
//! task joined by the session's bounded outbound queue; the writer is the
//! only producer of bytes on the socket and pings on an interval — a ping
//! still unanswered when the next one is due declares the peer dead. On
//! transport loss the session is removed from the router first, then every
//! in-flight request is failed, so no REQUEST is ever written to a dead
//! socket.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{
            State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        response::IntoResponse,
        routing::any,
    },
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::{sync::mpsc, time::timeout},
    tracing::{debug, info, warn},
};

use backhaul_protocol::{
    self as protocol, codes, Frame, FrameLimits, FramePayload,
};

use crate::{registry::SessionHandle, state::BrokerState};

/// Router for the dedicated relay endpoint.
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<BrokerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

/// Drive one connector session from accept to teardown.
async fn handle_session(socket: WebSocket, state: Arc<BrokerState>) {
    let limits = state.config.limits;
    let (mut tx, mut stream) = socket.split();

    // The first frame must be AUTH, within the handshake timeout.
    let auth = match timeout(state.config.auth_timeout, next_frame(&mut stream, &limits)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("transport closed before AUTH");
            return;
        },
        Err(_) => {
            warn!("authentication timeout, dropping transport");
            return;
        },
    };

    let FramePayload::Auth(payload) = auth.payload else {
        send_frame(&mut tx, &Frame::auth_fail(auth.id, "expected AUTH"), &limits).await;
        let _ = tx.close().await;
        return;
    };

    let Some(credential) = state.config.connector_credential(&payload.token) else {
        warn!("connector presented invalid token");
        send_frame(&mut tx, &Frame::auth_fail(auth.id, "invalid token"), &limits).await;
        let _ = tx.close().await;
        return;
    };

    let session_id = protocol::session_id();
    let (session, outbound_rx) = SessionHandle::new(
        session_id.clone(),
        payload.models.clone(),
        credential,
    );

    state.registry.insert(Arc::clone(&session));
    state
        .router
        .on_register(&session_id, &payload.models, session.credential.clone());
    info!(
        session_id = %session_id,
        connector_version = %payload.connector_version,
        models = ?payload.models,
        "connector authenticated"
    );

    let peer_alive = Arc::new(AtomicBool::new(true));
    let mut writer = tokio::spawn(write_loop(
        tx,
        outbound_rx,
        state.config.ping_interval,
        limits,
        Arc::clone(&peer_alive),
    ));
    if session
        .send(Frame::auth_ok(auth.id, session_id.as_str()))
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "failed to queue AUTH_OK");
    }

    // A half-open socket never fails the reader, so the writer ending
    // (heartbeat verdict or send failure) must also end the session.
    tokio::select! {
        _ = read_loop(&mut stream, &session, &peer_alive, &limits) => {},
        _ = &mut writer => {
            debug!(session_id = %session_id, "writer ended first");
        },
    }

    // Teardown order matters: the router stops handing out this session
    // before its in-flight requests are failed.
    state.router.on_unregister(&session_id);
    state.registry.remove(&session_id);
    session.fail_all(503, "connector disconnected", codes::SESSION_LOST);
    writer.abort();
    info!(session_id = %session_id, "session closed");
}

/// Reader half: decode inbound frames and route them.
///
/// A decode failure is fatal to the session; an oversized frame first gets
/// a same-id ERROR so the connector can fail the request cleanly.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    session: &Arc<SessionHandle>,
    peer_alive: &Arc<AtomicBool>,
    limits: &FrameLimits,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_id = %session.session_id, "transport error: {e}");
                break;
            },
        };

        let frame = match protocol::decode(&text, limits) {
            Ok(frame) => frame,
            Err(protocol::Error::FrameTooLarge { id, len, max }) => {
                warn!(
                    session_id = %session.session_id,
                    len,
                    max,
                    "oversized frame, tearing down session"
                );
                session.try_send(Frame::error(
                    id,
                    413,
                    "frame too large",
                    codes::FRAME_TOO_LARGE,
                ));
                break;
            },
            Err(e) => {
                warn!(session_id = %session.session_id, "decode failure, tearing down session: {e}");
                break;
            },
        };

        match &frame.payload {
            FramePayload::Ping(_) => session.try_send(Frame::pong(frame.id)),
            FramePayload::Pong(_) => {
                peer_alive.store(true, Ordering::Relaxed);
            },
            FramePayload::Response(_)
            | FramePayload::StreamChunk(_)
            | FramePayload::StreamEnd(_)
            | FramePayload::Error(_) => session.dispatch(frame),
            other => {
                warn!(
                    session_id = %session.session_id,
                    tag = other.tag(),
                    "unexpected frame direction, dropped"
                );
            },
        }
    }
}

/// Writer half: sole serializer of outbound frames, with periodic pings to
/// keep NAT bindings fresh. A ping still unanswered when the next one is
/// due means a half-open socket; closing the sink fails the reader and
/// tears the session down within two ping intervals.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    ping_interval: Duration,
    limits: FrameLimits,
    peer_alive: Arc<AtomicBool>,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    loop {
        let frame = tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => {
                if !peer_alive.swap(false, Ordering::Relaxed) {
                    warn!("heartbeat unanswered, dropping session");
                    break;
                }
                Frame::ping(protocol::ping_id())
            },
        };
        let text = match protocol::encode(&frame, &limits) {
            Ok(text) => text,
            Err(e) => {
                warn!(tag = frame.payload.tag(), "unencodable frame skipped: {e}");
                continue;
            },
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn next_frame(
    stream: &mut SplitStream<WebSocket>,
    limits: &FrameLimits,
) -> Option<Frame> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match protocol::decode(&text, limits) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!("undecodable frame during handshake: {e}");
                    return None;
                },
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
    limits: &FrameLimits,
) {
    if let Ok(text) = protocol::encode(frame, limits) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
}
