//! Outbound relay session to the broker.
//!
//! One long-lived WebSocket, redialed forever with exponential backoff
//! until shutdown. Per session the client runs a reader (this task) and a
//! writer task joined by a bounded outbound queue; the writer is the only
//! producer of bytes on the socket and emits a PING after every idle
//! interval. An unanswered PING by the time the next would go out declares
//! the session dead.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    futures::{SinkExt, StreamExt},
    rand::Rng,
    tokio::{
        sync::{mpsc, watch},
        time::{Duration, timeout},
    },
    tokio_tungstenite::tungstenite::Message,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use backhaul_protocol::{
    self as protocol, AUTH_TIMEOUT_SECS, Frame, FrameLimits, FramePayload, codes,
};

use secrecy::ExposeSecret;

use crate::{
    config::ConnectorConfig,
    error::{Error, Result},
    relay::{ActiveRequests, handle_request},
    upstream::LlmClient,
};

/// Session lifecycle, observable through [`RelayClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Closing,
}

/// Outbound frame queue depth per session.
const OUTBOUND_QUEUE_FRAMES: usize = 64;

pub struct RelayClient {
    config: Arc<ConnectorConfig>,
    upstream: Arc<LlmClient>,
    models: Vec<String>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    active: Arc<ActiveRequests>,
}

impl RelayClient {
    pub fn new(config: Arc<ConnectorConfig>, upstream: Arc<LlmClient>, models: Vec<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            upstream,
            models,
            state_tx,
            shutdown: CancellationToken::new(),
            active: Arc::new(ActiveRequests::new()),
        }
    }

    /// Observable connection state, for the health endpoint.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Token that stops the reconnect loop and initiates a graceful drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dial, serve, redial until shutdown. Backoff resets after every
    /// successfully authenticated session.
    pub async fn run(&self) -> Result<()> {
        let mut attempt: u32 = 0;

        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            match self.run_session().await {
                Ok(authenticated) => {
                    if authenticated {
                        attempt = 0;
                    }
                },
                Err(e) => warn!("session error: {e}"),
            }
            self.set_state(ConnectionState::Disconnected);

            if self.shutdown.is_cancelled() {
                break;
            }
            attempt += 1;
            let delay = backoff_delay(
                attempt,
                self.config.reconnect_base_delay,
                self.config.reconnect_max_delay,
            );
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to broker");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("relay client stopped");
        Ok(())
    }

    /// One connect-auth-serve cycle. Returns whether AUTH_OK was reached,
    /// so the caller knows to reset its backoff.
    async fn run_session(&self) -> Result<bool> {
        let limits = self.config.limits;
        info!(url = %self.config.broker_url, "connecting to broker");
        let (ws, _) = tokio_tungstenite::connect_async(&self.config.broker_url).await?;
        let (mut sink, mut stream) = ws.split();

        // Handshake: AUTH out, AUTH_OK back within the timeout.
        self.set_state(ConnectionState::Authenticating);
        let auth = Frame::auth(
            protocol::auth_id(),
            self.config.token.expose_secret().clone(),
            self.models.clone(),
        );
        sink.send(Message::Text(protocol::encode(&auth, &limits)?))
            .await?;

        let session_id = match timeout(
            Duration::from_secs(AUTH_TIMEOUT_SECS),
            next_frame(&mut stream, &limits),
        )
        .await
        {
            Ok(Some(frame)) => match frame.payload {
                FramePayload::AuthOk(payload) => payload.session_id,
                FramePayload::AuthFail(payload) => {
                    let _ = sink.close().await;
                    return Err(Error::AuthRejected {
                        reason: payload.error,
                    });
                },
                other => {
                    let _ = sink.close().await;
                    return Err(Error::message(format!(
                        "unexpected {} during handshake",
                        other.tag()
                    )));
                },
            },
            Ok(None) => return Err(Error::message("transport closed during handshake")),
            Err(_) => {
                let _ = sink.close().await;
                return Err(Error::message("authentication timeout"));
            },
        };

        self.set_state(ConnectionState::Authenticated);
        info!(session_id = %session_id, models = ?self.models, "authenticated with broker");

        // Correlation ids are scoped to this session; a fresh queue and
        // registry guarantee nothing leaks across reconnects.
        let (outbound, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_FRAMES);
        let peer_alive = Arc::new(AtomicBool::new(true));
        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            self.config.ping_interval,
            limits,
            Arc::clone(&peer_alive),
        ));

        // A half-open socket never fails the reader, so the writer ending
        // (heartbeat verdict or send failure) must also end the session.
        let mut writer_done = false;
        let draining = tokio::select! {
            draining = self.read_loop(&mut stream, &outbound, &peer_alive, &limits) => draining,
            _ = &mut writer => {
                writer_done = true;
                warn!("session writer ended, dropping session");
                false
            },
        };

        if draining {
            self.set_state(ConnectionState::Closing);
            self.drain().await;
        } else {
            // Session died under us: release every upstream call now.
            self.active.cancel_all();
        }

        drop(outbound);
        if !writer_done {
            let _ = writer.await;
        }
        Ok(true)
    }

    /// Reader half. Returns true when the loop ended because shutdown was
    /// requested (drain still owed), false on transport loss.
    async fn read_loop(
        &self,
        stream: &mut (impl StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
        outbound: &mpsc::Sender<Frame>,
        peer_alive: &Arc<AtomicBool>,
        limits: &FrameLimits,
    ) -> bool {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return true,
                maybe = stream.next() => match maybe {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("transport error: {e}");
                        return false;
                    },
                    None => {
                        info!("broker closed the session");
                        return false;
                    },
                },
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return false,
                _ => continue,
            };

            let frame = match protocol::decode(&text, limits) {
                Ok(frame) => frame,
                Err(protocol::Error::FrameTooLarge { id, len, max }) => {
                    warn!(len, max, "oversized frame, dropping session");
                    let _ = outbound
                        .send(Frame::error(id, 413, "frame too large", codes::FRAME_TOO_LARGE))
                        .await;
                    return false;
                },
                Err(e) => {
                    // Decode failure is fatal to the session.
                    warn!("decode failure, dropping session: {e}");
                    return false;
                },
            };

            match frame.payload {
                FramePayload::Request(payload) => {
                    tokio::spawn(handle_request(
                        frame.id,
                        payload,
                        Arc::clone(&self.upstream),
                        outbound.clone(),
                        Arc::clone(&self.active),
                        limits.max_chunk_bytes,
                    ));
                },
                FramePayload::Cancel(_) => self.active.cancel(&frame.id),
                FramePayload::Ping(_) => {
                    let _ = outbound.send(Frame::pong(frame.id)).await;
                },
                FramePayload::Pong(_) => {
                    peer_alive.store(true, Ordering::Relaxed);
                },
                other => {
                    warn!(tag = other.tag(), "unexpected frame direction, dropped");
                },
            }
        }
    }

    /// Bounded wait for in-flight requests after a shutdown signal.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while !self.active.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.active.len(), "drain deadline reached, cancelling");
                self.active.cancel_all();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

/// Writer half: sole serializer of outbound frames. Emits a PING after
/// every idle interval; if the previous PING went unanswered the session is
/// declared dead by closing the sink, which fails the reader.
async fn write_loop(
    mut sink: impl SinkExt<Message> + Unpin,
    mut outbound: mpsc::Receiver<Frame>,
    ping_interval: Duration,
    limits: FrameLimits,
    peer_alive: Arc<AtomicBool>,
) {
    let idle = tokio::time::sleep(ping_interval);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(frame) = maybe else { break };
                if !write_frame(&mut sink, &frame, &limits).await {
                    break;
                }
                idle.as_mut().reset(tokio::time::Instant::now() + ping_interval);
            },
            _ = &mut idle => {
                if !peer_alive.swap(false, Ordering::Relaxed) {
                    warn!("heartbeat unanswered, dropping session");
                    break;
                }
                let ping = Frame::ping(protocol::ping_id());
                if !write_frame(&mut sink, &ping, &limits).await {
                    break;
                }
                debug!("heartbeat ping sent");
                idle.as_mut().reset(tokio::time::Instant::now() + ping_interval);
            },
        }
    }
    let _ = sink.close().await;
}

async fn write_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &Frame,
    limits: &FrameLimits,
) -> bool {
    let text = match protocol::encode(frame, limits) {
        Ok(text) => text,
        Err(e) => {
            warn!(tag = frame.payload.tag(), "unencodable frame skipped: {e}");
            return true;
        },
    };
    sink.send(Message::Text(text)).await.is_ok()
}

async fn next_frame(
    stream: &mut (impl StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
    limits: &FrameLimits,
) -> Option<Frame> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return protocol::decode(&text, limits).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Exponential backoff with ±25 % jitter: base · 2^(attempt−1), capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(1u32 << exponent).min(cap);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(jitter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        let first = backoff_delay(1, base, cap);
        assert!(first >= Duration::from_millis(750), "got {first:?}");
        assert!(first <= Duration::from_millis(1250), "got {first:?}");

        let fourth = backoff_delay(4, base, cap);
        assert!(fourth >= Duration::from_secs(6), "got {fourth:?}");
        assert!(fourth <= Duration::from_secs(10), "got {fourth:?}");

        let huge = backoff_delay(30, base, cap);
        assert!(huge <= cap.mul_f64(1.25), "got {huge:?}");
        assert!(huge >= cap.mul_f64(0.75), "got {huge:?}");
    }

    #[test]
    fn backoff_jitter_varies() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let samples: Vec<Duration> = (0..16).map(|_| backoff_delay(3, base, cap)).collect();
        let all_equal = samples.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "jitter should vary across samples");
    }

    #[test]
    fn initial_state_is_disconnected() {
        let config = Arc::new(ConnectorConfig::new("ws://b/ws", "t", "http://l"));
        let upstream = Arc::new(LlmClient::new(&config).unwrap());
        let client = RelayClient::new(config, upstream, vec!["m".into()]);
        assert_eq!(*client.state().borrow(), ConnectionState::Disconnected);
    }
}
