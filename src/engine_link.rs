//! Speech-engine WebSocket: connect with retry, handshake wait, keepalive,
//! and the reader/writer tasks for an established session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::AudioChunk;
use crate::error::{BridgeError, Peer, Result};
use crate::protocol::EngineFrame;
use crate::queue::{QueueReceiver, QueueSender};
use crate::session::{Counter, EventTx, SessionEvent, SessionStats, Stage};
use crate::text_sink::TextSink;
use crate::ws::WsSender;

pub type EngineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type EngineSink = SplitSink<EngineSocket, Message>;
pub type EngineSource = SplitStream<EngineSocket>;
pub type EngineSender = WsSender<EngineSink>;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Open the engine socket, retrying per `policy`. Each attempt is bounded by
/// `attempt_timeout`.
pub async fn connect(
    url: &Url,
    attempt_timeout: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<EngineSocket> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!(attempt, attempts, host = url.host_str().unwrap_or("-"), "connecting to engine");
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            r = tokio::time::timeout(attempt_timeout, connect_async(url.as_str())) => r,
        };
        match result {
            Ok(Ok((socket, _response))) => {
                info!(attempt, "engine connected");
                return Ok(socket);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", attempt_timeout),
        }

        if attempt < attempts {
            let delay = policy.delay_for(attempt);
            warn!(attempt, attempts, "engine connect failed: {}; retrying in {:?}", last_error, delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            warn!(attempt, attempts, "engine connect failed: {}", last_error);
        }
    }

    Err(BridgeError::EngineUnreachable {
        attempts,
        last_error,
    })
}

/// Read until the engine's handshake byte. Anything before it is discarded.
/// Returns the number of discarded frames.
pub async fn wait_handshake<S>(source: &mut S, timeout: Duration) -> Result<u32>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut discarded = 0u32;
    loop {
        let next = tokio::time::timeout_at(deadline, source.next())
            .await
            .map_err(|_| BridgeError::HandshakeTimeout(timeout))?;
        match next {
            Some(Ok(Message::Binary(data))) => match EngineFrame::decode(&data) {
                Ok(EngineFrame::Handshake) => {
                    info!(discarded, "engine handshake received");
                    return Ok(discarded);
                }
                Ok(frame) => {
                    discarded += 1;
                    warn!(kind = frame.kind(), "unexpected engine frame before handshake");
                }
                Err(e) => {
                    discarded += 1;
                    warn!("undecodable engine frame before handshake: {}", e);
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "engine closed during handshake");
                return Err(BridgeError::RemoteDisconnect(Peer::Engine));
            }
            Some(Ok(Message::Text(text))) => {
                discarded += 1;
                warn!(len = text.len(), "unexpected text message before handshake");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(BridgeError::RemoteDisconnect(Peer::Engine)),
        }
    }
}

/// The single writer of the engine socket. Audio and keepalive frames share `rx`.
pub async fn run_writer(
    mut rx: QueueReceiver<EngineFrame>,
    sender: Arc<EngineSender>,
    stats: Arc<SessionStats>,
    events: EventTx,
    cancel: CancellationToken,
) {
    debug!("engine writer started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            f = rx.pop() => match f {
                Some(f) => f,
                None => break,
            },
        };
        let is_audio = matches!(frame, EngineFrame::Audio(_));
        if let Err(e) = sender.send(Message::Binary(frame.encode())).await {
            warn!("engine send failed: {}", e);
            let _ = events.send(SessionEvent::Failed(e)).await;
            break;
        }
        stats.incr(Counter::EngineFramesSent);
        if is_audio {
            stats.touch(Stage::EngineOut);
        } else {
            stats.incr(Counter::KeepalivesSent);
        }
    }
    debug!("engine writer exited");
}

/// Periodic handshake-tagged keepalive through the engine send queue.
pub async fn run_keepalive(
    mut tx: QueueSender<EngineFrame>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let pushed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = tx.push(EngineFrame::Handshake) => r,
                };
                if pushed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("engine keepalive exited");
}

/// Everything the engine reader needs besides the socket.
pub struct ReaderContext {
    pub session_id: String,
    pub model_rate: u32,
    pub text_sink: Arc<dyn TextSink>,
    pub stats: Arc<SessionStats>,
    pub events: EventTx,
    pub cancel: CancellationToken,
}

/// The single reader of the engine socket. Audio goes to the decode queue,
/// text to the sink, keepalives only update activity.
pub async fn run_reader<S>(mut source: S, mut codec_tx: QueueSender<AudioChunk>, ctx: ReaderContext)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    debug!("engine reader started");
    let stats = &ctx.stats;
    loop {
        let msg = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            m = source.next() => m,
        };
        match msg {
            Some(Ok(Message::Binary(data))) => {
                stats.touch(Stage::EngineIn);
                match EngineFrame::decode(&data) {
                    Ok(EngineFrame::Handshake) => stats.incr(Counter::KeepalivesReceived),
                    Ok(EngineFrame::Audio(packet)) => {
                        stats.incr(Counter::EngineAudioFramesReceived);
                        if packet.is_empty() {
                            continue;
                        }
                        let chunk = AudioChunk::codec(packet, ctx.model_rate);
                        let pushed = tokio::select! {
                            _ = ctx.cancel.cancelled() => break,
                            r = codec_tx.push(chunk) => r,
                        };
                        if pushed.is_err() {
                            break;
                        }
                    }
                    Ok(EngineFrame::Text(text)) => {
                        stats.incr(Counter::EngineTextFrames);
                        ctx.text_sink.on_text(&ctx.session_id, &text_lossy(&text)).await;
                    }
                    Err(e) => warn!("skipping engine frame: {}", e),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "engine closed the connection");
                let _ = ctx.events.send(SessionEvent::EngineClosed).await;
                break;
            }
            Some(Ok(Message::Text(text))) => debug!(len = text.len(), "ignoring engine text message"),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("engine read error: {}", e);
                let _ = ctx.events.send(SessionEvent::EngineClosed).await;
                break;
            }
            None => {
                info!("engine stream ended");
                let _ = ctx.events.send(SessionEvent::EngineClosed).await;
                break;
            }
        }
    }
    codec_tx.finish().await;
    debug!("engine reader exited");
}

fn text_lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
