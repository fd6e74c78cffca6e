//! Telephony-provider WebSocket: message classification and the single
//! writer task that delivers outbound media frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Sink;
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::pcm;
use crate::protocol::{ProviderFrame, ProviderFrameError, decode_provider_frame, encode_media};
use crate::queue::QueueReceiver;
use crate::session::{Counter, DrainPolicy, EventTx, SessionEvent, SessionStats, Stage};
use crate::ws::WsSender;

pub type ProviderSocket = WebSocketStream<TcpStream>;
pub type ProviderSink = SplitSink<ProviderSocket, Message>;
pub type ProviderSource = SplitStream<ProviderSocket>;
pub type ProviderSender = WsSender<ProviderSink>;

/// Provider cadence.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum Incoming {
    Frame(ProviderFrame),
    /// Nothing to act on (ping, binary, unknown event, malformed frame).
    Skip,
    Closed,
}

/// Map one read from the provider socket onto what the session cares about.
pub fn classify(msg: Option<Result<Message, WsError>>) -> Incoming {
    match msg {
        Some(Ok(Message::Text(text))) => match decode_provider_frame(&text) {
            Ok(frame) => Incoming::Frame(frame),
            Err(ProviderFrameError::UnknownEvent(event)) => {
                debug!(event, "skipping provider event");
                Incoming::Skip
            }
            Err(e) => {
                warn!("skipping provider frame: {}", e);
                Incoming::Skip
            }
        },
        Some(Ok(Message::Close(frame))) => {
            info!(?frame, "provider closed the connection");
            Incoming::Closed
        }
        Some(Ok(Message::Binary(data))) => {
            debug!(len = data.len(), "ignoring binary provider message");
            Incoming::Skip
        }
        Some(Ok(_)) => Incoming::Skip,
        Some(Err(e)) => {
            info!("provider read error: {}", e);
            Incoming::Closed
        }
        None => {
            info!("provider stream ended");
            Incoming::Closed
        }
    }
}

pub struct WriterContext {
    pub provider_rate: u32,
    pub stream_sid: watch::Receiver<Option<String>>,
    /// Flips to `true` when the session starts draining.
    pub drain_mode: watch::Receiver<bool>,
    pub policy: DrainPolicy,
    pub stats: Arc<SessionStats>,
    pub events: EventTx,
    pub cancel: CancellationToken,
}

/// The single writer of the provider socket.
///
/// While draining with silence keepalive on, a 20 ms silence frame goes out
/// on each tick once real audio has been absent past the idle threshold.
/// Drain may begin while the writer is parked on an empty queue, so the drain
/// flag is watched alongside it.
pub async fn run_writer<S>(mut rx: QueueReceiver<Bytes>, sender: Arc<WsSender<S>>, mut ctx: WriterContext)
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    debug!("provider writer started");
    let silence = pcm::silence(ctx.provider_rate, FRAME_INTERVAL.as_millis() as u32);
    let mut last_audio = Instant::now();
    let mut drain_watched = true;

    loop {
        let silence_armed = ctx.policy.silence_keepalive && *ctx.drain_mode.borrow_and_update();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            changed = ctx.drain_mode.changed(), if drain_watched => {
                if changed.is_err() {
                    drain_watched = false;
                } else {
                    debug!(draining = *ctx.drain_mode.borrow(), "drain mode changed");
                }
            }
            frame = rx.pop() => {
                let Some(frame) = frame else {
                    info!(
                        frames = ctx.stats.get(Counter::OutboundFrames),
                        "outbound stream complete"
                    );
                    let _ = ctx.events.send(SessionEvent::OutboundFinished).await;
                    break;
                };
                if !deliver(&sender, &frame, &ctx).await {
                    break;
                }
                ctx.stats.incr(Counter::OutboundFrames);
                ctx.stats.add(Counter::OutboundBytes, frame.len() as u64);
                ctx.stats.touch(Stage::ProviderOut);
                last_audio = Instant::now();
            }
            _ = tokio::time::sleep(FRAME_INTERVAL), if silence_armed => {
                if last_audio.elapsed() >= ctx.policy.silence_idle_threshold {
                    if !deliver(&sender, &silence, &ctx).await {
                        break;
                    }
                    ctx.stats.incr(Counter::SilenceFramesSent);
                }
            }
        }
    }
    debug!("provider writer exited");
}

/// Send one media frame. `false` means the socket is gone and the writer should stop.
async fn deliver<S>(sender: &WsSender<S>, pcm: &[u8], ctx: &WriterContext) -> bool
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    if !sender.is_open() {
        return false;
    }
    let text = {
        let sid = ctx.stream_sid.borrow();
        encode_media(pcm, sid.as_deref())
    };
    match sender.send(Message::text(text)).await {
        Ok(()) => true,
        Err(e) => {
            info!("provider send failed, tearing down: {}", e);
            let _ = ctx.events.send(SessionEvent::Failed(e)).await;
            false
        }
    }
}
