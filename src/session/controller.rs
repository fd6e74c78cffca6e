//! Session lifecycle: engine setup, pipeline wiring, STOP/drain, teardown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::drain::{DrainTracker, OutboundActivity};
use super::heartbeat::run_heartbeat;
use super::inbound::{self, IngestContext, PreStreamBuffer, PreStreamStatus};
use super::outbound;
use super::stats::StatsSnapshot;
use super::teardown::{SessionResources, Teardown};
use super::{EventRx, Session, SessionEvent, SessionState, SessionStats, Stage, event_channel};
use crate::audio::pcm::FrameSlicer;
use crate::audio::{AudioChunk, SharedCodec, resampler};
use crate::config::BridgeConfig;
use crate::engine_link::{self, EngineSender, EngineSink, EngineSource, ReaderContext};
use crate::error::{BridgeError, CloseReason, Peer, Result};
use crate::protocol::EngineFrame;
use crate::provider_link::{self, ProviderSender, ProviderSocket, ProviderSource, WriterContext};
use crate::queue::{QueueGauge, bounded};
use crate::text_sink::TextSink;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Process-wide collaborators shared by every session.
pub struct BridgeContext {
    pub config: Arc<BridgeConfig>,
    pub codec: SharedCodec,
    pub text_sink: Arc<dyn TextSink>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub final_state: SessionState,
    pub close_reason: CloseReason,
    pub stats: StatsSnapshot,
    pub duration: Duration,
}

impl SessionReport {
    /// A connection that never became a session (failed upgrade).
    pub fn rejected(session: Session) -> Self {
        Self {
            session_id: session.id,
            final_state: SessionState::Failed,
            close_reason: CloseReason::Normal,
            stats: StatsSnapshot::default(),
            duration: Duration::ZERO,
        }
    }
}

/// Run one call from accept to teardown.
pub async fn run_session(
    session: Session,
    socket: ProviderSocket,
    ctx: Arc<BridgeContext>,
    root: CancellationToken,
) -> SessionReport {
    let config = ctx.config.clone();
    let stats = Arc::new(SessionStats::new());
    let cancel = root.child_token();
    let teardown = Teardown::new(cancel.clone());

    let (sink, mut source) = socket.split();
    let provider = Arc::new(ProviderSender::new(Peer::Provider, sink));
    teardown.register(|r| r.sockets.push(provider.clone()));

    info!("session started");
    session.transition(SessionState::ConnectingEngine);

    // Engine setup races the provider socket so early caller audio is
    // buffered instead of left unread.
    let mut prestream = PreStreamBuffer::new(config.pre_stream_buffer_frames);
    let setup = establish(&session, &config, &cancel);
    tokio::pin!(setup);
    let outcome = loop {
        tokio::select! {
            res = &mut setup => break Some(res),
            msg = source.next() => {
                if prestream.accept(msg, &stats) == PreStreamStatus::Disconnected {
                    break None;
                }
            }
        }
    };

    let (engine_sink, engine_source) = match outcome {
        Some(Ok(halves)) => halves,
        Some(Err(err)) => {
            let (state, reason) = setup_failure(&err);
            error!(reason = reason.as_str(), "engine setup failed: {}", err);
            session.transition(state);
            return finish(&session, &teardown, reason, &stats).await;
        }
        None => {
            info!(buffered = prestream.len(), "provider left before the engine was ready");
            provider.mark_closed();
            session.mark_connection_inactive();
            session.transition(SessionState::Failed);
            return finish(&session, &teardown, CloseReason::Normal, &stats).await;
        }
    };

    let engine = Arc::new(EngineSender::new(Peer::Engine, engine_sink));
    teardown.register(|r| r.sockets.push(engine.clone()));
    session.transition(SessionState::Streaming);

    let (events_tx, events_rx) = event_channel();
    let wiring = Wiring {
        session_id: session.id.clone(),
        ctx: ctx.clone(),
        stats: stats.clone(),
        events: events_tx,
        cancel: cancel.clone(),
        drain_mode: session.drain_watch(),
    };
    let outbound = match teardown_guarded(&teardown, |res| {
        wiring.start(res, source, prestream, engine_source, engine.clone(), provider.clone())
    }) {
        Ok(view) => view,
        Err(err) => {
            error!("pipeline start failed: {}", err);
            session.transition(SessionState::Failed);
            return finish(&session, &teardown, CloseReason::from(&err), &stats).await;
        }
    };

    let ending = supervise(&session, &config, events_rx, &provider, &engine, &outbound, &cancel).await;

    if ending.failed {
        session.transition(SessionState::Failed);
        return finish(&session, &teardown, ending.reason, &stats).await;
    }
    session.transition(SessionState::Closing);
    let report = finish(&session, &teardown, ending.reason, &stats).await;
    session.transition(SessionState::Closed);
    SessionReport {
        final_state: session.state(),
        ..report
    }
}

/// Connect and wait for the engine handshake.
async fn establish(
    session: &Session,
    config: &BridgeConfig,
    cancel: &CancellationToken,
) -> Result<(EngineSink, EngineSource)> {
    let url = config.engine_endpoint()?;
    info!(
        host = url.host_str().unwrap_or("-"),
        path = url.path(),
        "connecting to engine"
    );
    let socket =
        engine_link::connect(&url, config.connect_timeout(), &config.retry_policy(), cancel).await?;
    session.transition(SessionState::WaitingHandshake);

    let (sink, mut source) = socket.split();
    tokio::select! {
        _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
        r = engine_link::wait_handshake(&mut source, config.handshake_timeout()) => { r?; }
    }
    Ok((sink, source))
}

fn setup_failure(err: &BridgeError) -> (SessionState, CloseReason) {
    let reason = CloseReason::from(err);
    let state = match err {
        BridgeError::EngineUnreachable { .. } => SessionState::ConnectFailed,
        BridgeError::HandshakeTimeout(_) => SessionState::HandshakeTimeout,
        _ => SessionState::Failed,
    };
    (state, reason)
}

/// Register resources while building them, so a half-built pipeline is
/// still released by teardown.
fn teardown_guarded<T>(
    teardown: &Teardown,
    build: impl FnOnce(&mut SessionResources) -> Result<T>,
) -> Result<T> {
    let mut out = Err(BridgeError::Cancelled);
    teardown.register(|res| out = build(res));
    out
}

struct Wiring {
    session_id: String,
    ctx: Arc<BridgeContext>,
    stats: Arc<SessionStats>,
    events: super::EventTx,
    cancel: CancellationToken,
    drain_mode: watch::Receiver<bool>,
}

/// The parts of the engine-to-provider path the drain check looks at.
struct OutboundView {
    queues: [QueueGauge; 2],
    stats: Arc<SessionStats>,
}

impl OutboundView {
    fn activity(&self) -> OutboundActivity {
        OutboundActivity::from_stages(
            self.queues.iter().map(QueueGauge::depth).sum(),
            [Stage::Decoded, Stage::Framed, Stage::ProviderOut].map(|stage| self.stats.idle_for(stage)),
        )
    }
}

impl Wiring {
    /// Spawn every streaming task. Returns a view of the outbound path for
    /// the drain idle check.
    fn start(
        self,
        res: &mut SessionResources,
        provider_source: ProviderSource,
        prestream: PreStreamBuffer,
        engine_source: EngineSource,
        engine: Arc<EngineSender>,
        provider: Arc<ProviderSender>,
    ) -> Result<OutboundView> {
        let config = &self.ctx.config;
        let cap = config.queue_capacity;
        let provider_rate = config.provider_sample_rate;
        let model_rate = config.model_sample_rate;

        let encoder = self
            .ctx
            .codec
            .encoder(model_rate)
            .map_err(|e| BridgeError::Codec(format!("{e:#}")))?;
        let decoder = self
            .ctx
            .codec
            .decoder(model_rate)
            .map_err(|e| BridgeError::Codec(format!("{e:#}")))?;
        debug!(codec = self.ctx.codec.name(), model_rate, provider_rate, "codec ready");

        let (in_handle, in_writer, in_reader) = resampler::spawn(
            &config.resampler_program,
            &config.resampler_argv(provider_rate, model_rate),
            "inbound",
        )?;
        res.transformers.push(in_handle);
        let (out_handle, out_writer, out_reader) = resampler::spawn(
            &config.resampler_program,
            &config.resampler_argv(model_rate, provider_rate),
            "outbound",
        )?;
        res.transformers.push(out_handle);

        let (pcm_tx, pcm_rx) = bounded::<AudioChunk>("inbound_pcm", cap);
        let (engine_tx, engine_rx) = bounded::<EngineFrame>("engine_out", cap);
        let (codec_tx, codec_rx) = bounded::<AudioChunk>("engine_audio", cap);
        let (provider_tx, provider_rx) = bounded::<Bytes>("provider_out", cap);
        let gauges = vec![pcm_rx.gauge(), engine_rx.gauge(), codec_rx.gauge(), provider_rx.gauge()];
        let outbound = OutboundView {
            queues: [codec_rx.gauge(), provider_rx.gauge()],
            stats: self.stats.clone(),
        };

        let (sid_tx, sid_rx) = watch::channel(prestream.stream_sid().map(str::to_string));
        let stats = &self.stats;
        let events = &self.events;
        let cancel = &self.cancel;

        // engine side
        res.spawn(
            "engine_writer",
            engine_link::run_writer(engine_rx, engine, stats.clone(), events.clone(), cancel.clone()),
        );
        if let Some(interval) = config.keepalive_interval() {
            res.spawn(
                "keepalive",
                engine_link::run_keepalive(engine_tx.clone(), interval, cancel.clone()),
            );
        }
        res.spawn(
            "engine_reader",
            engine_link::run_reader(
                engine_source,
                codec_tx,
                ReaderContext {
                    session_id: self.session_id.clone(),
                    model_rate,
                    text_sink: self.ctx.text_sink.clone(),
                    stats: stats.clone(),
                    events: events.clone(),
                    cancel: cancel.clone(),
                },
            ),
        );

        // telephony -> engine
        res.spawn(
            "ingest",
            inbound::run_ingest(
                provider_source,
                prestream,
                pcm_tx,
                IngestContext {
                    provider_rate,
                    silence_tail_ms: config.stop_silence_tail_ms,
                    stream_sid: sid_tx,
                    stats: stats.clone(),
                    events: events.clone(),
                    cancel: cancel.clone(),
                },
            ),
        );
        res.spawn(
            "in_resample",
            inbound::run_resample_feed(pcm_rx, in_writer, stats.clone(), events.clone(), cancel.clone()),
        );
        res.spawn(
            "encode",
            inbound::run_encode(in_reader, encoder, engine_tx, stats.clone(), events.clone(), cancel.clone()),
        );

        // engine -> telephony
        res.spawn(
            "decode",
            outbound::run_decode(codec_rx, decoder, out_writer, stats.clone(), events.clone(), cancel.clone()),
        );
        res.spawn(
            "frame",
            outbound::run_frame(
                out_reader,
                FrameSlicer::provider(provider_rate),
                provider_tx,
                stats.clone(),
                events.clone(),
                cancel.clone(),
            ),
        );
        res.spawn(
            "provider_writer",
            provider_link::run_writer(
                provider_rx,
                provider,
                WriterContext {
                    provider_rate,
                    stream_sid: sid_rx,
                    drain_mode: self.drain_mode,
                    policy: config.drain_policy(),
                    stats: stats.clone(),
                    events: events.clone(),
                    cancel: cancel.clone(),
                },
            ),
        );

        if let Some(interval) = config.heartbeat_interval() {
            res.spawn(
                "heartbeat",
                run_heartbeat(stats.clone(), gauges, interval, cancel.clone()),
            );
        }

        Ok(outbound)
    }
}

/// How the streaming phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ending {
    reason: CloseReason,
    /// The bridge's own pipeline broke, rather than a peer leaving.
    failed: bool,
}

impl Ending {
    fn closed(reason: CloseReason) -> Self {
        Self { reason, failed: false }
    }
}

/// Streaming event loop. Returns once the session should close.
async fn supervise(
    session: &Session,
    config: &BridgeConfig,
    mut events: EventRx,
    provider: &ProviderSender,
    engine: &EngineSender,
    outbound: &OutboundView,
    cancel: &CancellationToken,
) -> Ending {
    let policy = config.drain_policy();
    let mut drain: Option<DrainTracker> = None;
    let mut poll = tokio::time::interval(DRAIN_POLL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                return Ending::closed(CloseReason::Shutdown);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("all session tasks exited");
                    return Ending::closed(CloseReason::Normal);
                };
                match event {
                    SessionEvent::Started { stream_sid } => {
                        debug!(stream_sid = stream_sid.as_deref().unwrap_or("-"), "start acknowledged");
                    }
                    SessionEvent::StopReceived => {
                        session.mark_stop_received();
                        session.transition(SessionState::StopReceived);
                        if !policy.enabled {
                            return Ending::closed(CloseReason::Normal);
                        }
                        session.transition(SessionState::Draining);
                        session.enter_drain();
                        drain = Some(DrainTracker::start(&policy, Instant::now()));
                        info!(
                            budget_ms = policy.budget.as_millis() as u64,
                            idle_ms = policy.idle_window.as_millis() as u64,
                            silence = policy.silence_keepalive,
                            "drain started"
                        );
                    }
                    SessionEvent::ProviderClosed => {
                        provider.mark_closed();
                        session.mark_connection_inactive();
                        info!(state = %session.state(), "provider hung up");
                        return Ending::closed(CloseReason::Normal);
                    }
                    SessionEvent::EngineClosed => {
                        engine.mark_closed();
                        if !session.is_draining() {
                            warn!("engine closed mid-call");
                            return Ending::closed(CloseReason::EngineDisconnected);
                        }
                        // Whatever the engine already sent is still in flight.
                        info!("engine closed during drain");
                    }
                    SessionEvent::OutboundFinished => {
                        if let Some(tracker) = &drain {
                            info!(
                                reason = "outbound_finished",
                                elapsed_ms = tracker.elapsed(Instant::now()).as_millis() as u64,
                                "drain finished"
                            );
                            return Ending::closed(CloseReason::Normal);
                        }
                        debug!("outbound pipeline finished");
                    }
                    SessionEvent::Failed(err) => {
                        let reason = CloseReason::from(&err);
                        if reason.is_error() {
                            error!(reason = reason.as_str(), "session failed: {}", err);
                        } else {
                            info!("closing: {}", err);
                        }
                        return Ending {
                            reason,
                            failed: err.is_pipeline_fault(),
                        };
                    }
                }
            }
            _ = poll.tick(), if drain.is_some() => {
                let now = Instant::now();
                if let Some(tracker) = &drain {
                    if let Some(exit) = tracker.poll(now, outbound.activity()) {
                        info!(
                            reason = exit.as_str(),
                            elapsed_ms = tracker.elapsed(now).as_millis() as u64,
                            "drain finished"
                        );
                        return Ending::closed(CloseReason::Normal);
                    }
                }
            }
        }
    }
}

async fn finish(
    session: &Session,
    teardown: &Teardown,
    reason: CloseReason,
    stats: &SessionStats,
) -> SessionReport {
    teardown.close(reason).await;
    let snapshot = stats.snapshot();
    let since_stop = session
        .stop_received_at()
        .map(|at| at.elapsed().as_millis() as u64);
    info!(
        state = %session.state(),
        reason = reason.as_str(),
        duration_ms = stats.elapsed().as_millis() as u64,
        since_stop_ms = since_stop,
        provider_connected = session.connection_active(),
        counters = %snapshot,
        "session ended"
    );
    SessionReport {
        session_id: session.id.clone(),
        final_state: session.state(),
        close_reason: reason,
        stats: snapshot,
        duration: stats.elapsed(),
    }
}
