//! Telephony → engine: ingest, resample feed, and encode.
//!
//! ```text
//! provider ws ─ingest─▶ [inbound_pcm] ─feed─▶ transformer ─encode─▶ [engine_out] ─▶ engine writer
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::FailureStreak;
use super::{Counter, EventTx, SessionEvent, SessionStats, Stage};
use crate::audio::pcm::{self, SampleAligner};
use crate::audio::resampler::{TransformerReader, TransformerWriter};
use crate::audio::{AudioChunk, AudioEncoder};
use crate::protocol::{EngineFrame, ProviderFrame};
use crate::provider_link::{Incoming, classify};
use crate::queue::{QueueReceiver, QueueSender};

/// Provider audio that arrived before the engine was ready.
///
/// Bounded; when full the oldest frame is dropped and counted.
#[derive(Debug)]
pub struct PreStreamBuffer {
    capacity: usize,
    frames: VecDeque<Bytes>,
    stop_seen: bool,
    stream_sid: Option<String>,
}

/// Result of feeding one provider read into the pre-stream buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum PreStreamStatus {
    Open,
    Disconnected,
}

impl PreStreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity.min(1024)),
            stop_seen: false,
            stream_sid: None,
        }
    }

    pub fn accept(
        &mut self,
        msg: Option<Result<Message, WsError>>,
        stats: &SessionStats,
    ) -> PreStreamStatus {
        match classify(msg) {
            Incoming::Frame(ProviderFrame::Media(pcm)) => {
                stats.incr(Counter::InboundFrames);
                stats.add(Counter::InboundBytes, pcm.len() as u64);
                stats.touch(Stage::ProviderIn);
                if self.stop_seen || self.capacity == 0 {
                    stats.incr(Counter::PreStreamDropped);
                    return PreStreamStatus::Open;
                }
                if self.frames.len() == self.capacity {
                    self.frames.pop_front();
                    stats.incr(Counter::PreStreamDropped);
                }
                self.frames.push_back(pcm);
            }
            Incoming::Frame(ProviderFrame::Start { stream_sid }) => {
                info!(stream_sid = stream_sid.as_deref().unwrap_or("-"), "provider stream started");
                self.stream_sid = stream_sid;
            }
            Incoming::Frame(ProviderFrame::Stop) => {
                info!(buffered = self.frames.len(), "stop received before engine was ready");
                self.stop_seen = true;
            }
            Incoming::Frame(ProviderFrame::Mark(name)) => debug!(?name, "mark"),
            Incoming::Skip => {}
            Incoming::Closed => return PreStreamStatus::Disconnected,
        }
        PreStreamStatus::Open
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }
}

pub struct IngestContext {
    pub provider_rate: u32,
    pub silence_tail_ms: u32,
    pub stream_sid: watch::Sender<Option<String>>,
    pub stats: Arc<SessionStats>,
    pub events: EventTx,
    pub cancel: CancellationToken,
}

/// Reads the provider socket for the rest of the call.
///
/// Replays the pre-stream buffer first. On STOP the receive loop ends at once;
/// the socket is then only watched for the peer hanging up.
pub async fn run_ingest<S>(
    mut source: S,
    mut prestream: PreStreamBuffer,
    mut pcm_tx: QueueSender<AudioChunk>,
    ctx: IngestContext,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    debug!(replay = prestream.len(), "ingest started");
    while let Some(frame) = prestream.frames.pop_front() {
        let pushed = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            r = pcm_tx.push(AudioChunk::pcm16(frame, ctx.provider_rate)) => r,
        };
        if pushed.is_err() {
            return;
        }
    }
    if prestream.stop_seen {
        end_of_input(&mut pcm_tx, &ctx).await;
        let _ = ctx.events.send(SessionEvent::StopReceived).await;
        watch_for_hangup(source, &ctx).await;
        return;
    }

    loop {
        let msg = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            m = source.next() => m,
        };
        match classify(msg) {
            Incoming::Frame(ProviderFrame::Media(pcm)) => {
                ctx.stats.incr(Counter::InboundFrames);
                ctx.stats.add(Counter::InboundBytes, pcm.len() as u64);
                ctx.stats.touch(Stage::ProviderIn);
                let pushed = tokio::select! {
                    _ = ctx.cancel.cancelled() => return,
                    r = pcm_tx.push(AudioChunk::pcm16(pcm, ctx.provider_rate)) => r,
                };
                if pushed.is_err() {
                    debug!("inbound queue closed");
                    return;
                }
            }
            Incoming::Frame(ProviderFrame::Start { stream_sid }) => {
                info!(stream_sid = stream_sid.as_deref().unwrap_or("-"), "provider stream started");
                ctx.stats.reset_counters();
                ctx.stream_sid.send_replace(stream_sid.clone());
                let _ = ctx.events.send(SessionEvent::Started { stream_sid }).await;
            }
            Incoming::Frame(ProviderFrame::Stop) => {
                info!(
                    inbound_frames = ctx.stats.get(Counter::InboundFrames),
                    outbound_frames = ctx.stats.get(Counter::OutboundFrames),
                    engine_frames_sent = ctx.stats.get(Counter::EngineFramesSent),
                    "STOP received"
                );
                end_of_input(&mut pcm_tx, &ctx).await;
                let _ = ctx.events.send(SessionEvent::StopReceived).await;
                watch_for_hangup(source, &ctx).await;
                return;
            }
            Incoming::Frame(ProviderFrame::Mark(name)) => debug!(?name, "mark"),
            Incoming::Skip => {}
            Incoming::Closed => {
                end_of_input(&mut pcm_tx, &ctx).await;
                let _ = ctx.events.send(SessionEvent::ProviderClosed).await;
                return;
            }
        }
    }
}

/// Silence tail so the engine notices end of turn, then the sentinel.
async fn end_of_input(pcm_tx: &mut QueueSender<AudioChunk>, ctx: &IngestContext) {
    if ctx.silence_tail_ms > 0 {
        let tail = pcm::silence(ctx.provider_rate, ctx.silence_tail_ms);
        tokio::select! {
            _ = ctx.cancel.cancelled() => {}
            _ = pcm_tx.push(AudioChunk::pcm16(tail, ctx.provider_rate)) => {}
        }
    }
    pcm_tx.finish().await;
}

async fn watch_for_hangup<S>(mut source: S, ctx: &IngestContext)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            m = source.next() => m,
        };
        if let Incoming::Closed = classify(msg) {
            let _ = ctx.events.send(SessionEvent::ProviderClosed).await;
            return;
        }
    }
}

/// Feeds provider-rate PCM into the inbound transformer; half-closes it at end of input.
pub async fn run_resample_feed(
    mut pcm_rx: QueueReceiver<AudioChunk>,
    mut writer: TransformerWriter,
    stats: Arc<SessionStats>,
    events: EventTx,
    cancel: CancellationToken,
) {
    let mut streak = FailureStreak::new("in_resample");
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            c = pcm_rx.pop() => c,
        };
        let Some(chunk) = chunk else { break };
        let fed = tokio::select! {
            _ = cancel.cancelled() => return,
            r = writer.feed(&chunk.data) => r,
        };
        match fed {
            Ok(()) => streak.succeeded(),
            Err(e) => {
                if let Err(fatal) = streak.failed(&e, &stats) {
                    let _ = events.send(SessionEvent::Failed(fatal)).await;
                    return;
                }
            }
        }
    }
    writer.finish().await;
    debug!("inbound transformer input closed");
}

/// Reads model-rate PCM from the transformer, encodes it, and queues audio
/// frames for the engine. Flushes the encoder at end of stream.
pub async fn run_encode(
    mut reader: TransformerReader,
    mut encoder: Box<dyn AudioEncoder>,
    mut engine_tx: QueueSender<EngineFrame>,
    stats: Arc<SessionStats>,
    events: EventTx,
    cancel: CancellationToken,
) {
    let mut aligner = SampleAligner::default();
    let mut streak = FailureStreak::new("encode");
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            r = reader.read() => r,
        };
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!("inbound transformer read failed: {}", e);
                let _ = events.send(SessionEvent::Failed(e)).await;
                return;
            }
        };
        stats.touch(Stage::Resampled);
        let pcm = aligner.align(&bytes);
        if pcm.is_empty() {
            continue;
        }
        let packets = match encoder.encode(&pcm::pcm16_to_f32(&pcm)) {
            Ok(packets) => {
                streak.succeeded();
                packets
            }
            Err(e) => {
                if let Err(fatal) = streak.failed(&e, &stats) {
                    let _ = events.send(SessionEvent::Failed(fatal)).await;
                    return;
                }
                continue;
            }
        };
        if !forward(packets, &mut engine_tx, &stats, &cancel).await {
            return;
        }
    }

    match encoder.flush() {
        Ok(packets) => {
            forward(packets, &mut engine_tx, &stats, &cancel).await;
        }
        Err(e) => warn!("encoder flush failed: {}", e),
    }
    debug!("inbound encoder finished");
}

async fn forward(
    packets: Vec<Bytes>,
    engine_tx: &mut QueueSender<EngineFrame>,
    stats: &SessionStats,
    cancel: &CancellationToken,
) -> bool {
    for packet in packets {
        stats.touch(Stage::Encoded);
        let pushed = tokio::select! {
            _ = cancel.cancelled() => return false,
            r = engine_tx.push(EngineFrame::Audio(packet)) => r,
        };
        if pushed.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_media;
    use crate::queue::bounded;
    use futures_util::stream;

    fn media(pcm: &[u8]) -> Option<Result<Message, WsError>> {
        Some(Ok(Message::text(encode_media(pcm, None))))
    }

    fn ingest_ctx(tail_ms: u32) -> (IngestContext, crate::session::EventRx, Arc<SessionStats>) {
        let (events, rx) = crate::session::event_channel();
        let stats = Arc::new(SessionStats::new());
        let (sid, _) = watch::channel(None);
        (
            IngestContext {
                provider_rate: 8000,
                silence_tail_ms: tail_ms,
                stream_sid: sid,
                stats: stats.clone(),
                events,
                cancel: CancellationToken::new(),
            },
            rx,
            stats,
        )
    }

    #[test]
    fn prestream_drops_oldest() {
        let stats = SessionStats::new();
        let mut buf = PreStreamBuffer::new(2);
        for i in 0..4u8 {
            assert_eq!(buf.accept(media(&[i, i]), &stats), PreStreamStatus::Open);
        }
        assert_eq!(buf.len(), 2);
        assert_eq!(stats.get(Counter::PreStreamDropped), 2);
        assert_eq!(stats.get(Counter::InboundFrames), 4);
        assert_eq!(buf.frames[0].as_ref(), &[2, 2]);
        assert_eq!(
            buf.accept(Some(Ok(Message::Close(None))), &stats),
            PreStreamStatus::Disconnected
        );
    }

    #[test]
    fn prestream_records_start_and_stop() {
        let stats = SessionStats::new();
        let mut buf = PreStreamBuffer::new(4);
        let start = r#"{"event":"start","start":{"stream_sid":"MZ1"}}"#;
        buf.accept(Some(Ok(Message::text(start))), &stats);
        buf.accept(Some(Ok(Message::text(r#"{"event":"stop"}"#))), &stats);
        assert_eq!(buf.stream_sid(), Some("MZ1"));
        assert!(buf.stop_seen);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn media_after_prestream_stop_is_counted_as_dropped() {
        let stats = SessionStats::new();
        let mut buf = PreStreamBuffer::new(4);
        buf.accept(media(&[1, 1]), &stats);
        buf.accept(Some(Ok(Message::text(r#"{"event":"stop"}"#))), &stats);
        buf.accept(media(&[2, 2]), &stats);
        buf.accept(media(&[3, 3]), &stats);

        assert_eq!(buf.len(), 1);
        assert_eq!(stats.get(Counter::InboundFrames), 3);
        assert_eq!(stats.get(Counter::PreStreamDropped), 2);
    }

    #[tokio::test]
    async fn ingest_replays_then_stops_with_silence_tail() {
        let (ctx, mut events, stats) = ingest_ctx(20);
        let stats_before = stats.get(Counter::InboundFrames);
        let mut pre = PreStreamBuffer::new(8);
        pre.accept(media(&[1, 1]), &stats);

        let source = stream::iter(vec![
            media(&[2, 2]).unwrap(),
            Ok(Message::text(r#"{"event":"mark","mark":{"name":"m"}}"#)),
            media(&[3, 3]).unwrap(),
            Ok(Message::text(r#"{"event":"stop"}"#)),
            media(&[4, 4]).unwrap(),
        ]);
        let (tx, mut rx) = bounded("inbound_pcm", 16);
        run_ingest(source, pre, tx, ctx).await;

        let mut chunks = Vec::new();
        while let Some(c) = rx.pop().await {
            chunks.push(c.data);
        }
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].as_ref(), &[1, 1]);
        assert_eq!(chunks[1].as_ref(), &[2, 2]);
        assert_eq!(chunks[2].as_ref(), &[3, 3]);
        assert_eq!(chunks[3].len(), 320);
        assert!(chunks[3].iter().all(|&b| b == 0));
        assert_eq!(stats.get(Counter::InboundFrames) - stats_before, 3);

        assert!(matches!(events.recv().await, Some(SessionEvent::StopReceived)));
        // stream ends after STOP, seen as hangup
        assert!(matches!(events.recv().await, Some(SessionEvent::ProviderClosed)));
    }

    #[tokio::test]
    async fn start_resets_counters_and_publishes_sid() {
        let (ctx, mut events, stats) = ingest_ctx(0);
        let sid_rx = ctx.stream_sid.subscribe();
        let source = stream::iter(vec![
            media(&[1, 1]).unwrap(),
            Ok(Message::text(r#"{"event":"start","stream_sid":"abc"}"#)),
            media(&[2, 2]).unwrap(),
        ]);
        let (tx, mut rx) = bounded("inbound_pcm", 16);
        run_ingest(source, PreStreamBuffer::new(0), tx, ctx).await;

        assert_eq!(stats.get(Counter::InboundFrames), 1);
        assert_eq!(sid_rx.borrow().as_deref(), Some("abc"));
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::Started { stream_sid: Some(s) }) if s == "abc"
        ));
        assert!(matches!(events.recv().await, Some(SessionEvent::ProviderClosed)));
        assert_eq!(rx.pop().await.unwrap().data.as_ref(), &[1, 1]);
        assert_eq!(rx.pop().await.unwrap().data.as_ref(), &[2, 2]);
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test]
    async fn resample_and_encode_preserve_order() {
        use crate::audio::resampler;

        struct PassEncoder;
        impl AudioEncoder for PassEncoder {
            fn encode(&mut self, pcm: &[f32]) -> anyhow::Result<Vec<Bytes>> {
                Ok(vec![pcm::f32_to_pcm16(pcm)])
            }
            fn flush(&mut self) -> anyhow::Result<Vec<Bytes>> {
                Ok(Vec::new())
            }
        }

        let (handle, writer, reader) = resampler::spawn("cat", &[], "test").unwrap();
        let (mut pcm_tx, pcm_rx) = bounded("inbound_pcm", 8);
        let (engine_tx, mut engine_rx) = bounded("engine_out", 64);
        let (events, _events_rx) = crate::session::event_channel();
        let stats = Arc::new(SessionStats::new());
        let cancel = CancellationToken::new();

        let feed = tokio::spawn(run_resample_feed(
            pcm_rx,
            writer,
            stats.clone(),
            events.clone(),
            cancel.clone(),
        ));
        let encode = tokio::spawn(run_encode(
            reader,
            Box::new(PassEncoder),
            engine_tx,
            stats.clone(),
            events,
            cancel.clone(),
        ));

        let mut expected = Vec::new();
        for seq in 0..200u16 {
            let chunk: Vec<u8> = std::iter::repeat_n(seq.to_le_bytes(), 80).flatten().collect();
            expected.extend_from_slice(&chunk);
            pcm_tx.push(AudioChunk::pcm16(Bytes::from(chunk), 8000)).await.unwrap();
        }
        pcm_tx.finish().await;

        let mut got = Vec::new();
        while let Some(frame) = engine_rx.pop().await {
            match frame {
                EngineFrame::Audio(p) => got.extend_from_slice(&p),
                other => panic!("unexpected {:?}", other),
            }
        }
        feed.await.unwrap();
        encode.await.unwrap();
        handle.shutdown().await;
        assert_eq!(got, expected);
    }
}
