//! Engine → telephony: decode, resample, and slice into provider frames.
//!
//! ```text
//! engine reader ─▶ [engine_audio] ─decode─▶ transformer ─frame─▶ [provider_out] ─▶ provider writer
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::FailureStreak;
use super::{Counter, EventTx, SessionEvent, SessionStats, Stage};
use crate::audio::pcm::{self, FrameSlicer};
use crate::audio::resampler::{TransformerReader, TransformerWriter};
use crate::audio::{AudioChunk, AudioDecoder};
use crate::queue::{QueueReceiver, QueueSender};

/// Decodes engine packets and feeds model-rate PCM16 into the outbound transformer.
pub async fn run_decode(
    mut codec_rx: QueueReceiver<AudioChunk>,
    mut decoder: Box<dyn AudioDecoder>,
    mut writer: TransformerWriter,
    stats: Arc<SessionStats>,
    events: EventTx,
    cancel: CancellationToken,
) {
    let mut decode_streak = FailureStreak::new("decode");
    let mut feed_streak = FailureStreak::new("out_resample");
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            c = codec_rx.pop() => c,
        };
        let Some(chunk) = chunk else { break };

        let samples = match decoder.decode(&chunk.data) {
            Ok(samples) => {
                decode_streak.succeeded();
                samples
            }
            Err(e) => {
                if let Err(fatal) = decode_streak.failed(&e, &stats) {
                    let _ = events.send(SessionEvent::Failed(fatal)).await;
                    return;
                }
                continue;
            }
        };
        stats.add(Counter::CodecBytesDecoded, chunk.len() as u64);
        stats.touch(Stage::Decoded);
        if samples.is_empty() {
            continue;
        }

        let pcm16 = pcm::f32_to_pcm16(&samples);
        let fed = tokio::select! {
            _ = cancel.cancelled() => return,
            r = writer.feed(&pcm16) => r,
        };
        match fed {
            Ok(()) => feed_streak.succeeded(),
            Err(e) => {
                if let Err(fatal) = feed_streak.failed(&e, &stats) {
                    let _ = events.send(SessionEvent::Failed(fatal)).await;
                    return;
                }
            }
        }
    }
    writer.finish().await;
    debug!("outbound transformer input closed");
}

/// Reads provider-rate PCM from the transformer and queues 20 ms frames.
pub async fn run_frame(
    mut reader: TransformerReader,
    mut slicer: FrameSlicer,
    mut provider_tx: QueueSender<Bytes>,
    stats: Arc<SessionStats>,
    events: EventTx,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            r = reader.read() => r,
        };
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!("outbound transformer read failed: {}", e);
                let _ = events.send(SessionEvent::Failed(e)).await;
                return;
            }
        };
        stats.touch(Stage::Framed);
        for frame in slicer.push(&bytes) {
            let pushed = tokio::select! {
                _ = cancel.cancelled() => return,
                r = provider_tx.push(frame) => r,
            };
            if pushed.is_err() {
                return;
            }
        }
    }

    if let Some(tail) = slicer.finish() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = provider_tx.push(tail) => {}
        }
    }
    provider_tx.finish().await;
    debug!("outbound framing finished");
}
