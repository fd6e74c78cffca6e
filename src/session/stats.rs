//! Per-session counters and stage activity, shared lock-free by all tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    InboundFrames,
    InboundBytes,
    OutboundFrames,
    OutboundBytes,
    CodecBytesDecoded,
    EngineFramesSent,
    EngineAudioFramesReceived,
    EngineTextFrames,
    KeepalivesSent,
    KeepalivesReceived,
    TranscodeErrors,
    PreStreamDropped,
    SilenceFramesSent,
}

impl Counter {
    pub const ALL: [Counter; 13] = [
        Counter::InboundFrames,
        Counter::InboundBytes,
        Counter::OutboundFrames,
        Counter::OutboundBytes,
        Counter::CodecBytesDecoded,
        Counter::EngineFramesSent,
        Counter::EngineAudioFramesReceived,
        Counter::EngineTextFrames,
        Counter::KeepalivesSent,
        Counter::KeepalivesReceived,
        Counter::TranscodeErrors,
        Counter::PreStreamDropped,
        Counter::SilenceFramesSent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::InboundFrames => "inbound_frames",
            Counter::InboundBytes => "inbound_bytes",
            Counter::OutboundFrames => "outbound_frames",
            Counter::OutboundBytes => "outbound_bytes",
            Counter::CodecBytesDecoded => "codec_bytes_decoded",
            Counter::EngineFramesSent => "engine_frames_sent",
            Counter::EngineAudioFramesReceived => "engine_audio_frames_received",
            Counter::EngineTextFrames => "engine_text_frames",
            Counter::KeepalivesSent => "keepalives_sent",
            Counter::KeepalivesReceived => "keepalives_received",
            Counter::TranscodeErrors => "transcode_errors",
            Counter::PreStreamDropped => "pre_stream_dropped",
            Counter::SilenceFramesSent => "silence_frames_sent",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Pipeline stages in flow order, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    // telephony -> engine
    ProviderIn,
    Resampled,
    Encoded,
    EngineOut,
    // engine -> telephony
    EngineIn,
    Decoded,
    Framed,
    ProviderOut,
}

impl Stage {
    pub const INBOUND: [Stage; 4] = [Stage::ProviderIn, Stage::Resampled, Stage::Encoded, Stage::EngineOut];
    pub const OUTBOUND: [Stage; 4] = [Stage::EngineIn, Stage::Decoded, Stage::Framed, Stage::ProviderOut];
    const COUNT: usize = 8;

    pub fn name(self) -> &'static str {
        match self {
            Stage::ProviderIn => "provider_in",
            Stage::Resampled => "in_resample",
            Stage::Encoded => "encode",
            Stage::EngineOut => "engine_out",
            Stage::EngineIn => "engine_in",
            Stage::Decoded => "decode",
            Stage::Framed => "out_resample",
            Stage::ProviderOut => "provider_out",
        }
    }
}

pub struct SessionStats {
    started: Instant,
    counters: [AtomicU64; Counter::ALL.len()],
    // millis since `started` plus one, zero meaning never
    activity: [AtomicU64; Stage::COUNT],
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            activity: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Zero all counters. Activity timestamps are kept.
    pub fn reset_counters(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn touch(&self, stage: Stage) {
        let ms = self.started.elapsed().as_millis() as u64 + 1;
        self.activity[stage as usize].store(ms, Ordering::Relaxed);
    }

    /// Time since `stage` last moved, `None` if it never did.
    pub fn idle_for(&self, stage: Stage) -> Option<Duration> {
        match self.activity[stage as usize].load(Ordering::Relaxed) {
            0 => None,
            stamp => {
                let now = self.started.elapsed().as_millis() as u64 + 1;
                Some(Duration::from_millis(now.saturating_sub(stamp)))
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            values: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Counter::ALL.len()],
}

impl StatsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()]
    }

    /// Per-counter increase since `earlier`. A reset in between reads as zero.
    pub fn delta(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            values: std::array::from_fn(|i| self.values[i].saturating_sub(earlier.values[i])),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    /// Only non-zero counters, `name=value` separated by spaces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for counter in Counter::ALL {
            let v = self.get(counter);
            if v == 0 {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", counter.name(), v)?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Consecutive per-chunk failures of one stage.
///
/// Each failure bumps `transcode_errors`; the diagnostic is logged at most
/// once per second. Reaching `limit` in a row turns into `TranscodeFailed`.
pub struct FailureStreak {
    stage: &'static str,
    limit: u32,
    consecutive: u32,
    suppressed: u32,
    last_logged: Option<Instant>,
}

impl FailureStreak {
    pub const DEFAULT_LIMIT: u32 = 3;
    const LOG_EVERY: Duration = Duration::from_secs(1);

    pub fn new(stage: &'static str) -> Self {
        Self::with_limit(stage, Self::DEFAULT_LIMIT)
    }

    pub fn with_limit(stage: &'static str, limit: u32) -> Self {
        Self {
            stage,
            limit: limit.max(1),
            consecutive: 0,
            suppressed: 0,
            last_logged: None,
        }
    }

    pub fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    pub fn failed(&mut self, err: impl fmt::Display, stats: &SessionStats) -> Result<(), BridgeError> {
        self.consecutive += 1;
        stats.incr(Counter::TranscodeErrors);

        let now = Instant::now();
        let due = self
            .last_logged
            .is_none_or(|t| now.duration_since(t) >= Self::LOG_EVERY);
        if due {
            warn!(
                stage = self.stage,
                consecutive = self.consecutive,
                suppressed = self.suppressed,
                "chunk dropped: {}",
                err
            );
            self.last_logged = Some(now);
            self.suppressed = 0;
        } else {
            self.suppressed += 1;
        }

        if self.consecutive >= self.limit {
            return Err(BridgeError::TranscodeFailed {
                stage: self.stage,
                failures: self.consecutive,
                last_error: err.to_string(),
            });
        }
        Ok(())
    }
}
