//! Periodic pipeline health line.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::stats::{SessionStats, Stage};
use crate::queue::QueueGauge;

/// A stage counts as stalled after this long without activity while the
/// stage feeding it is still moving.
pub const STALL_AFTER: Duration = Duration::from_secs(3);

/// First stage in `chain` that is idle while its upstream is active.
pub fn stalled_stage(
    chain: &[Stage],
    idle_for: impl Fn(Stage) -> Option<Duration>,
    threshold: Duration,
) -> Option<Stage> {
    chain.windows(2).find_map(|pair| {
        let upstream_active = idle_for(pair[0]).is_some_and(|d| d < threshold);
        let downstream_idle = idle_for(pair[1]).is_none_or(|d| d >= threshold);
        (upstream_active && downstream_idle).then_some(pair[1])
    })
}

fn queue_depths(gauges: &[QueueGauge]) -> String {
    let mut out = String::new();
    for g in gauges {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{}={}/{}", g.name(), g.depth(), g.capacity());
    }
    out
}

fn recent_activity(stats: &SessionStats) -> String {
    let mut out = String::new();
    for stage in Stage::INBOUND.iter().chain(Stage::OUTBOUND.iter()) {
        if let Some(idle) = stats.idle_for(*stage) {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}={}ms", stage.name(), idle.as_millis());
        }
    }
    out
}

pub async fn run_heartbeat(
    stats: Arc<SessionStats>,
    gauges: Vec<QueueGauge>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut previous = stats.snapshot();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = stats.snapshot();
        let delta = current.delta(&previous);
        previous = current;

        let idle = |stage| stats.idle_for(stage);
        let stalled = stalled_stage(&Stage::INBOUND, idle, STALL_AFTER)
            .or_else(|| stalled_stage(&Stage::OUTBOUND, idle, STALL_AFTER));

        info!(
            elapsed_ms = stats.elapsed().as_millis() as u64,
            delta = %delta,
            queues = %queue_depths(&gauges),
            idle = %recent_activity(&stats),
            "heartbeat"
        );
        if let Some(stage) = stalled {
            warn!("STALLED_AT={}", stage.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn idle_map(pairs: &[(Stage, u64)]) -> HashMap<Stage, Duration> {
        pairs
            .iter()
            .map(|(s, ms)| (*s, Duration::from_millis(*ms)))
            .collect()
    }

    #[test]
    fn detects_first_stalled_stage() {
        let idle = idle_map(&[
            (Stage::ProviderIn, 100),
            (Stage::Resampled, 120),
            (Stage::Encoded, 5000),
            (Stage::EngineOut, 5000),
        ]);
        let stage = stalled_stage(&Stage::INBOUND, |s| idle.get(&s).copied(), STALL_AFTER);
        assert_eq!(stage, Some(Stage::Encoded));
    }

    #[test]
    fn never_active_downstream_counts_as_stalled() {
        let idle = idle_map(&[(Stage::EngineIn, 10)]);
        let stage = stalled_stage(&Stage::OUTBOUND, |s| idle.get(&s).copied(), STALL_AFTER);
        assert_eq!(stage, Some(Stage::Decoded));
    }

    #[test]
    fn quiet_pipeline_is_not_stalled() {
        let idle = idle_map(&[(Stage::ProviderIn, 8000), (Stage::Resampled, 8000)]);
        assert_eq!(
            stalled_stage(&Stage::INBOUND, |s| idle.get(&s).copied(), STALL_AFTER),
            None
        );
        assert_eq!(stalled_stage(&Stage::INBOUND, |_| None, STALL_AFTER), None);
    }

    #[test]
    fn depth_line_lists_every_queue() {
        let (_tx, rx) = crate::queue::bounded::<u8>("inbound_pcm", 4);
        let (_tx2, rx2) = crate::queue::bounded::<u8>("provider_out", 8);
        assert_eq!(
            queue_depths(&[rx.gauge(), rx2.gauge()]),
            "inbound_pcm=0/4 provider_out=0/8"
        );
    }
}
