//! Post-STOP drain: keep outbound audio flowing for a bounded time so the
//! tail of the engine's reply reaches the caller.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct DrainPolicy {
    pub enabled: bool,
    /// Hard upper bound measured from STOP.
    pub budget: Duration,
    /// Drain ends early once the outbound path stayed empty and quiet this long.
    pub idle_window: Duration,
    /// Emit 20 ms silence frames while the outbound queue is idle.
    pub silence_keepalive: bool,
    pub silence_idle_threshold: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            budget: Duration::from_secs(8),
            idle_window: Duration::from_millis(500),
            silence_keepalive: false,
            silence_idle_threshold: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    Budget,
    Idle,
}

impl DrainExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainExit::Budget => "budget",
            DrainExit::Idle => "idle",
        }
    }
}

/// How busy the engine-to-provider path is at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundActivity {
    /// Items waiting in the outbound queues.
    pub queued: usize,
    /// Time since any outbound stage last moved audio; `None` if none ever did.
    pub idle_for: Option<Duration>,
}

impl OutboundActivity {
    /// Most recent activity across several stages.
    pub fn from_stages(queued: usize, idle: impl IntoIterator<Item = Option<Duration>>) -> Self {
        Self {
            queued,
            idle_for: idle.into_iter().flatten().min(),
        }
    }
}

#[derive(Debug)]
pub struct DrainTracker {
    budget: Duration,
    idle_window: Duration,
    started: Instant,
}

impl DrainTracker {
    pub fn start(policy: &DrainPolicy, now: Instant) -> Self {
        Self {
            budget: policy.budget,
            idle_window: policy.idle_window,
            started: now,
        }
    }

    /// Returns why drain is over, if it is. Drain ends early only when the
    /// outbound queues are empty and nothing moved for the idle window, and
    /// quiet time before STOP does not count.
    pub fn poll(&self, now: Instant, activity: OutboundActivity) -> Option<DrainExit> {
        let elapsed = self.elapsed(now);
        if elapsed >= self.budget {
            return Some(DrainExit::Budget);
        }
        if activity.queued > 0 {
            return None;
        }
        let quiet = activity.idle_for.map_or(elapsed, |idle| idle.min(elapsed));
        (quiet >= self.idle_window).then_some(DrainExit::Idle)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }
}
