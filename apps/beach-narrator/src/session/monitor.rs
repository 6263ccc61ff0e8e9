use std::time::Duration;

use snapshot_wire::ProtocolError;
use tokio::time::Instant;
use tracing::{info, warn};

pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
pub const ESCALATION_AFTER: Duration = Duration::from_secs(5);
pub const ESCALATION_FRAMES: u64 = 3;

#[derive(Debug)]
struct Streak {
    started: Instant,
    failures: u64,
    unreported: u64,
    last_report: Instant,
    escalated: bool,
}

/// Rate-limits decode failure logging and detects a sustained protocol
/// mismatch. A streak is a run of failures with no successful decode.
#[derive(Debug, Default)]
pub struct DecodeFailureMonitor {
    streak: Option<Streak>,
}

impl DecodeFailureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u64 {
        self.streak.as_ref().map_or(0, |streak| streak.failures)
    }

    /// Returns the streak length once, when the streak first qualifies as an
    /// incompatible server.
    pub fn record_failure(&mut self, error: &ProtocolError, now: Instant) -> Option<u64> {
        let Some(streak) = self.streak.as_mut() else {
            warn!(target: "narrator::session", error = %error, "dropping undecodable snapshot frame");
            self.streak = Some(Streak {
                started: now,
                failures: 1,
                unreported: 0,
                last_report: now,
                escalated: false,
            });
            return None;
        };
        streak.failures += 1;
        streak.unreported += 1;
        if now.saturating_duration_since(streak.last_report) >= SUMMARY_INTERVAL {
            warn!(
                target: "narrator::session",
                failures = streak.failures,
                since_last = streak.unreported,
                last_error = %error,
                "snapshot frames still failing to decode"
            );
            streak.unreported = 0;
            streak.last_report = now;
        }

        let sustained = now.saturating_duration_since(streak.started) >= ESCALATION_AFTER
            && streak.failures >= ESCALATION_FRAMES;
        if sustained && !streak.escalated {
            streak.escalated = true;
            warn!(
                target: "narrator::session",
                failures = streak.failures,
                "server frames are consistently undecodable; incompatible server version?"
            );
            return Some(streak.failures);
        }
        None
    }

    pub fn record_success(&mut self) {
        if let Some(streak) = self.streak.take() {
            info!(target: "narrator::session", failures = streak.failures, "snapshot decoding recovered");
        }
    }
}
