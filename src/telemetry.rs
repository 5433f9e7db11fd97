//! Telemetry rendering for external transports.
//!
//! The core does not own a network stack; it renders status aggregates into
//! bounded JSON buffers and leaves publishing to whatever transport the
//! firmware attaches (MQTT, serial, log capture). The reporter tracks the
//! configured period against the control clock.

use core::fmt::Write;

use heapless::String;

use crate::channels::{ChannelStatus, SystemStatus};
use crate::scheduler::{Duration, Instant};
use crate::ChannelId;

/// Size of a rendered telemetry payload buffer.
pub const TELEMETRY_BUFFER_SIZE: usize = 1024;

pub const DEFAULT_TELEMETRY_PERIOD_SECS: u64 = 5;

/// Periodic status reporter.
pub struct TelemetryReporter {
    period: Duration,
    last_report: Option<Instant>,
}

impl TelemetryReporter {
    pub fn new(period_secs: u64) -> Self {
        Self {
            period: Duration::secs(period_secs),
            last_report: None,
        }
    }

    pub fn set_period_secs(&mut self, period_secs: u64) {
        self.period = Duration::secs(period_secs);
    }

    /// Whether a report is due at `now`. Advances the reporting window when
    /// it returns true.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = match self.last_report {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .map_or(false, |since| since >= self.period),
        };

        if due {
            self.last_report = Some(now);
        }
        due
    }

    /// Render the full instrument status as JSON.
    pub fn render(status: &SystemStatus) -> Option<String<TELEMETRY_BUFFER_SIZE>> {
        serde_json_core::to_string(status).ok()
    }

    /// Render a single channel's status as JSON.
    pub fn render_channel(status: &ChannelStatus) -> Option<String<512>> {
        serde_json_core::to_string(status).ok()
    }

    /// The per-channel topic a transport should publish channel telemetry
    /// under.
    pub fn channel_topic(prefix: &str, ch: ChannelId) -> String<64> {
        let mut topic: String<64> = String::new();
        write!(&mut topic, "{}/ch{}", prefix, ch as u8).ok();
        topic
    }
}

impl Default for TelemetryReporter {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_PERIOD_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(ms)
    }

    #[test]
    fn reports_follow_the_configured_period() {
        let mut reporter = TelemetryReporter::new(2);

        assert!(reporter.poll(at(0)));
        assert!(!reporter.poll(at(1_000)));
        assert!(reporter.poll(at(2_000)));
        assert!(!reporter.poll(at(3_500)));
        assert!(reporter.poll(at(4_000)));
    }

    #[test]
    fn renders_status_as_json() {
        let status = SystemStatus::default();
        let payload = TelemetryReporter::render(&status).unwrap();
        assert!(payload.starts_with('{'));
        assert!(payload.contains("\"coupling\""));
    }

    #[test]
    fn channel_topics_are_indexed() {
        let topic = TelemetryReporter::channel_topic("dt/psu/telemetry", ChannelId::Two);
        assert_eq!(topic.as_str(), "dt/psu/telemetry/ch2");
    }
}
