//! Control-loop timekeeping.
//!
//! The control core has exactly one notion of time: a monotonic millisecond
//! clock advanced by the owner once per control period. Nothing in the core
//! reads a hardware timer; protection debounce, ramp interpolation and list
//! dwell countdowns are all expressed against this clock, which makes every
//! state transition deterministic and host-testable.

/// Monotonic instant on the control clock, milliseconds since boot.
pub type Instant = fugit::TimerInstantU64<1_000>;

/// Span between two control-clock instants.
pub type Duration = fugit::TimerDurationU64<1_000>;

/// Default control period. One evaluation of protection, ramps and
/// trigger/list engines happens per period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_ticks(1);

/// Convert a caller-facing duration in seconds into the control clock base.
///
/// Sub-millisecond remainders are truncated; negative inputs saturate to
/// zero.
pub fn duration_from_secs(secs: f32) -> Duration {
    Duration::from_ticks((secs * 1_000.0) as u64)
}

/// Render a control-clock duration as seconds.
pub fn duration_as_secs(duration: Duration) -> f32 {
    duration.ticks() as f32 / 1_000.0
}

/// The fixed-period clock driving the control loop.
#[derive(Debug, Copy, Clone)]
pub struct ControlClock {
    now: Instant,
    period: Duration,
}

impl ControlClock {
    /// Construct a clock that advances by `period` on every tick.
    pub fn new(period: Duration) -> Self {
        Self {
            now: Instant::from_ticks(0),
            period,
        }
    }

    /// Advance the clock by one control period and return the new instant.
    pub fn advance(&mut self) -> Instant {
        self.now += self.period;
        self.now
    }

    /// The most recent tick instant.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// The configured control period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for ControlClock {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_by_period() {
        let mut clock = ControlClock::new(Duration::from_ticks(10));
        assert_eq!(clock.now().ticks(), 0);
        assert_eq!(clock.advance().ticks(), 10);
        assert_eq!(clock.advance().ticks(), 20);
    }

    #[test]
    fn second_conversions_truncate_to_millis() {
        assert_eq!(duration_from_secs(1.5).ticks(), 1_500);
        assert_eq!(duration_from_secs(0.0004).ticks(), 0);
        assert_eq!(duration_from_secs(-2.0).ticks(), 0);
        assert_eq!(duration_as_secs(Duration::from_ticks(250)), 0.25);
    }
}
