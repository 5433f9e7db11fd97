//! Bounded-time setpoint transitions.
//!
//! A ramp linearly interpolates one setpoint from a start value to a target
//! over a fixed duration, advanced once per control tick. An optional
//! leading delay phase holds the start value before interpolation begins;
//! step-mode trigger execution uses it for the programmed output-enable
//! delay. At completion the published value is exactly the target, with no
//! interpolation residue.

use crate::scheduler::Duration;

/// Longest accepted ramp duration, in seconds.
pub const RAMP_DURATION_MAX: f32 = 10.0;

/// Countdown values are only surfaced for ramps at least this long, to
/// avoid display flicker on near-instant transitions.
pub const COUNTDOWN_DISPLAY_THRESHOLD: Duration = Duration::from_ticks(5_000);

/// What a ramp produced for the current tick.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum RampProgress {
    /// Still in the leading delay phase; nothing to publish.
    Waiting,
    /// An intermediate interpolated value to publish.
    Value(f32),
    /// The final value; the ramp is complete and must be discarded.
    Done(f32),
}

/// One active setpoint transition.
#[derive(Debug, Copy, Clone)]
pub struct Ramp {
    start: f32,
    target: f32,
    delay: Duration,
    duration: Duration,
    elapsed: Duration,
}

impl Ramp {
    pub fn new(start: f32, target: f32, delay: Duration, duration: Duration) -> Self {
        Self {
            start,
            target,
            delay,
            duration,
            elapsed: Duration::from_ticks(0),
        }
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Advance by one control period and report the value to publish.
    pub(crate) fn advance(&mut self, period: Duration) -> RampProgress {
        let total = self.delay + self.duration;
        self.elapsed = (self.elapsed + period).min(total);

        if self.elapsed < self.delay {
            return RampProgress::Waiting;
        }

        if self.elapsed >= total {
            return RampProgress::Done(self.target);
        }

        let ramped = (self.elapsed - self.delay).ticks() as f32;
        let span = self.duration.ticks() as f32;
        RampProgress::Value(self.start + (self.target - self.start) * ramped / span)
    }

    /// Total programmed time: delay phase plus interpolation.
    pub fn total(&self) -> Duration {
        self.delay + self.duration
    }

    /// Time left until completion.
    pub fn remaining(&self) -> Duration {
        self.total() - self.elapsed
    }

    /// Countdown display values in whole seconds, or `None` for ramps too
    /// short to display.
    pub fn countdown(&self) -> Option<(u64, u64)> {
        if self.total() < COUNTDOWN_DISPLAY_THRESHOLD {
            return None;
        }

        let round_secs = |d: Duration| (d.ticks() + 500) / 1_000;
        Some((round_secs(self.remaining()), round_secs(self.total())))
    }
}

/// The per-channel pair of rampable setpoints.
#[derive(Debug, Copy, Clone, Default)]
pub struct RampSet {
    pub(crate) voltage: Option<Ramp>,
    pub(crate) current: Option<Ramp>,
}

impl RampSet {
    pub fn is_idle(&self) -> bool {
        self.voltage.is_none() && self.current.is_none()
    }

    pub(crate) fn abort(&mut self) {
        self.voltage = None;
        self.current = None;
    }
}

/// Which quantity a ramp drives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum RampQuantity {
    Voltage,
    Current,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_ticks(1_000);

    #[test]
    fn interpolation_is_linear_and_exact() {
        // 0V to 10V over 5s, sampled once per second.
        let mut ramp = Ramp::new(0.0, 10.0, Duration::from_ticks(0), Duration::from_ticks(5_000));

        let mut published = [0.0f32; 4];
        for value in published.iter_mut() {
            match ramp.advance(TICK) {
                RampProgress::Value(v) => *value = v,
                other => panic!("unexpected progress {:?}", other),
            }
        }
        assert_eq!(published, [2.0, 4.0, 6.0, 8.0]);

        // Monotonic and strictly inside the endpoints.
        for pair in published.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(published.iter().all(|v| *v > 0.0 && *v < 10.0));

        // The terminal value is exactly the target.
        assert_eq!(ramp.advance(TICK), RampProgress::Done(10.0));
    }

    #[test]
    fn zero_duration_is_a_one_tick_jump() {
        let mut ramp = Ramp::new(3.0, 7.5, Duration::from_ticks(0), Duration::from_ticks(0));
        assert_eq!(ramp.advance(TICK), RampProgress::Done(7.5));
    }

    #[test]
    fn delay_phase_publishes_nothing() {
        let mut ramp = Ramp::new(
            0.0,
            4.0,
            Duration::from_ticks(2_000),
            Duration::from_ticks(2_000),
        );
        assert_eq!(ramp.advance(TICK), RampProgress::Waiting);
        // At exactly the delay boundary interpolation starts from the start value.
        assert_eq!(ramp.advance(TICK), RampProgress::Value(0.0));
        assert_eq!(ramp.advance(TICK), RampProgress::Value(2.0));
        assert_eq!(ramp.advance(TICK), RampProgress::Done(4.0));
    }

    #[test]
    fn countdown_gated_by_display_threshold() {
        let short = Ramp::new(0.0, 1.0, Duration::from_ticks(0), Duration::from_ticks(1_000));
        assert_eq!(short.countdown(), None);

        let mut long = Ramp::new(0.0, 1.0, Duration::from_ticks(0), Duration::from_ticks(8_000));
        assert_eq!(long.countdown(), Some((8, 8)));
        long.advance(Duration::from_ticks(3_000));
        assert_eq!(long.countdown(), Some((5, 8)));
    }
}
