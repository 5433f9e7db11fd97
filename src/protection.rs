//! Over-condition protection state machines.
//!
//! Every channel carries four independent protection units: over-voltage,
//! over-current, over-power and over-temperature. Each unit debounces its
//! monitored quantity against a configured level: the quantity must stay on
//! the wrong side of the level continuously for the configured delay before
//! the unit latches. Recovering below the level before the delay has elapsed
//! resets the debounce entirely; there is no partial credit.
//!
//! A latched trip persists until an explicit clear, regardless of whether
//! the condition has passed, so the operator must acknowledge every fault.
//!
//! Over-voltage additionally has a hardware comparator path that latches
//! immediately and ignores the configured delay. The asymmetry between the
//! two paths is deliberate and matches the instrument hardware; both feed
//! the single externally observable tripped flag.

use enum_iterator::Sequence;

use crate::scheduler::{Duration, Instant};

/// The four protected quantities.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Sequence, serde::Serialize, serde::Deserialize)]
pub enum ProtectionKind {
    OverVoltage,
    OverCurrent,
    OverPower,
    OverTemperature,
}

/// Externally observable state of one protection unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum ProtectionState {
    Disabled,
    Normal,
    Tripped,
}

/// One protection unit: configuration plus latched runtime state.
#[derive(Debug, Copy, Clone)]
pub struct ProtectionUnit {
    kind: ProtectionKind,
    enabled: bool,
    level: f32,
    delay: Duration,
    tripped: bool,
    hw_trip_latched: bool,
    alarm_since: Option<Instant>,
}

impl ProtectionUnit {
    pub fn new(kind: ProtectionKind, enabled: bool, level: f32, delay: Duration) -> Self {
        Self {
            kind,
            enabled,
            level,
            delay,
            tripped: false,
            hw_trip_latched: false,
            alarm_since: None,
        }
    }

    pub fn kind(&self) -> ProtectionKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether either trip path has latched.
    pub fn is_tripped(&self) -> bool {
        self.tripped || self.hw_trip_latched
    }

    /// Whether the hardware comparator path latched. Over-voltage only.
    pub fn is_hardware_trip_latched(&self) -> bool {
        self.hw_trip_latched
    }

    pub fn state(&self) -> ProtectionState {
        if self.is_tripped() {
            ProtectionState::Tripped
        } else if self.enabled {
            ProtectionState::Normal
        } else {
            ProtectionState::Disabled
        }
    }

    /// Bounds are validated by the owning channel, which knows the module's
    /// hardware limits.
    pub(crate) fn set_level(&mut self, level: f32) {
        self.level = level;
    }

    pub(crate) fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.alarm_since = None;
        }
    }

    /// Latch the hardware comparator path. Bypasses the debounce delay.
    pub(crate) fn latch_hardware_trip(&mut self) {
        self.hw_trip_latched = true;
        self.alarm_since = None;
    }

    /// Latch the software trip directly, bypassing the debounce. Used when
    /// a trip propagates across a coupled pair or tracking group.
    pub(crate) fn latch_trip(&mut self) {
        self.trip();
    }

    /// Clear both trip paths and the debounce bookkeeping.
    pub(crate) fn clear(&mut self) {
        self.tripped = false;
        self.hw_trip_latched = false;
        self.alarm_since = None;
    }

    /// Evaluate the unit against the latest sample.
    ///
    /// `armed` gates the check on the channel actually driving its output
    /// (always true for the temperature unit, which monitors the module
    /// rather than the output stage). Returns true exactly once, on the
    /// tick the software path latches.
    pub(crate) fn evaluate(&mut self, monitored: f32, armed: bool, now: Instant) -> bool {
        if self.is_tripped() {
            self.alarm_since = None;
            return false;
        }

        if !(self.enabled && armed && monitored >= self.level) {
            self.alarm_since = None;
            return false;
        }

        let delay = self.delay;
        if delay.ticks() == 0 {
            self.trip();
            return true;
        }

        match self.alarm_since {
            None => {
                self.alarm_since = Some(now);
                false
            }
            Some(since) => {
                if now.checked_duration_since(since).map_or(false, |d| d >= delay) {
                    self.trip();
                    true
                } else {
                    false
                }
            }
        }
    }

    fn trip(&mut self) {
        self.tripped = true;
        self.alarm_since = None;
    }
}
