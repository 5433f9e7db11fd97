//! Per-channel model: identity, module parameters, setpoints and flags.
//!
//! A [`Channel`] is created at boot for every detected module and never
//! destroyed while powered. All setter paths validate against the module's
//! hardware range, the user-configured limits and the power-limit product
//! before mutating anything; a rejected command leaves the channel
//! untouched.

use crate::error::{Error, Result};
use crate::linear_transformation::LinearTransformation;
use crate::protection::{ProtectionKind, ProtectionUnit};
use crate::scheduler::{duration_from_secs, Duration};
use crate::ChannelId;

/// Headroom above the hardware voltage maximum accepted for the OVP level.
pub const OVP_LEVEL_MARGIN: f32 = 0.5;

/// Current above which the high range is selected in `Best` mode.
pub const CURRENT_RANGE_SWITCH_THRESHOLD: f32 = 0.05;

/// Channel regulation mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Mode {
    #[default]
    ConstantVoltage,
    ConstantCurrent,
}

/// Measurement range of a dual-range current sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub enum CurrentRange {
    #[default]
    High,
    Low,
}

/// How a dual-range module picks its current range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum CurrentRangeSelectionMode {
    #[default]
    Best,
    AlwaysHigh,
    AlwaysLow,
}

/// Capabilities reported by the installed module.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Features {
    pub coupling: bool,
    pub hw_ovp: bool,
    pub rprog: bool,
    pub dprog: bool,
    pub dual_current_range: bool,
}

/// Per-kind protection delay limits, from the module datasheet.
#[derive(Debug, Copy, Clone)]
pub struct ProtectionDelays {
    pub min: Duration,
    pub max: Duration,
    pub default: Duration,
    pub default_enabled: bool,
}

/// Hardware-derived channel parameters, fixed at module detection.
#[derive(Debug, Copy, Clone)]
pub struct ChannelParams {
    pub u_min: f32,
    pub u_max: f32,
    pub u_def: f32,
    pub i_min: f32,
    pub i_max: f32,
    pub i_def: f32,
    pub p_tot: f32,
    pub opp_min_level: f32,
    pub opp_default_level: f32,
    pub otp_max_level: f32,
    pub otp_default_level: f32,
    pub ovp: ProtectionDelays,
    pub ocp: ProtectionDelays,
    pub opp: ProtectionDelays,
    pub otp: ProtectionDelays,
    pub features: Features,
    pub rprog_transform: LinearTransformation,
}

impl ChannelParams {
    /// Full-featured 40V/5A CV/CC module: coupling, hardware OVP, remote
    /// programming and a dual current range.
    pub fn cv_cc_40v_5a() -> Self {
        Self {
            u_min: 0.0,
            u_max: 40.0,
            u_def: 0.0,
            i_min: 0.0,
            i_max: 5.0,
            i_def: 0.0,
            p_tot: 200.0,
            opp_min_level: 0.0,
            opp_default_level: 200.0,
            otp_max_level: 100.0,
            otp_default_level: 70.0,
            ovp: ProtectionDelays {
                min: Duration::from_ticks(0),
                max: Duration::from_ticks(10_000),
                default: Duration::from_ticks(5),
                default_enabled: false,
            },
            ocp: ProtectionDelays {
                min: Duration::from_ticks(0),
                max: Duration::from_ticks(10_000),
                default: Duration::from_ticks(20),
                default_enabled: false,
            },
            opp: ProtectionDelays {
                min: Duration::from_ticks(1_000),
                max: Duration::from_ticks(300_000),
                default: Duration::from_ticks(10_000),
                default_enabled: true,
            },
            otp: ProtectionDelays {
                min: Duration::from_ticks(0),
                max: Duration::from_ticks(300_000),
                default: Duration::from_ticks(10_000),
                default_enabled: true,
            },
            features: Features {
                coupling: true,
                hw_ovp: true,
                rprog: true,
                dprog: true,
                dual_current_range: true,
            },
            // 0-2.5V programming input spanning the full output range.
            rprog_transform: LinearTransformation::new(40.0 / 2.5, 0.0),
        }
    }

    /// Basic 20V/4A CV/CC module without coupling or dual range support.
    pub fn cv_cc_20v_4a() -> Self {
        let base = Self::cv_cc_40v_5a();
        Self {
            u_max: 20.0,
            i_max: 4.0,
            p_tot: 80.0,
            opp_default_level: 80.0,
            features: Features {
                coupling: false,
                hw_ovp: false,
                rprog: false,
                dprog: false,
                dual_current_range: false,
            },
            rprog_transform: LinearTransformation::new(20.0 / 2.5, 0.0),
            ..base
        }
    }
}

/// A setpoint group: programmed value, latest calibrated measurement and
/// the user-configured limit.
#[derive(Debug, Copy, Clone, Default)]
pub struct Value {
    pub(crate) set: f32,
    pub(crate) mon: f32,
    pub(crate) limit: f32,
}

/// An optional staged value for a settable field: an edit captured before
/// the operator commits it. Staging never affects control behavior; only a
/// commit routes the value through the normal validated setter.
#[derive(Debug, Copy, Clone, Default)]
pub struct Staged<T> {
    pending: Option<T>,
}

impl<T: Copy> Staged<T> {
    pub fn stage(&mut self, value: T) {
        self.pending = Some(value);
    }

    pub fn pending(&self) -> Option<T> {
        self.pending
    }

    pub fn take(&mut self) -> Option<T> {
        self.pending.take()
    }

    pub fn discard(&mut self) {
        self.pending = None;
    }
}

/// Latest hardware sample for one channel, in SI base units. Produced by
/// the ADC/DMA layer outside this crate and treated as instantaneously
/// available at tick start.
#[derive(Debug, Copy, Clone, Default, serde::Serialize)]
pub struct AdcSample {
    pub u_mon: f32,
    pub i_mon: f32,
    /// Module heatsink temperature in celsius.
    pub temperature: f32,
    /// True while the output is current-regulated.
    pub constant_current: bool,
    /// Remote-programming analog input voltage.
    pub rprog_input: f32,
}

/// Channel binary flags.
#[derive(Debug, Copy, Clone)]
pub struct Flags {
    pub output_enabled: bool,
    pub ok: bool,
    pub rprog_enabled: bool,
    pub dprog_enabled: bool,
    pub tracking_enabled: bool,
    pub current_range_mode: CurrentRangeSelectionMode,
    pub current_range: CurrentRange,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            output_enabled: false,
            ok: true,
            rprog_enabled: false,
            dprog_enabled: false,
            tracking_enabled: false,
            current_range_mode: CurrentRangeSelectionMode::default(),
            current_range: CurrentRange::default(),
        }
    }
}

/// The bank's channel slots; `None` marks an empty slot.
pub(crate) type ChannelArray = [Option<Channel>; crate::CHANNEL_COUNT];

/// One power channel.
#[derive(Debug, Clone)]
pub struct Channel {
    index: ChannelId,
    slot: u8,
    subchannel: u8,
    params: ChannelParams,
    pub(crate) flags: Flags,
    pub(crate) u: Value,
    pub(crate) i: Value,
    power_limit: f32,
    temperature: f32,
    mode: Mode,
    staged_voltage: Staged<f32>,
    staged_current: Staged<f32>,
    pub(crate) ovp: ProtectionUnit,
    pub(crate) ocp: ProtectionUnit,
    pub(crate) opp: ProtectionUnit,
    pub(crate) otp: ProtectionUnit,
}

impl Channel {
    pub fn new(index: ChannelId, slot: u8, subchannel: u8, params: ChannelParams) -> Self {
        Self {
            index,
            slot,
            subchannel,
            params,
            flags: Flags::default(),
            u: Value {
                set: params.u_def,
                mon: 0.0,
                limit: params.u_max,
            },
            i: Value {
                set: params.i_def,
                mon: 0.0,
                limit: params.i_max,
            },
            power_limit: params.p_tot,
            temperature: 0.0,
            mode: Mode::default(),
            staged_voltage: Staged::default(),
            staged_current: Staged::default(),
            ovp: ProtectionUnit::new(
                ProtectionKind::OverVoltage,
                params.ovp.default_enabled,
                params.u_max,
                params.ovp.default,
            ),
            ocp: ProtectionUnit::new(
                ProtectionKind::OverCurrent,
                params.ocp.default_enabled,
                params.i_max,
                params.ocp.default,
            ),
            opp: ProtectionUnit::new(
                ProtectionKind::OverPower,
                params.opp.default_enabled,
                params.opp_default_level,
                params.opp.default,
            ),
            otp: ProtectionUnit::new(
                ProtectionKind::OverTemperature,
                params.otp.default_enabled,
                params.otp_default_level,
                params.otp.default,
            ),
        }
    }

    pub fn index(&self) -> ChannelId {
        self.index
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn subchannel(&self) -> u8 {
        self.subchannel
    }

    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn u_set(&self) -> f32 {
        self.u.set
    }

    pub fn u_mon(&self) -> f32 {
        self.u.mon
    }

    pub fn u_limit(&self) -> f32 {
        self.u.limit
    }

    pub fn i_set(&self) -> f32 {
        self.i.set
    }

    pub fn i_mon(&self) -> f32 {
        self.i.mon
    }

    pub fn i_limit(&self) -> f32 {
        self.i.limit
    }

    pub fn p_mon(&self) -> f32 {
        self.u.mon * self.i.mon
    }

    pub fn power_limit(&self) -> f32 {
        self.power_limit
    }

    pub fn is_output_enabled(&self) -> bool {
        self.flags.output_enabled
    }

    pub fn is_ok(&self) -> bool {
        self.flags.ok
    }

    pub fn current_range(&self) -> CurrentRange {
        self.flags.current_range
    }

    pub fn protection(&self, kind: ProtectionKind) -> &ProtectionUnit {
        match kind {
            ProtectionKind::OverVoltage => &self.ovp,
            ProtectionKind::OverCurrent => &self.ocp,
            ProtectionKind::OverPower => &self.opp,
            ProtectionKind::OverTemperature => &self.otp,
        }
    }

    pub(crate) fn protection_mut(&mut self, kind: ProtectionKind) -> &mut ProtectionUnit {
        match kind {
            ProtectionKind::OverVoltage => &mut self.ovp,
            ProtectionKind::OverCurrent => &mut self.ocp,
            ProtectionKind::OverPower => &mut self.opp,
            ProtectionKind::OverTemperature => &mut self.otp,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.ovp.is_tripped()
            || self.ocp.is_tripped()
            || self.opp.is_tripped()
            || self.otp.is_tripped()
    }

    /// Stage a voltage edit without applying it.
    pub fn stage_voltage(&mut self, value: f32) {
        self.staged_voltage.stage(value);
    }

    pub fn staged_voltage(&self) -> Option<f32> {
        self.staged_voltage.pending()
    }

    pub fn stage_current(&mut self, value: f32) {
        self.staged_current.stage(value);
    }

    pub fn staged_current(&self) -> Option<f32> {
        self.staged_current.pending()
    }

    /// Validate a voltage setpoint without applying it.
    pub(crate) fn check_voltage(&self, value: f32) -> Result<()> {
        if !(self.params.u_min..=self.params.u_max).contains(&value) {
            return Err(Error::DataOutOfRange);
        }

        if value > self.u.limit {
            return Err(Error::VoltageLimitExceeded);
        }

        if value * self.i.set > self.power_limit {
            return Err(Error::PowerLimitExceeded);
        }

        Ok(())
    }

    pub(crate) fn apply_voltage(&mut self, value: f32) {
        self.u.set = value;
        self.staged_voltage.discard();
    }

    pub(crate) fn check_current(&self, value: f32) -> Result<()> {
        if !(self.params.i_min..=self.params.i_max).contains(&value) {
            return Err(Error::DataOutOfRange);
        }

        if value > self.i.limit {
            return Err(Error::CurrentLimitExceeded);
        }

        if self.u.set * value > self.power_limit {
            return Err(Error::PowerLimitExceeded);
        }

        Ok(())
    }

    /// Validate a (voltage, current) pair as it would stand after both
    /// values are applied together.
    pub(crate) fn check_pair(&self, voltage: f32, current: f32) -> Result<()> {
        if !(self.params.u_min..=self.params.u_max).contains(&voltage)
            || !(self.params.i_min..=self.params.i_max).contains(&current)
        {
            return Err(Error::DataOutOfRange);
        }

        if voltage > self.u.limit {
            return Err(Error::VoltageLimitExceeded);
        }

        if current > self.i.limit {
            return Err(Error::CurrentLimitExceeded);
        }

        if voltage * current > self.power_limit {
            return Err(Error::PowerLimitExceeded);
        }

        Ok(())
    }

    pub(crate) fn apply_current(&mut self, value: f32) {
        if self.params.features.dual_current_range {
            self.flags.current_range = match self.flags.current_range_mode {
                CurrentRangeSelectionMode::Best => {
                    if value > CURRENT_RANGE_SWITCH_THRESHOLD {
                        CurrentRange::High
                    } else {
                        CurrentRange::Low
                    }
                }
                CurrentRangeSelectionMode::AlwaysHigh => CurrentRange::High,
                CurrentRangeSelectionMode::AlwaysLow => CurrentRange::Low,
            };
        }

        self.i.set = value;
        self.staged_current.discard();
    }

    pub(crate) fn set_voltage_limit(&mut self, limit: f32) -> Result<()> {
        if !(self.params.u_min..=self.params.u_max).contains(&limit) {
            return Err(Error::DataOutOfRange);
        }

        // Lowering the limit below the live setpoint would invalidate the
        // running output; the setpoint has to be moved first.
        if limit < self.u.set {
            return Err(Error::DataOutOfRange);
        }

        self.u.limit = limit;
        Ok(())
    }

    pub(crate) fn set_current_limit(&mut self, limit: f32) -> Result<()> {
        if !(self.params.i_min..=self.params.i_max).contains(&limit) {
            return Err(Error::DataOutOfRange);
        }

        if limit < self.i.set {
            return Err(Error::DataOutOfRange);
        }

        self.i.limit = limit;
        Ok(())
    }

    pub(crate) fn set_power_limit(&mut self, limit: f32) -> Result<()> {
        if !(0.0..=self.params.p_tot).contains(&limit) {
            return Err(Error::DataOutOfRange);
        }

        if limit < self.u.set * self.i.set {
            return Err(Error::DataOutOfRange);
        }

        self.power_limit = limit;
        Ok(())
    }

    pub(crate) fn set_current_range_mode(&mut self, mode: CurrentRangeSelectionMode) -> Result<()> {
        if !self.params.features.dual_current_range {
            return Err(Error::NotSupported);
        }

        self.flags.current_range_mode = mode;
        Ok(())
    }

    /// The accepted bounds for a protection level of `kind`.
    fn protection_level_bounds(&self, kind: ProtectionKind) -> (f32, f32) {
        match kind {
            ProtectionKind::OverVoltage => {
                (self.params.u_min, self.params.u_max + OVP_LEVEL_MARGIN)
            }
            ProtectionKind::OverCurrent => (self.params.i_min, self.params.i_max),
            ProtectionKind::OverPower => (self.params.opp_min_level, self.params.p_tot),
            ProtectionKind::OverTemperature => (0.0, self.params.otp_max_level),
        }
    }

    fn protection_delays(&self, kind: ProtectionKind) -> &ProtectionDelays {
        match kind {
            ProtectionKind::OverVoltage => &self.params.ovp,
            ProtectionKind::OverCurrent => &self.params.ocp,
            ProtectionKind::OverPower => &self.params.opp,
            ProtectionKind::OverTemperature => &self.params.otp,
        }
    }

    pub(crate) fn check_protection_level(&self, kind: ProtectionKind, level: f32) -> Result<()> {
        let (min, max) = self.protection_level_bounds(kind);
        if !(min..=max).contains(&level) {
            return Err(Error::DataOutOfRange);
        }
        Ok(())
    }

    pub(crate) fn check_protection_delay(&self, kind: ProtectionKind, delay_secs: f32) -> Result<()> {
        if delay_secs < 0.0 {
            return Err(Error::DataOutOfRange);
        }

        let delays = self.protection_delays(kind);
        let delay = duration_from_secs(delay_secs);
        if delay < delays.min || delay > delays.max {
            return Err(Error::DataOutOfRange);
        }
        Ok(())
    }

    pub(crate) fn set_output(&mut self, enabled: bool) {
        self.flags.output_enabled = enabled;
    }

    /// Ingest the latest hardware sample.
    ///
    /// With remote programming active, the analog input drives the voltage
    /// setpoint directly, clamped to the hardware range.
    pub(crate) fn feed_sample(&mut self, sample: &AdcSample) {
        self.u.mon = sample.u_mon;
        self.i.mon = sample.i_mon;
        self.temperature = sample.temperature;
        self.mode = if sample.constant_current {
            Mode::ConstantCurrent
        } else {
            Mode::ConstantVoltage
        };

        if self.flags.rprog_enabled && self.params.features.rprog {
            let programmed = self.params.rprog_transform.map(sample.rprog_input);
            self.u.set = programmed.clamp(self.params.u_min, self.params.u_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(ChannelId::Zero, 0, 0, ChannelParams::cv_cc_40v_5a())
    }

    #[test]
    fn voltage_validation_order() {
        let mut ch = channel();
        ch.set_voltage_limit(30.0).unwrap();

        assert_eq!(ch.check_voltage(41.0), Err(Error::DataOutOfRange));
        assert_eq!(ch.check_voltage(-1.0), Err(Error::DataOutOfRange));
        assert_eq!(ch.check_voltage(35.0), Err(Error::VoltageLimitExceeded));
        assert_eq!(ch.check_voltage(30.0), Ok(()));

        // A failed check leaves the setpoint untouched.
        assert_eq!(ch.u_set(), 0.0);
    }

    #[test]
    fn power_limit_caps_the_product() {
        let mut ch = channel();
        ch.apply_current(5.0);
        ch.set_power_limit(100.0).unwrap();

        assert_eq!(ch.check_voltage(20.0), Ok(()));
        assert_eq!(ch.check_voltage(21.0), Err(Error::PowerLimitExceeded));
    }

    #[test]
    fn limits_cannot_undercut_the_setpoint() {
        let mut ch = channel();
        ch.apply_voltage(12.0);
        assert_eq!(ch.set_voltage_limit(10.0), Err(Error::DataOutOfRange));
        assert_eq!(ch.u_limit(), 40.0);

        ch.apply_current(2.0);
        assert_eq!(ch.set_current_limit(1.0), Err(Error::DataOutOfRange));
        assert_eq!(ch.set_power_limit(20.0), Err(Error::DataOutOfRange));
    }

    #[test]
    fn applying_a_value_discards_the_staged_edit() {
        let mut ch = channel();
        ch.stage_voltage(9.0);
        assert_eq!(ch.staged_voltage(), Some(9.0));

        ch.apply_voltage(5.0);
        assert_eq!(ch.staged_voltage(), None);
        assert_eq!(ch.u_set(), 5.0);
    }

    #[test]
    fn best_range_selection_tracks_the_setpoint() {
        let mut ch = channel();
        ch.apply_current(0.02);
        assert_eq!(ch.current_range(), CurrentRange::Low);
        ch.apply_current(2.0);
        assert_eq!(ch.current_range(), CurrentRange::High);

        ch.set_current_range_mode(CurrentRangeSelectionMode::AlwaysLow)
            .unwrap();
        ch.apply_current(3.0);
        assert_eq!(ch.current_range(), CurrentRange::Low);
    }

    #[test]
    fn range_mode_requires_the_dual_range_feature() {
        let mut ch = Channel::new(ChannelId::One, 1, 0, ChannelParams::cv_cc_20v_4a());
        assert_eq!(
            ch.set_current_range_mode(CurrentRangeSelectionMode::AlwaysHigh),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn protection_level_bounds_follow_the_module() {
        let ch = channel();
        assert!(ch
            .check_protection_level(ProtectionKind::OverVoltage, 40.4)
            .is_ok());
        assert_eq!(
            ch.check_protection_level(ProtectionKind::OverVoltage, 41.0),
            Err(Error::DataOutOfRange)
        );
        assert_eq!(
            ch.check_protection_delay(ProtectionKind::OverPower, 0.5),
            Err(Error::DataOutOfRange)
        );
        assert!(ch.check_protection_delay(ProtectionKind::OverPower, 20.0).is_ok());
    }

    #[test]
    fn remote_programming_drives_the_setpoint_from_the_sample() {
        let mut ch = channel();
        ch.flags.rprog_enabled = true;
        ch.feed_sample(&AdcSample {
            rprog_input: 1.25,
            ..Default::default()
        });
        assert_eq!(ch.u_set(), 20.0);

        // Clamped at the hardware maximum.
        ch.feed_sample(&AdcSample {
            rprog_input: 3.0,
            ..Default::default()
        });
        assert_eq!(ch.u_set(), 40.0);
    }

    #[test]
    fn sample_updates_monitors_and_mode() {
        let mut ch = channel();
        ch.feed_sample(&AdcSample {
            u_mon: 12.0,
            i_mon: 2.0,
            temperature: 35.0,
            constant_current: true,
            rprog_input: 0.0,
        });
        assert_eq!(ch.u_mon(), 12.0);
        assert_eq!(ch.i_mon(), 2.0);
        assert_eq!(ch.p_mon(), 24.0);
        assert_eq!(ch.mode(), Mode::ConstantCurrent);
        assert_eq!(ch.temperature(), 35.0);
    }
}
