//! Per-channel configuration tree.

use miniconf::Tree;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelParams, OVP_LEVEL_MARGIN};
use crate::scheduler::duration_from_secs;
use crate::trigger::{TriggerMode, TriggerOnListStop, TriggerSource};

/// One channel's persistable configuration. All delay fields are in
/// seconds.
#[derive(Clone, Copy, Debug, PartialEq, Tree, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub voltage: f32,
    pub current: f32,
    pub voltage_limit: f32,
    pub current_limit: f32,
    pub power_limit: f32,
    pub output_enabled: bool,

    pub ovp_enabled: bool,
    pub ovp_level: f32,
    pub ovp_delay: f32,
    pub ocp_enabled: bool,
    pub ocp_level: f32,
    pub ocp_delay: f32,
    pub opp_enabled: bool,
    pub opp_level: f32,
    pub opp_delay: f32,
    pub otp_enabled: bool,
    pub otp_level: f32,
    pub otp_delay: f32,

    pub trigger_source: TriggerSource,
    pub trigger_mode: TriggerMode,
    pub trigger_on_list_stop: TriggerOnListStop,
}

impl ChannelConfig {
    /// The power-on configuration for a module with `params`.
    pub fn from_params(params: &ChannelParams) -> Self {
        Self {
            voltage: params.u_def,
            current: params.i_def,
            voltage_limit: params.u_max,
            current_limit: params.i_max,
            power_limit: params.p_tot,
            output_enabled: false,
            ovp_enabled: params.ovp.default_enabled,
            ovp_level: params.u_max,
            ovp_delay: params.ovp.default.ticks() as f32 / 1_000.0,
            ocp_enabled: params.ocp.default_enabled,
            ocp_level: params.i_max,
            ocp_delay: params.ocp.default.ticks() as f32 / 1_000.0,
            opp_enabled: params.opp.default_enabled,
            opp_level: params.opp_default_level,
            opp_delay: params.opp.default.ticks() as f32 / 1_000.0,
            otp_enabled: params.otp.default_enabled,
            otp_level: params.otp_default_level,
            otp_delay: params.otp.default.ticks() as f32 / 1_000.0,
            trigger_source: TriggerSource::default(),
            trigger_mode: TriggerMode::default(),
            trigger_on_list_stop: TriggerOnListStop::default(),
        }
    }

    /// Check every field against the module's hardware limits.
    pub fn validate(&self, params: &ChannelParams) -> Result<(), &'static str> {
        if !(params.u_min..=params.u_max).contains(&self.voltage) {
            return Err("Voltage out of range");
        }

        if !(params.i_min..=params.i_max).contains(&self.current) {
            return Err("Current out of range");
        }

        if !(params.u_min..=params.u_max).contains(&self.voltage_limit)
            || self.voltage > self.voltage_limit
        {
            return Err("Voltage limit out of range");
        }

        if !(params.i_min..=params.i_max).contains(&self.current_limit)
            || self.current > self.current_limit
        {
            return Err("Current limit out of range");
        }

        if !(0.0..=params.p_tot).contains(&self.power_limit)
            || self.voltage * self.current > self.power_limit
        {
            return Err("Power limit out of range");
        }

        if !(params.u_min..=params.u_max + OVP_LEVEL_MARGIN).contains(&self.ovp_level) {
            return Err("OVP level out of range");
        }

        if !(params.i_min..=params.i_max).contains(&self.ocp_level) {
            return Err("OCP level out of range");
        }

        if !(params.opp_min_level..=params.p_tot).contains(&self.opp_level) {
            return Err("OPP level out of range");
        }

        if !(0.0..=params.otp_max_level).contains(&self.otp_level) {
            return Err("OTP level out of range");
        }

        let delays = [
            (self.ovp_delay, &params.ovp),
            (self.ocp_delay, &params.ocp),
            (self.opp_delay, &params.opp),
            (self.otp_delay, &params.otp),
        ];
        for (delay_secs, bounds) in delays {
            if delay_secs < 0.0 {
                return Err("Protection delay out of range");
            }
            let delay = duration_from_secs(delay_secs);
            if delay < bounds.min || delay > bounds.max {
                return Err("Protection delay out of range");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_defaults_validate() {
        let params = ChannelParams::cv_cc_40v_5a();
        let config = ChannelConfig::from_params(&params);
        assert!(config.validate(&params).is_ok());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let params = ChannelParams::cv_cc_40v_5a();
        let base = ChannelConfig::from_params(&params);

        let overvolted = ChannelConfig {
            voltage: 50.0,
            ..base
        };
        assert!(overvolted.validate(&params).is_err());

        let inverted_limit = ChannelConfig {
            voltage: 10.0,
            voltage_limit: 5.0,
            ..base
        };
        assert!(inverted_limit.validate(&params).is_err());

        let bad_delay = ChannelConfig {
            opp_delay: 0.1,
            ..base
        };
        assert!(bad_delay.validate(&params).is_err());
    }
}
