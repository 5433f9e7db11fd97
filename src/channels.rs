//! The channel bank: ownership of every channel and engine, the public
//! command/query surface, and the control tick.
//!
//! All external callers (display adapter, SCPI processor, data logger) go
//! through [`PowerChannels`] with an explicit channel id on every call.
//! Setpoint commands pass through coupling routing and channel validation
//! before anything mutates; the periodic [`PowerChannels::tick`] evaluates
//! protection, advances ramps and steps trigger/list execution in that
//! fixed order, then publishes a status snapshot for cross-context readers.

use enum_iterator::all;
use log::{info, warn};

use crate::channel::{
    AdcSample, Channel, ChannelArray, ChannelParams, CurrentRangeSelectionMode, Mode,
};
use crate::coupling::{
    tracking_group, validate_coupling, CouplingManager, CouplingType, Fanout, Members,
};
use crate::error::{Error, Result};
use crate::event_log::{EventId, EventLog};
use crate::list::{ListStep, StepOutcome};
use crate::protection::{ProtectionKind, ProtectionState};
use crate::ramp::{Ramp, RampSet};
use crate::scheduler::{duration_from_secs, ControlClock, Duration, Instant};
use crate::snapshot::Snapshot;
use crate::trigger::{
    TriggerContext, TriggerEvents, TriggerMachine, TriggerMode, TriggerOnListStop, TriggerPin,
    TriggerSource, TriggerState,
};
use crate::{ChannelId, CHANNEL_COUNT};

/// Per-channel status aggregate published once per tick.
#[derive(Debug, Copy, Clone, Default, serde::Serialize)]
pub struct ChannelStatus {
    pub u_set: f32,
    pub u_mon: f32,
    pub i_set: f32,
    pub i_mon: f32,
    pub p_mon: f32,
    pub temperature: f32,
    pub mode: Mode,
    pub output_enabled: bool,
    pub ok: bool,
    pub ovp_tripped: bool,
    pub ocp_tripped: bool,
    pub opp_tripped: bool,
    pub otp_tripped: bool,
    pub tracking_enabled: bool,
    pub trigger_state: TriggerState,
    pub step_index: u16,
}

/// Composite instrument status for cross-context readers.
#[derive(Debug, Copy, Clone, Default, serde::Serialize)]
pub struct SystemStatus {
    pub channels: [Option<ChannelStatus>; CHANNEL_COUNT],
    pub coupling: CouplingType,
    pub inhibited: bool,
}

/// The channel control core.
pub struct PowerChannels {
    channels: ChannelArray,
    triggers: [Option<TriggerMachine>; CHANNEL_COUNT],
    ramps: [RampSet; CHANNEL_COUNT],
    coupling: CouplingManager,
    clock: ControlClock,
    events: EventLog,
    status: Snapshot<SystemStatus>,
    inhibited: bool,
    output_protection_coupled: bool,
    shutdown_when_protection_tripped: bool,
}

impl PowerChannels {
    /// Construct the bank from the modules found at boot.
    ///
    /// Each entry is `(slot, subchannel, params)`; entries beyond the
    /// channel capacity are ignored.
    pub fn new(modules: &[(u8, u8, ChannelParams)], period: Duration) -> Self {
        let mut channels: ChannelArray = Default::default();
        let mut triggers: [Option<TriggerMachine>; CHANNEL_COUNT] = Default::default();

        for (id, (slot, subchannel, params)) in all::<ChannelId>().zip(modules.iter()) {
            channels[id as usize] = Some(Channel::new(id, *slot, *subchannel, *params));
            triggers[id as usize] = Some(TriggerMachine::new(TriggerContext::default()));
            info!("channel {} installed in slot {}", id as usize, slot);
        }

        Self {
            channels,
            triggers,
            ramps: Default::default(),
            coupling: CouplingManager::default(),
            clock: ControlClock::new(period),
            events: EventLog::new(),
            status: Snapshot::default(),
            inhibited: false,
            output_protection_coupled: false,
            shutdown_when_protection_tripped: false,
        }
    }

    fn channel(&self, ch: ChannelId) -> Result<&Channel> {
        self.channels[ch as usize].as_ref().ok_or(Error::ChannelNotOk)
    }

    fn channel_mut(&mut self, ch: ChannelId) -> Result<&mut Channel> {
        self.channels[ch as usize].as_mut().ok_or(Error::ChannelNotOk)
    }

    fn machine(&self, ch: ChannelId) -> Result<&TriggerMachine> {
        self.triggers[ch as usize].as_ref().ok_or(Error::ChannelNotOk)
    }

    fn machine_mut(&mut self, ch: ChannelId) -> Result<&mut TriggerMachine> {
        self.triggers[ch as usize].as_mut().ok_or(Error::ChannelNotOk)
    }

    fn installed(&self) -> impl Iterator<Item = ChannelId> + '_ {
        all::<ChannelId>().filter(|id| self.channels[*id as usize].is_some())
    }

    fn effective_output(&self, ch: ChannelId) -> bool {
        !self.inhibited
            && self.channels[ch as usize]
                .as_ref()
                .map_or(false, |c| c.is_output_enabled())
    }

    fn is_tracked(&self, ch: ChannelId) -> bool {
        self.channels[ch as usize]
            .as_ref()
            .map_or(false, |c| c.flags.tracking_enabled)
    }

    /// The same value mirrored to every tracking channel.
    fn tracked_fanout(&self, value: f32) -> Fanout {
        let mut fanout = Fanout::new();
        for id in tracking_group(&self.channels) {
            fanout.push((id, value)).ok();
        }
        fanout
    }

    fn mirrors_via_tracking(&self, ch: ChannelId) -> bool {
        !self.coupling.is_redirected_member(ch) && self.is_tracked(ch)
    }

    /// Channels and values a voltage command lands on, accounting for both
    /// coupling redirection and tracking mirroring.
    fn voltage_targets(&self, ch: ChannelId, voltage: f32) -> Result<Fanout> {
        if self.mirrors_via_tracking(ch) {
            return Ok(self.tracked_fanout(voltage));
        }

        self.coupling.route_voltage(ch, voltage)
    }

    fn current_targets(&self, ch: ChannelId, current: f32) -> Result<Fanout> {
        if self.mirrors_via_tracking(ch) {
            return Ok(self.tracked_fanout(current));
        }

        self.coupling.route_current(ch, current)
    }

    /// Validate-then-apply with no partial application across the fanout.
    fn routed_set_voltage(&mut self, ch: ChannelId, voltage: f32) -> Result<()> {
        let targets = self.voltage_targets(ch, voltage)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_voltage(*value)?;
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.apply_voltage(*value);
        }
        Ok(())
    }

    fn routed_set_current(&mut self, ch: ChannelId, current: f32) -> Result<()> {
        let targets = self.current_targets(ch, current)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_current(*value)?;
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.apply_current(*value);
        }
        Ok(())
    }

    /// Validate and apply a (voltage, current) pair atomically, so a step
    /// whose pair is within the power limit is never rejected because of
    /// the setpoint it is about to replace.
    fn routed_set_pair(&mut self, ch: ChannelId, voltage: f32, current: f32) -> Result<()> {
        self.check_routed_pair(ch, voltage, current)?;

        let v_targets = self.voltage_targets(ch, voltage)?;
        let i_targets = self.current_targets(ch, current)?;
        for (id, value) in &v_targets {
            self.channel_mut(*id)?.apply_voltage(*value);
        }
        for (id, value) in &i_targets {
            self.channel_mut(*id)?.apply_current(*value);
        }
        Ok(())
    }

    fn check_routed_pair(&self, ch: ChannelId, voltage: f32, current: f32) -> Result<()> {
        let v_targets = self.voltage_targets(ch, voltage)?;
        let i_targets = self.current_targets(ch, current)?;

        for ((id, member_v), (_, member_i)) in v_targets.iter().zip(i_targets.iter()) {
            self.channel(*id)?.check_pair(*member_v, *member_i)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn u_set(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.u_set_of(ch, &self.channels))
    }

    pub fn u_mon(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.u_mon_of(ch, &self.channels))
    }

    pub fn u_limit(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.u_limit_of(ch, &self.channels))
    }

    pub fn u_min(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.u_min_of(ch, &self.channels))
    }

    pub fn u_max(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.u_max_of(ch, &self.channels))
    }

    pub fn i_set(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.i_set_of(ch, &self.channels))
    }

    pub fn i_mon(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.i_mon_of(ch, &self.channels))
    }

    pub fn i_limit(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.i_limit_of(ch, &self.channels))
    }

    pub fn i_min(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.i_min_of(ch, &self.channels))
    }

    pub fn i_max(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.i_max_of(ch, &self.channels))
    }

    pub fn p_mon(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.p_mon_of(ch, &self.channels))
    }

    pub fn power_limit(&self, ch: ChannelId) -> Result<f32> {
        self.channel(ch)?;
        Ok(self.coupling.power_limit_of(ch, &self.channels))
    }

    pub fn p_max(&self, ch: ChannelId) -> Result<f32> {
        let own = self.channel(ch)?.params().p_tot;
        if self.coupling.is_redirected_member(ch) {
            match (&self.channels[0], &self.channels[1]) {
                (Some(first), Some(second)) => Ok(first.params().p_tot + second.params().p_tot),
                _ => Ok(own),
            }
        } else {
            Ok(own)
        }
    }

    pub fn mode(&self, ch: ChannelId) -> Result<Mode> {
        Ok(self.channel(ch)?.mode())
    }

    pub fn temperature(&self, ch: ChannelId) -> Result<f32> {
        Ok(self.channel(ch)?.temperature())
    }

    /// Whether the channel's output stage is currently driving. False while
    /// the external inhibit input holds all outputs down.
    pub fn is_output_enabled(&self, ch: ChannelId) -> Result<bool> {
        self.channel(ch)?;
        Ok(self.effective_output(ch))
    }

    pub fn is_ok(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.is_ok())
    }

    pub fn is_ovp_tripped(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.ovp.is_tripped())
    }

    pub fn is_ocp_tripped(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.ocp.is_tripped())
    }

    pub fn is_opp_tripped(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.opp.is_tripped())
    }

    pub fn is_otp_tripped(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.otp.is_tripped())
    }

    pub fn protection_state(&self, ch: ChannelId, kind: ProtectionKind) -> Result<ProtectionState> {
        Ok(self.channel(ch)?.protection(kind).state())
    }

    pub fn coupling_type(&self) -> CouplingType {
        self.coupling.kind()
    }

    pub fn is_tracking_enabled(&self, ch: ChannelId) -> Result<bool> {
        Ok(self.channel(ch)?.flags.tracking_enabled)
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibited
    }

    pub fn trigger_state(&self, ch: ChannelId) -> Result<TriggerState> {
        Ok(self.machine(ch)?.trigger_state())
    }

    pub fn trigger_source(&self, ch: ChannelId) -> Result<TriggerSource> {
        Ok(self.machine(ch)?.context().source())
    }

    pub fn trigger_mode(&self, ch: ChannelId) -> Result<TriggerMode> {
        Ok(self.machine(ch)?.context().mode())
    }

    pub fn trigger_on_list_stop(&self, ch: ChannelId) -> Result<TriggerOnListStop> {
        Ok(self.machine(ch)?.context().on_list_stop())
    }

    pub fn list_count(&self, ch: ChannelId) -> Result<u16> {
        Ok(self.machine(ch)?.context().list().count())
    }

    pub fn list_steps(&self, ch: ChannelId) -> Result<&[ListStep]> {
        Ok(self.machine(ch)?.context().list().steps())
    }

    pub fn current_step_index(&self, ch: ChannelId) -> Result<u16> {
        Ok(self.machine(ch)?.context().execution().step_index() as u16)
    }

    /// Countdown of the longer active ramp, if long enough to display.
    pub fn ramp_countdown(&self, ch: ChannelId) -> Result<Option<(u64, u64)>> {
        self.channel(ch)?;
        let set = &self.ramps[ch as usize];
        let longest = match (&set.voltage, &set.current) {
            (Some(v), Some(i)) => Some(if v.total() >= i.total() { v } else { i }),
            (Some(v), None) => Some(v),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        };
        Ok(longest.and_then(Ramp::countdown))
    }

    pub fn dwell_countdown(&self, ch: ChannelId) -> Result<Option<(u64, u64)>> {
        Ok(self.machine(ch)?.dwell_countdown())
    }

    /// The last published composite status. Safe to call from reader
    /// contexts between ticks.
    pub fn status_snapshot(&self) -> SystemStatus {
        self.status.read()
    }

    pub fn status_generation(&self) -> u32 {
        self.status.generation()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Setpoint and limit commands
    // ------------------------------------------------------------------

    /// Program the voltage setpoint. Cancels any active voltage ramp on the
    /// affected channels.
    pub fn set_voltage(&mut self, ch: ChannelId, voltage: f32) -> Result<()> {
        let targets = self.voltage_targets(ch, voltage)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_voltage(*value)?;
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.apply_voltage(*value);
            self.ramps[*id as usize].voltage = None;
        }
        Ok(())
    }

    /// Program the current setpoint. Cancels any active current ramp on the
    /// affected channels.
    pub fn set_current(&mut self, ch: ChannelId, current: f32) -> Result<()> {
        let targets = self.current_targets(ch, current)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_current(*value)?;
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.apply_current(*value);
            self.ramps[*id as usize].current = None;
        }
        Ok(())
    }

    pub fn set_voltage_limit(&mut self, ch: ChannelId, limit: f32) -> Result<()> {
        let targets = if self.mirrors_via_tracking(ch) {
            self.tracked_fanout(limit)
        } else {
            self.coupling.route_voltage_limit(ch, limit)?
        };
        for (id, value) in &targets {
            let channel = self.channel(*id)?;
            if !(channel.params().u_min..=channel.params().u_max).contains(value)
                || *value < channel.u_set()
            {
                return Err(Error::DataOutOfRange);
            }
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.set_voltage_limit(*value)?;
        }
        Ok(())
    }

    pub fn set_current_limit(&mut self, ch: ChannelId, limit: f32) -> Result<()> {
        let targets = if self.mirrors_via_tracking(ch) {
            self.tracked_fanout(limit)
        } else {
            self.coupling.route_current_limit(ch, limit)?
        };
        for (id, value) in &targets {
            let channel = self.channel(*id)?;
            if !(channel.params().i_min..=channel.params().i_max).contains(value)
                || *value < channel.i_set()
            {
                return Err(Error::DataOutOfRange);
            }
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.set_current_limit(*value)?;
        }
        Ok(())
    }

    pub fn set_power_limit(&mut self, ch: ChannelId, limit: f32) -> Result<()> {
        let targets = if self.mirrors_via_tracking(ch) {
            self.tracked_fanout(limit)
        } else {
            self.coupling.route_power_limit(ch, limit)?
        };
        for (id, value) in &targets {
            let channel = self.channel(*id)?;
            if !(0.0..=channel.params().p_tot).contains(value)
                || *value < channel.u_set() * channel.i_set()
            {
                return Err(Error::DataOutOfRange);
            }
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.set_power_limit(*value)?;
        }
        Ok(())
    }

    pub fn set_current_range_mode(
        &mut self,
        ch: ChannelId,
        mode: CurrentRangeSelectionMode,
    ) -> Result<()> {
        self.channel_mut(ch)?.set_current_range_mode(mode)
    }

    /// Toggle the output stage. Enabling is refused while the hardware
    /// inhibit input is active or while the module is not OK; disabling
    /// always succeeds and aborts any active ramps.
    pub fn set_output_enabled(&mut self, ch: ChannelId, enable: bool) -> Result<()> {
        let channel = self.channel(ch)?;
        if enable {
            if self.inhibited {
                return Err(Error::HardwareInhibited);
            }
            if !channel.is_ok() {
                return Err(Error::ChannelNotOk);
            }
        }

        let group: Members = if !self.coupling.is_member(ch) && self.is_tracked(ch) {
            tracking_group(&self.channels)
        } else {
            self.coupling.output_group(ch)
        };

        for id in group {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.set_output(enable);
            }
            if !enable {
                self.ramps[id as usize].abort();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protection commands
    // ------------------------------------------------------------------

    /// Channels whose protection configuration moves together with `ch`.
    fn protection_group(&self, ch: ChannelId) -> Members {
        if self.coupling.is_redirected_member(ch) {
            self.coupling.output_group(ch)
        } else if self.is_tracked(ch) {
            tracking_group(&self.channels)
        } else {
            let mut group = Members::new();
            group.push(ch).ok();
            group
        }
    }

    pub fn set_ovp_enabled(&mut self, ch: ChannelId, enabled: bool) -> Result<()> {
        self.set_protection_enabled(ch, ProtectionKind::OverVoltage, enabled)
    }

    pub fn set_ovp_level(&mut self, ch: ChannelId, level: f32) -> Result<()> {
        self.set_protection_level(ch, ProtectionKind::OverVoltage, level)
    }

    pub fn set_ovp_delay(&mut self, ch: ChannelId, delay_secs: f32) -> Result<()> {
        self.set_protection_delay(ch, ProtectionKind::OverVoltage, delay_secs)
    }

    pub fn set_ocp_parameters(
        &mut self,
        ch: ChannelId,
        enabled: bool,
        level: f32,
        delay_secs: f32,
    ) -> Result<()> {
        self.set_protection_parameters(ch, ProtectionKind::OverCurrent, enabled, level, delay_secs)
    }

    pub fn set_opp_parameters(
        &mut self,
        ch: ChannelId,
        enabled: bool,
        level: f32,
        delay_secs: f32,
    ) -> Result<()> {
        self.set_protection_parameters(ch, ProtectionKind::OverPower, enabled, level, delay_secs)
    }

    pub fn set_otp_parameters(
        &mut self,
        ch: ChannelId,
        enabled: bool,
        level: f32,
        delay_secs: f32,
    ) -> Result<()> {
        self.set_protection_parameters(
            ch,
            ProtectionKind::OverTemperature,
            enabled,
            level,
            delay_secs,
        )
    }

    /// Validate every member value first, then apply; a rejected parameter
    /// set must not partially reconfigure the group.
    fn set_protection_parameters(
        &mut self,
        ch: ChannelId,
        kind: ProtectionKind,
        enabled: bool,
        level: f32,
        delay_secs: f32,
    ) -> Result<()> {
        let targets = self.protection_level_targets(ch, kind, level)?;
        for (id, value) in &targets {
            let channel = self.channel(*id)?;
            channel.check_protection_level(kind, *value)?;
            channel.check_protection_delay(kind, delay_secs)?;
        }

        let delay = duration_from_secs(delay_secs);
        for (id, value) in &targets {
            let unit = self.channel_mut(*id)?.protection_mut(kind);
            unit.set_level(*value);
            unit.set_delay(delay);
            unit.set_enabled(enabled);
        }
        Ok(())
    }

    fn protection_level_targets(
        &self,
        ch: ChannelId,
        kind: ProtectionKind,
        level: f32,
    ) -> Result<Fanout> {
        if self.mirrors_via_tracking(ch) {
            Ok(self.tracked_fanout(level))
        } else {
            self.coupling.route_protection_level(kind, ch, level)
        }
    }

    fn set_protection_enabled(
        &mut self,
        ch: ChannelId,
        kind: ProtectionKind,
        enabled: bool,
    ) -> Result<()> {
        self.channel(ch)?;
        for id in self.protection_group(ch) {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.protection_mut(kind).set_enabled(enabled);
            }
        }
        Ok(())
    }

    fn set_protection_level(&mut self, ch: ChannelId, kind: ProtectionKind, level: f32) -> Result<()> {
        let targets = self.protection_level_targets(ch, kind, level)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_protection_level(kind, *value)?;
        }
        for (id, value) in &targets {
            self.channel_mut(*id)?.protection_mut(kind).set_level(*value);
        }
        Ok(())
    }

    fn set_protection_delay(
        &mut self,
        ch: ChannelId,
        kind: ProtectionKind,
        delay_secs: f32,
    ) -> Result<()> {
        self.channel(ch)?;
        let group = self.protection_group(ch);
        for id in &group {
            self.channel(*id)?.check_protection_delay(kind, delay_secs)?;
        }

        let delay = duration_from_secs(delay_secs);
        for id in group {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.protection_mut(kind).set_delay(delay);
            }
        }
        Ok(())
    }

    /// Clear a latched protection. Clearing an untripped unit is a no-op
    /// returning success.
    pub fn clear_protection(&mut self, ch: ChannelId, kind: ProtectionKind) -> Result<()> {
        self.channel_mut(ch)?.protection_mut(kind).clear();
        Ok(())
    }

    pub fn clear_all_protections(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel_mut(ch)?;
        for kind in all::<ProtectionKind>() {
            channel.protection_mut(kind).clear();
        }
        Ok(())
    }

    /// Disable all protection kinds at once. Refused while any kind is
    /// tripped; the trip has to be acknowledged first.
    pub fn disable_protection(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel_mut(ch)?;
        if channel.is_tripped() {
            return Err(Error::InvalidState);
        }

        for kind in all::<ProtectionKind>() {
            channel.protection_mut(kind).set_enabled(false);
        }
        Ok(())
    }

    /// Report a hardware OVP comparator trip. Latches immediately,
    /// bypassing the configured delay.
    pub fn latch_hardware_ovp(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel_mut(ch)?;
        if !channel.params().features.hw_ovp {
            return Err(Error::NotSupported);
        }

        let was_tripped = channel.ovp.is_tripped();
        channel.ovp.latch_hardware_trip();
        if !was_tripped {
            let now = self.clock.now();
            self.handle_trip(ch, ProtectionKind::OverVoltage, now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staged (pending-edit) overlay
    // ------------------------------------------------------------------

    pub fn stage_voltage(&mut self, ch: ChannelId, value: f32) -> Result<()> {
        self.channel_mut(ch)?.stage_voltage(value);
        Ok(())
    }

    pub fn staged_voltage(&self, ch: ChannelId) -> Result<Option<f32>> {
        Ok(self.channel(ch)?.staged_voltage())
    }

    /// Commit a staged voltage edit through the normal validated setter.
    pub fn commit_staged_voltage(&mut self, ch: ChannelId) -> Result<()> {
        match self.channel(ch)?.staged_voltage() {
            Some(value) => self.set_voltage(ch, value),
            None => Ok(()),
        }
    }

    pub fn stage_current(&mut self, ch: ChannelId, value: f32) -> Result<()> {
        self.channel_mut(ch)?.stage_current(value);
        Ok(())
    }

    pub fn staged_current(&self, ch: ChannelId) -> Result<Option<f32>> {
        Ok(self.channel(ch)?.staged_current())
    }

    pub fn commit_staged_current(&mut self, ch: ChannelId) -> Result<()> {
        match self.channel(ch)?.staged_current() {
            Some(value) => self.set_current(ch, value),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Coupling and tracking commands
    // ------------------------------------------------------------------

    /// Activate a coupling topology. Selecting the already-active type is a
    /// no-op; everything else resets the member channels into a safe,
    /// conservative configuration first.
    pub fn set_coupling_type(&mut self, kind: CouplingType) -> Result<()> {
        if kind == self.coupling.kind() {
            return Ok(());
        }

        validate_coupling(kind, &self.channels)?;
        let now = self.clock.now();

        self.abort_all_trigger_activity();

        for id in [ChannelId::Zero, ChannelId::One] {
            let Some(channel) = self.channels[id as usize].as_mut() else {
                continue;
            };
            channel.set_output(false);
            channel.flags.rprog_enabled = false;
            if matches!(kind, CouplingType::Series | CouplingType::Parallel) {
                channel.flags.tracking_enabled = false;
            }
            self.ramps[id as usize].abort();
            if let Some(machine) = self.triggers[id as usize].as_mut() {
                machine.abort();
                machine.context_mut().reset_config();
            }
        }

        if kind != CouplingType::None {
            self.align_coupled_members();
        }

        self.coupling.set_kind(kind);

        let event = match kind {
            CouplingType::Parallel => EventId::CoupledInParallel,
            CouplingType::Series => EventId::CoupledInSeries,
            CouplingType::CommonGround => EventId::CoupledCommonGround,
            CouplingType::SplitRails => EventId::CoupledSplitRails,
            CouplingType::None => EventId::Uncoupled,
        };
        self.events.push(event, None, now);
        Ok(())
    }

    /// Snap both members to the more conservative of their configurations
    /// before the relay topology changes.
    fn align_coupled_members(&mut self) {
        let (first, second) = match (&self.channels[0], &self.channels[1]) {
            (Some(first), Some(second)) => (first, second),
            _ => return,
        };

        let u_limit = first.u_limit().min(second.u_limit());
        let i_limit = first.i_limit().min(second.i_limit());
        let power_limit = first.power_limit().min(second.power_limit());

        struct Conservative {
            enabled: bool,
            level: f32,
            delay: Duration,
        }

        let mut aligned: heapless::Vec<Conservative, 4> = heapless::Vec::new();
        for kind in all::<ProtectionKind>() {
            let a = first.protection(kind);
            let b = second.protection(kind);
            aligned
                .push(Conservative {
                    enabled: a.is_enabled() || b.is_enabled(),
                    level: a.level().min(b.level()),
                    delay: a.delay().min(b.delay()),
                })
                .ok();
        }

        for id in [ChannelId::Zero, ChannelId::One] {
            let Some(channel) = self.channels[id as usize].as_mut() else {
                continue;
            };

            let u_min = channel.params().u_min;
            let i_min = channel.params().i_min;
            channel.apply_voltage(u_min);
            channel.apply_current(i_min);
            channel.set_voltage_limit(u_limit).ok();
            channel.set_current_limit(i_limit).ok();
            channel.set_power_limit(power_limit).ok();

            for (kind, conservative) in all::<ProtectionKind>().zip(aligned.iter()) {
                let unit = channel.protection_mut(kind);
                unit.set_enabled(conservative.enabled);
                unit.set_level(conservative.level);
                unit.set_delay(conservative.delay);
            }
        }
    }

    /// Enable setpoint tracking on a channel. Mirroring activates once at
    /// least two channels track; activation snaps the group to a common
    /// safe configuration.
    pub fn enable_tracking(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel(ch)?;
        if !channel.is_ok() {
            return Err(Error::ChannelNotOk);
        }

        if self.coupling.is_redirected_member(ch) {
            return Err(Error::CouplingNotAllowed);
        }

        if self.installed().count() < 2 {
            return Err(Error::CouplingNotAllowed);
        }

        if channel.flags.tracking_enabled {
            return Ok(());
        }

        self.channel_mut(ch)?.flags.tracking_enabled = true;

        let group = tracking_group(&self.channels);
        if group.len() >= 2 {
            let now = self.clock.now();
            self.align_tracking_group(&group);
            self.events.push(EventId::ChannelsTracked, None, now);
        }
        Ok(())
    }

    pub fn disable_tracking(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel_mut(ch)?;
        if !channel.flags.tracking_enabled {
            return Ok(());
        }

        channel.flags.tracking_enabled = false;
        let now = self.clock.now();
        self.events.push(EventId::TrackingDisabled, Some(ch), now);
        Ok(())
    }

    fn align_tracking_group(&mut self, group: &Members) {
        let mut u_set = 0.0f32;
        let mut i_set = 0.0f32;
        let mut u_limit = f32::MAX;
        let mut i_limit = f32::MAX;
        let mut power_limit = f32::MAX;

        for id in group {
            let Some(channel) = self.channels[*id as usize].as_ref() else {
                continue;
            };
            u_set = u_set.max(channel.params().u_min);
            i_set = i_set.max(channel.params().i_min);
            u_limit = u_limit.min(channel.u_limit());
            i_limit = i_limit.min(channel.i_limit());
            power_limit = power_limit.min(channel.power_limit());
        }

        for id in group {
            if let Some(machine) = self.triggers[*id as usize].as_mut() {
                machine.abort();
            }
            self.ramps[*id as usize].abort();

            let Some(channel) = self.channels[*id as usize].as_mut() else {
                continue;
            };
            channel.set_output(false);
            channel.apply_voltage(u_set);
            channel.apply_current(i_set);
            channel.set_voltage_limit(u_limit).ok();
            channel.set_current_limit(i_limit).ok();
            channel.set_power_limit(power_limit).ok();
        }
    }

    // ------------------------------------------------------------------
    // Trigger commands
    // ------------------------------------------------------------------

    pub fn set_trigger_source(&mut self, ch: ChannelId, source: TriggerSource) -> Result<()> {
        self.machine_mut(ch)?.context_mut().source = source;
        Ok(())
    }

    pub fn set_trigger_mode(&mut self, ch: ChannelId, mode: TriggerMode) -> Result<()> {
        self.machine_mut(ch)?.context_mut().mode = mode;
        Ok(())
    }

    pub fn set_trigger_on_list_stop(&mut self, ch: ChannelId, value: TriggerOnListStop) -> Result<()> {
        self.machine_mut(ch)?.context_mut().on_list_stop = value;
        Ok(())
    }

    pub fn set_trigger_delay(&mut self, ch: ChannelId, delay_secs: f32) -> Result<()> {
        if delay_secs < 0.0 {
            return Err(Error::DataOutOfRange);
        }
        self.machine_mut(ch)?.context_mut().delay = duration_from_secs(delay_secs);
        Ok(())
    }

    /// Fixed/step-mode target levels. Validated against the hardware range
    /// here and re-validated against limits when execution starts.
    pub fn set_trigger_levels(&mut self, ch: ChannelId, voltage: f32, current: f32) -> Result<()> {
        let channel = self.channel(ch)?;
        let params = channel.params();
        if !(params.u_min..=params.u_max).contains(&voltage)
            || !(params.i_min..=params.i_max).contains(&current)
        {
            return Err(Error::DataOutOfRange);
        }

        let context = self.machine_mut(ch)?.context_mut();
        context.u_level = voltage;
        context.i_level = current;
        Ok(())
    }

    /// Step-mode ramp durations and the leading output-enable delay.
    pub fn set_trigger_ramp(
        &mut self,
        ch: ChannelId,
        u_duration_secs: f32,
        i_duration_secs: f32,
        output_delay_secs: f32,
    ) -> Result<()> {
        for duration in [u_duration_secs, i_duration_secs, output_delay_secs] {
            if !(0.0..=crate::ramp::RAMP_DURATION_MAX).contains(&duration) {
                return Err(Error::DataOutOfRange);
            }
        }

        let context = self.machine_mut(ch)?.context_mut();
        context.u_ramp_duration = duration_from_secs(u_duration_secs);
        context.i_ramp_duration = duration_from_secs(i_duration_secs);
        context.output_delay = duration_from_secs(output_delay_secs);
        Ok(())
    }

    pub fn set_list(&mut self, ch: ChannelId, steps: &[ListStep]) -> Result<()> {
        self.machine_mut(ch)?.context_mut().list_mut().set_steps(steps)
    }

    pub fn set_list_count(&mut self, ch: ChannelId, count: u16) -> Result<()> {
        self.machine_mut(ch)?.context_mut().list_mut().set_count(count);
        Ok(())
    }

    /// Arm the trigger engine. With an `Immediate` source the engine also
    /// fires in the same call and execution begins on the next tick.
    pub fn initiate_trigger(&mut self, ch: ChannelId) -> Result<()> {
        let channel = self.channel(ch)?;
        if !channel.is_ok() {
            return Err(Error::ChannelNotOk);
        }

        if self.coupling.is_slave(ch) {
            return Err(Error::CouplingViolation);
        }

        if channel.flags.tracking_enabled {
            let group = tracking_group(&self.channels);
            if group.first() != Some(&ch) {
                return Err(Error::InvalidState);
            }
        }

        let (mode, source, u_level, i_level) = {
            let context = self.machine(ch)?.context();
            (context.mode, context.source, context.u_level, context.i_level)
        };

        if channel.flags.rprog_enabled && mode != TriggerMode::Fixed {
            return Err(Error::InvalidState);
        }

        match mode {
            TriggerMode::FunctionGenerator => return Err(Error::NotSupported),
            TriggerMode::List => {
                let steps: heapless::Vec<ListStep, { crate::list::MAX_LIST_LENGTH }> = {
                    let list = self.machine(ch)?.context().list();
                    if list.is_empty() {
                        return Err(Error::ListEmpty);
                    }
                    list.steps().iter().copied().collect()
                };
                for step in &steps {
                    self.check_routed_pair(ch, step.voltage, step.current)?;
                }
            }
            TriggerMode::Fixed | TriggerMode::Step => {
                self.check_routed_pair(ch, u_level, i_level)?;
            }
        }

        if !self.machine_mut(ch)?.arm() {
            return Err(Error::InvalidState);
        }

        if source == TriggerSource::Immediate {
            let now = self.clock.now();
            self.machine_mut(ch)?.fire(TriggerSource::Immediate, now);
        }
        Ok(())
    }

    /// Deliver a front-panel manual trigger to every armed engine with a
    /// `Manual` source.
    pub fn generate_manual_trigger(&mut self) -> Result<()> {
        self.fire_source(TriggerSource::Manual)
    }

    /// Deliver a bus trigger (the *TRG equivalent).
    pub fn bus_trigger(&mut self) -> Result<()> {
        self.fire_source(TriggerSource::Bus)
    }

    /// Deliver an external trigger pin edge.
    pub fn on_external_trigger(&mut self, pin: TriggerPin) -> Result<()> {
        self.fire_source(pin.into())
    }

    fn fire_source(&mut self, source: TriggerSource) -> Result<()> {
        let now = self.clock.now();
        let mut fired = false;
        for id in all::<ChannelId>() {
            if let Some(machine) = self.triggers[id as usize].as_mut() {
                fired |= machine.fire(source, now);
            }
        }

        if fired {
            Ok(())
        } else {
            Err(Error::TriggerIgnored)
        }
    }

    /// Abort one channel's trigger sequence.
    pub fn abort_trigger(&mut self, ch: ChannelId) -> Result<()> {
        self.machine(ch)?;
        let now = self.clock.now();
        self.abort_trigger_sequence(ch);
        self.events.push(EventId::TriggerAborted, Some(ch), now);
        Ok(())
    }

    pub fn abort_all_triggers(&mut self) {
        let now = self.clock.now();
        self.abort_all_trigger_activity();
        self.events.push(EventId::TriggerAborted, None, now);
    }

    fn abort_all_trigger_activity(&mut self) {
        for id in all::<ChannelId>() {
            if self.triggers[id as usize].is_some() {
                self.abort_trigger_sequence(id);
            }
        }
    }

    /// Stop execution on `ch`: idle the machine, drop its ramps, and drive
    /// the output down if a transient was in flight.
    fn abort_trigger_sequence(&mut self, ch: ChannelId) {
        let Some(machine) = self.triggers[ch as usize].as_mut() else {
            return;
        };

        let was_executing = !matches!(
            machine.trigger_state(),
            TriggerState::Idle | TriggerState::Stopped
        );
        let mode = machine.context().mode;
        machine.abort();
        self.ramps[ch as usize].abort();

        if was_executing && mode != TriggerMode::Fixed && self.effective_output(ch) {
            for id in self.coupling.output_group(ch) {
                if let Some(channel) = self.channels[id as usize].as_mut() {
                    channel.set_output(false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Ramp commands
    // ------------------------------------------------------------------

    pub fn start_voltage_ramp(&mut self, ch: ChannelId, target: f32, duration_secs: f32) -> Result<()> {
        if !(0.0..=crate::ramp::RAMP_DURATION_MAX).contains(&duration_secs) {
            return Err(Error::DataOutOfRange);
        }

        let channel = self.channel(ch)?;
        if !channel.is_ok() {
            return Err(Error::ChannelNotOk);
        }

        // Validates the target and rejects slave-directed ramps up front.
        let targets = self.voltage_targets(ch, target)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_voltage(*value)?;
        }

        let start = self.coupling.u_set_of(ch, &self.channels);
        self.ramps[ch as usize].voltage = Some(Ramp::new(
            start,
            target,
            Duration::from_ticks(0),
            duration_from_secs(duration_secs),
        ));
        Ok(())
    }

    pub fn start_current_ramp(&mut self, ch: ChannelId, target: f32, duration_secs: f32) -> Result<()> {
        if !(0.0..=crate::ramp::RAMP_DURATION_MAX).contains(&duration_secs) {
            return Err(Error::DataOutOfRange);
        }

        let channel = self.channel(ch)?;
        if !channel.is_ok() {
            return Err(Error::ChannelNotOk);
        }

        let targets = self.current_targets(ch, target)?;
        for (id, value) in &targets {
            self.channel(*id)?.check_current(*value)?;
        }

        let start = self.coupling.i_set_of(ch, &self.channels);
        self.ramps[ch as usize].current = Some(Ramp::new(
            start,
            target,
            Duration::from_ticks(0),
            duration_from_secs(duration_secs),
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // External inputs
    // ------------------------------------------------------------------

    /// Ingest the latest ADC sample for one channel.
    pub fn feed_sample(&mut self, ch: ChannelId, sample: AdcSample) -> Result<()> {
        self.channel_mut(ch)?.feed_sample(&sample);
        Ok(())
    }

    /// Drive the I/O-pin inhibit state. While inhibited all outputs are
    /// held down, output enabling is refused and dwell countdowns pause.
    pub fn set_inhibited(&mut self, inhibited: bool) {
        if self.inhibited == inhibited {
            return;
        }

        self.inhibited = inhibited;
        let now = self.clock.now();
        let event = if inhibited {
            EventId::OutputInhibited
        } else {
            EventId::InhibitCleared
        };
        self.events.push(event, None, now);
    }

    /// Record the result of a module self-test. A failed module is forced
    /// off and excluded from coupling, triggering and ramping until it
    /// passes again.
    pub fn set_module_ok(&mut self, ch: ChannelId, ok: bool) -> Result<()> {
        let channel = self.channel_mut(ch)?;
        if channel.flags.ok == ok {
            return Ok(());
        }

        channel.flags.ok = ok;
        let now = self.clock.now();
        if ok {
            self.events.push(EventId::ModuleRecovered, Some(ch), now);
        } else {
            self.channel_mut(ch)?.set_output(false);
            self.abort_trigger_sequence(ch);
            self.events.push(EventId::ModuleFault, Some(ch), now);
        }
        Ok(())
    }

    pub fn set_rprog_enabled(&mut self, ch: ChannelId, enabled: bool) -> Result<()> {
        if enabled {
            if !self.channel(ch)?.params().features.rprog {
                return Err(Error::NotSupported);
            }
            if self.coupling.is_redirected_member(ch) {
                return Err(Error::CouplingNotAllowed);
            }
        }

        self.channel_mut(ch)?.flags.rprog_enabled = enabled;
        Ok(())
    }

    /// Force the instrument into standby: all outputs off, all trigger
    /// activity aborted.
    pub fn enter_standby(&mut self) {
        let now = self.clock.now();
        self.abort_all_trigger_activity();
        for id in all::<ChannelId>() {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.set_output(false);
            }
            self.ramps[id as usize].abort();
        }
        self.events.push(EventId::Standby, None, now);
    }

    /// System-wide protection behavior flags.
    pub fn set_output_protection_coupled(&mut self, coupled: bool) {
        self.output_protection_coupled = coupled;
    }

    pub fn set_shutdown_when_protection_tripped(&mut self, shutdown: bool) {
        self.shutdown_when_protection_tripped = shutdown;
    }

    // ------------------------------------------------------------------
    // Settings application
    // ------------------------------------------------------------------

    /// Apply a validated channel configuration directly to one channel.
    ///
    /// This is the boot/profile-recall path: it addresses the channel
    /// itself, before any coupling topology is re-established.
    pub fn apply_channel_config(
        &mut self,
        ch: ChannelId,
        config: &crate::settings::ChannelConfig,
    ) -> Result<()> {
        let params = *self.channel(ch)?.params();
        config.validate(&params).map_err(|reason| {
            warn!("channel {} config rejected: {}", ch as usize, reason);
            Error::DataOutOfRange
        })?;

        let channel = self.channel_mut(ch)?;
        channel.apply_voltage(config.voltage);
        channel.apply_current(config.current);
        channel.set_voltage_limit(config.voltage_limit)?;
        channel.set_current_limit(config.current_limit)?;
        channel.set_power_limit(config.power_limit)?;

        for (kind, enabled, level, delay_secs) in [
            (
                ProtectionKind::OverVoltage,
                config.ovp_enabled,
                config.ovp_level,
                config.ovp_delay,
            ),
            (
                ProtectionKind::OverCurrent,
                config.ocp_enabled,
                config.ocp_level,
                config.ocp_delay,
            ),
            (
                ProtectionKind::OverPower,
                config.opp_enabled,
                config.opp_level,
                config.opp_delay,
            ),
            (
                ProtectionKind::OverTemperature,
                config.otp_enabled,
                config.otp_level,
                config.otp_delay,
            ),
        ] {
            let unit = channel.protection_mut(kind);
            unit.set_level(level);
            unit.set_delay(duration_from_secs(delay_secs));
            unit.set_enabled(enabled);
        }

        let context = self.machine_mut(ch)?.context_mut();
        context.source = config.trigger_source;
        context.mode = config.trigger_mode;
        context.on_list_stop = config.trigger_on_list_stop;

        self.set_output_enabled(ch, config.output_enabled)
    }

    pub fn apply_runtime_settings(&mut self, settings: &crate::settings::RuntimeSettings) {
        self.output_protection_coupled = settings.output_protection_coupled;
        self.shutdown_when_protection_tripped = settings.shutdown_when_protection_tripped;
    }

    // ------------------------------------------------------------------
    // Control tick
    // ------------------------------------------------------------------

    /// Run one control period: protection evaluation, ramp advancement,
    /// trigger/list stepping, snapshot publication — in that order.
    pub fn tick(&mut self) {
        let now = self.clock.advance();
        self.protection_tick(now);
        self.ramp_tick(now);
        self.trigger_tick(now);
        self.publish_status();
    }

    fn protection_tick(&mut self, now: Instant) {
        let mut trips: heapless::Vec<(ChannelId, ProtectionKind), { CHANNEL_COUNT * 4 }> =
            heapless::Vec::new();

        for id in all::<ChannelId>() {
            let armed = self.effective_output(id);
            let Some(channel) = self.channels[id as usize].as_mut() else {
                continue;
            };

            let u_mon = channel.u_mon();
            let i_mon = channel.i_mon();
            let p_mon = channel.p_mon();
            let temperature = channel.temperature();

            for kind in all::<ProtectionKind>() {
                let (monitored, gate) = match kind {
                    ProtectionKind::OverVoltage => (u_mon, armed),
                    ProtectionKind::OverCurrent => (i_mon, armed),
                    ProtectionKind::OverPower => (p_mon, armed),
                    ProtectionKind::OverTemperature => (temperature, true),
                };

                if channel.protection_mut(kind).evaluate(monitored, gate, now) {
                    trips.push((id, kind)).ok();
                }
            }
        }

        for (id, kind) in trips {
            self.handle_trip(id, kind, now);
        }
    }

    fn handle_trip(&mut self, ch: ChannelId, kind: ProtectionKind, now: Instant) {
        let event = match kind {
            ProtectionKind::OverVoltage => EventId::OvpTripped,
            ProtectionKind::OverCurrent => EventId::OcpTripped,
            ProtectionKind::OverPower => EventId::OppTripped,
            ProtectionKind::OverTemperature => EventId::OtpTripped,
        };
        self.events.push(event, Some(ch), now);

        // A thermal fault on one member of a coupled pair or tracking group
        // heats the shared enclosure; trip the peers with it.
        if kind == ProtectionKind::OverTemperature {
            let peers: Members = if self.coupling.is_member(ch) {
                self.coupling.output_group(ch)
            } else if self.is_tracked(ch) {
                tracking_group(&self.channels)
            } else {
                Members::new()
            };

            let mut newly_tripped = Members::new();
            for id in peers {
                if id == ch {
                    continue;
                }
                if let Some(peer) = self.channels[id as usize].as_mut() {
                    if !peer.otp.is_tripped() {
                        peer.otp.latch_trip();
                        newly_tripped.push(id).ok();
                    }
                }
            }

            for id in newly_tripped {
                self.events.push(EventId::OtpTripped, Some(id), now);
                self.force_channel_down(id);
            }
        }

        self.force_channel_down(ch);

        if self.shutdown_when_protection_tripped {
            self.enter_standby();
        } else if self.output_protection_coupled {
            for id in all::<ChannelId>() {
                if let Some(channel) = self.channels[id as usize].as_mut() {
                    channel.set_output(false);
                }
            }
        }
    }

    fn force_channel_down(&mut self, ch: ChannelId) {
        self.abort_trigger_sequence(ch);
        self.ramps[ch as usize].abort();
        for id in self.coupling.output_group(ch) {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.set_output(false);
            }
        }
    }

    fn ramp_tick(&mut self, now: Instant) {
        use crate::ramp::RampProgress;

        let period = self.clock.period();
        for id in all::<ChannelId>() {
            if self.channels[id as usize].is_none() || !self.effective_output(id) {
                continue;
            }

            if let Some(mut ramp) = self.ramps[id as usize].voltage.take() {
                match ramp.advance(period) {
                    RampProgress::Waiting => self.ramps[id as usize].voltage = Some(ramp),
                    RampProgress::Value(value) => match self.routed_set_voltage(id, value) {
                        Ok(()) => self.ramps[id as usize].voltage = Some(ramp),
                        Err(error) => {
                            warn!("voltage ramp aborted on channel {}: {:?}", id as usize, error);
                            self.events.push(EventId::RampAborted, Some(id), now);
                        }
                    },
                    RampProgress::Done(value) => {
                        if let Err(error) = self.routed_set_voltage(id, value) {
                            warn!("voltage ramp aborted on channel {}: {:?}", id as usize, error);
                            self.events.push(EventId::RampAborted, Some(id), now);
                        }
                    }
                }
            }

            if let Some(mut ramp) = self.ramps[id as usize].current.take() {
                match ramp.advance(period) {
                    RampProgress::Waiting => self.ramps[id as usize].current = Some(ramp),
                    RampProgress::Value(value) => match self.routed_set_current(id, value) {
                        Ok(()) => self.ramps[id as usize].current = Some(ramp),
                        Err(error) => {
                            warn!("current ramp aborted on channel {}: {:?}", id as usize, error);
                            self.events.push(EventId::RampAborted, Some(id), now);
                        }
                    },
                    RampProgress::Done(value) => {
                        if let Err(error) = self.routed_set_current(id, value) {
                            warn!("current ramp aborted on channel {}: {:?}", id as usize, error);
                            self.events.push(EventId::RampAborted, Some(id), now);
                        }
                    }
                }
            }
        }
    }

    fn trigger_tick(&mut self, now: Instant) {
        for id in all::<ChannelId>() {
            if self.triggers[id as usize].is_none() || self.coupling.is_slave(id) {
                continue;
            }

            let state = self.triggers[id as usize].as_ref().unwrap().trigger_state();
            match state {
                TriggerState::Triggered => {
                    let machine = self.triggers[id as usize].as_mut().unwrap();
                    if machine.delay_elapsed(now) {
                        machine.process_event(TriggerEvents::DelayElapsed).ok();
                        self.start_execution(id, now);
                    }
                }
                TriggerState::Initiating => self.start_execution(id, now),
                TriggerState::Running => self.run_execution(id, now),
                _ => {}
            }
        }
    }

    /// Begin execution for a freshly delayed trigger.
    fn start_execution(&mut self, ch: ChannelId, now: Instant) {
        let (mode, u_level, i_level, output_on, output_delay, u_duration, i_duration) = {
            let context = self.triggers[ch as usize].as_ref().unwrap().context();
            (
                context.mode,
                context.u_level,
                context.i_level,
                context.output_on_trigger,
                context.output_delay,
                context.u_ramp_duration,
                context.i_ramp_duration,
            )
        };

        match mode {
            TriggerMode::Fixed => {
                if let Err(error) = self.routed_set_pair(ch, u_level, i_level) {
                    warn!("fixed trigger rejected on channel {}: {:?}", ch as usize, error);
                    self.abort_trigger_sequence(ch);
                    self.events.push(EventId::TriggerAborted, Some(ch), now);
                    return;
                }
                self.triggers[ch as usize]
                    .as_mut()
                    .unwrap()
                    .process_event(TriggerEvents::ExecutionFinished)
                    .ok();
            }
            TriggerMode::List => {
                let first = *self.triggers[ch as usize]
                    .as_ref()
                    .unwrap()
                    .context()
                    .list()
                    .get(0)
                    .unwrap();
                if let Err(error) = self.routed_set_pair(ch, first.voltage, first.current) {
                    warn!("list start rejected on channel {}: {:?}", ch as usize, error);
                    self.abort_trigger_sequence(ch);
                    self.events.push(EventId::ListAborted, Some(ch), now);
                    return;
                }

                if output_on {
                    self.execution_output_on(ch);
                }

                let machine = self.triggers[ch as usize].as_mut().unwrap();
                machine.process_event(TriggerEvents::ExecutionStarted).ok();
                let dwell = machine.context().list().dwell_of(0);
                machine.context_mut().exec.dwell_remaining = dwell;
            }
            TriggerMode::Step => {
                let (u_min, i_min) = {
                    let params = self.channels[ch as usize].as_ref().unwrap().params();
                    (params.u_min, params.i_min)
                };

                if let Err(error) = self.routed_set_pair(ch, u_min, i_min) {
                    warn!("step start rejected on channel {}: {:?}", ch as usize, error);
                    self.abort_trigger_sequence(ch);
                    self.events.push(EventId::TriggerAborted, Some(ch), now);
                    return;
                }

                if output_on {
                    self.execution_output_on(ch);
                }

                self.ramps[ch as usize].voltage =
                    Some(Ramp::new(u_min, u_level, output_delay, u_duration));
                self.ramps[ch as usize].current =
                    Some(Ramp::new(i_min, i_level, output_delay, i_duration));
                self.triggers[ch as usize]
                    .as_mut()
                    .unwrap()
                    .process_event(TriggerEvents::ExecutionStarted)
                    .ok();
            }
            TriggerMode::FunctionGenerator => {
                self.abort_trigger_sequence(ch);
            }
        }
    }

    fn execution_output_on(&mut self, ch: ChannelId) {
        if self.inhibited {
            return;
        }

        for id in self.coupling.output_group(ch) {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                if channel.is_ok() {
                    channel.set_output(true);
                }
            }
        }
    }

    fn run_execution(&mut self, ch: ChannelId, now: Instant) {
        let mode = self.triggers[ch as usize].as_ref().unwrap().context().mode;
        match mode {
            TriggerMode::List => self.run_list(ch, now),
            TriggerMode::Step => {
                if self.ramps[ch as usize].is_idle() {
                    self.triggers[ch as usize]
                        .as_mut()
                        .unwrap()
                        .process_event(TriggerEvents::ExecutionFinished)
                        .ok();
                }
            }
            _ => {}
        }
    }

    fn run_list(&mut self, ch: ChannelId, now: Instant) {
        // Dwell countdowns pause while the inhibit input is active.
        if self.inhibited {
            return;
        }

        let period = self.clock.period();
        let outcome = {
            let context = self.triggers[ch as usize].as_mut().unwrap().context_mut();
            if context.exec.dwell_remaining > period {
                context.exec.dwell_remaining -= period;
                None
            } else {
                let outcome = context.list.advance(&mut context.exec);
                if let StepOutcome::Apply(index) = outcome {
                    context.exec.dwell_remaining = context.list.dwell_of(index);
                }
                Some(outcome)
            }
        };

        match outcome {
            None => {}
            Some(StepOutcome::Apply(index)) => {
                let step = *self.triggers[ch as usize]
                    .as_ref()
                    .unwrap()
                    .context()
                    .list()
                    .get(index)
                    .unwrap();
                if let Err(error) = self.routed_set_pair(ch, step.voltage, step.current) {
                    warn!("list step rejected on channel {}: {:?}", ch as usize, error);
                    self.abort_trigger_sequence(ch);
                    self.events.push(EventId::ListAborted, Some(ch), now);
                }
            }
            Some(StepOutcome::Finished) => {
                let policy = self.triggers[ch as usize].as_ref().unwrap().context().on_list_stop;
                self.triggers[ch as usize]
                    .as_mut()
                    .unwrap()
                    .process_event(TriggerEvents::ExecutionFinished)
                    .ok();
                self.apply_list_stop(ch, policy);
            }
        }
    }

    /// Applied exactly once, on the Running -> Stopped transition.
    fn apply_list_stop(&mut self, ch: ChannelId, policy: TriggerOnListStop) {
        match policy {
            TriggerOnListStop::OutputOff => {
                self.snap_to_minimum(ch);
                self.outputs_off_group(ch);
            }
            TriggerOnListStop::SetToFirstStep => {
                if let Some(step) = self.list_step_copy(ch, 0) {
                    self.routed_set_pair(ch, step.voltage, step.current).ok();
                }
            }
            TriggerOnListStop::SetToLastStep => {
                let last = self.machine(ch).map(|m| m.context().list().len()).unwrap_or(0);
                if last > 0 {
                    if let Some(step) = self.list_step_copy(ch, last - 1) {
                        self.routed_set_pair(ch, step.voltage, step.current).ok();
                    }
                }
            }
            TriggerOnListStop::Standby => {
                self.snap_to_minimum(ch);
                self.outputs_off_group(ch);
                self.enter_standby();
            }
        }
    }

    fn list_step_copy(&self, ch: ChannelId, index: usize) -> Option<ListStep> {
        self.machine(ch)
            .ok()
            .and_then(|machine| machine.context().list().get(index).copied())
    }

    fn snap_to_minimum(&mut self, ch: ChannelId) {
        let (u_min, i_min) = match self.channels[ch as usize].as_ref() {
            Some(channel) => (channel.params().u_min, channel.params().i_min),
            None => return,
        };
        self.routed_set_pair(ch, u_min, i_min).ok();
    }

    fn outputs_off_group(&mut self, ch: ChannelId) {
        for id in self.coupling.output_group(ch) {
            if let Some(channel) = self.channels[id as usize].as_mut() {
                channel.set_output(false);
            }
        }
    }

    fn publish_status(&mut self) {
        let mut status = SystemStatus {
            channels: Default::default(),
            coupling: self.coupling.kind(),
            inhibited: self.inhibited,
        };

        for id in all::<ChannelId>() {
            let Some(channel) = self.channels[id as usize].as_ref() else {
                continue;
            };
            let machine = self.triggers[id as usize].as_ref();

            status.channels[id as usize] = Some(ChannelStatus {
                u_set: channel.u_set(),
                u_mon: channel.u_mon(),
                i_set: channel.i_set(),
                i_mon: channel.i_mon(),
                p_mon: channel.p_mon(),
                temperature: channel.temperature(),
                mode: channel.mode(),
                output_enabled: self.effective_output(id),
                ok: channel.is_ok(),
                ovp_tripped: channel.ovp.is_tripped(),
                ocp_tripped: channel.ocp.is_tripped(),
                opp_tripped: channel.opp.is_tripped(),
                otp_tripped: channel.otp.is_tripped(),
                tracking_enabled: channel.flags.tracking_enabled,
                trigger_state: machine.map(|m| m.trigger_state()).unwrap_or_default(),
                step_index: machine
                    .map(|m| m.context().execution().step_index() as u16)
                    .unwrap_or(0),
            });
        }

        self.status.publish(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH0: ChannelId = ChannelId::Zero;
    const CH1: ChannelId = ChannelId::One;
    const CH2: ChannelId = ChannelId::Two;

    fn bank() -> PowerChannels {
        let big = ChannelParams::cv_cc_40v_5a();
        let small = ChannelParams::cv_cc_20v_4a();
        PowerChannels::new(
            &[(0, 0, big), (1, 0, big), (2, 0, small)],
            Duration::from_ticks(1),
        )
    }

    fn ticks(bank: &mut PowerChannels, count: usize) {
        for _ in 0..count {
            bank.tick();
        }
    }

    fn feed_voltage(bank: &mut PowerChannels, ch: ChannelId, u_mon: f32) {
        bank.feed_sample(
            ch,
            AdcSample {
                u_mon,
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn range_enforcement_leaves_rejected_setpoints_unchanged() {
        let mut bank = bank();
        bank.set_voltage(CH0, 12.0).unwrap();
        assert_eq!(bank.u_set(CH0).unwrap(), 12.0);

        assert_eq!(bank.set_voltage(CH0, 45.0), Err(Error::DataOutOfRange));
        bank.set_voltage_limit(CH0, 20.0).unwrap();
        assert_eq!(bank.set_voltage(CH0, 25.0), Err(Error::VoltageLimitExceeded));

        bank.set_current(CH0, 5.0).unwrap();
        bank.set_power_limit(CH0, 80.0).unwrap();
        assert_eq!(bank.set_voltage(CH0, 17.0), Err(Error::PowerLimitExceeded));

        assert_eq!(bank.u_set(CH0).unwrap(), 12.0);
    }

    #[test]
    fn protection_trip_latches_until_cleared() {
        let mut bank = bank();
        bank.set_ovp_level(CH0, 12.0).unwrap();
        bank.set_ovp_delay(CH0, 0.0).unwrap();
        bank.set_ovp_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();

        feed_voltage(&mut bank, CH0, 12.0);
        bank.tick();
        assert!(bank.is_ovp_tripped(CH0).unwrap());
        assert!(!bank.is_output_enabled(CH0).unwrap());
        assert_eq!(bank.events().last_error().unwrap().id, EventId::OvpTripped);

        // The condition clearing on its own never clears the latch.
        feed_voltage(&mut bank, CH0, 0.0);
        ticks(&mut bank, 50);
        assert!(bank.is_ovp_tripped(CH0).unwrap());

        bank.clear_protection(CH0, ProtectionKind::OverVoltage).unwrap();
        assert!(!bank.is_ovp_tripped(CH0).unwrap());
        assert_eq!(
            bank.protection_state(CH0, ProtectionKind::OverVoltage).unwrap(),
            ProtectionState::Normal
        );
    }

    #[test]
    fn clearing_an_untripped_protection_is_a_no_op() {
        let mut bank = bank();
        assert_eq!(bank.clear_protection(CH0, ProtectionKind::OverCurrent), Ok(()));
        assert_eq!(
            bank.protection_state(CH0, ProtectionKind::OverCurrent).unwrap(),
            ProtectionState::Disabled
        );
    }

    #[test]
    fn debounce_requires_a_continuous_violation() {
        let mut bank = bank();
        bank.set_ovp_level(CH0, 12.0).unwrap();
        bank.set_ovp_delay(CH0, 0.01).unwrap();
        bank.set_ovp_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();

        // 5ms of violation followed by recovery: under the 10ms delay.
        feed_voltage(&mut bank, CH0, 15.0);
        ticks(&mut bank, 5);
        feed_voltage(&mut bank, CH0, 0.0);
        ticks(&mut bank, 20);
        assert!(!bank.is_ovp_tripped(CH0).unwrap());

        // A fresh violation must run the full delay again.
        feed_voltage(&mut bank, CH0, 15.0);
        ticks(&mut bank, 8);
        assert!(!bank.is_ovp_tripped(CH0).unwrap());
        ticks(&mut bank, 5);
        assert!(bank.is_ovp_tripped(CH0).unwrap());
    }

    #[test]
    fn hardware_comparator_path_latches_regardless_of_delay() {
        let mut bank = bank();
        bank.set_ovp_delay(CH0, 5.0).unwrap();
        bank.set_ovp_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();

        bank.latch_hardware_ovp(CH0).unwrap();
        assert!(bank.is_ovp_tripped(CH0).unwrap());
        assert!(!bank.is_output_enabled(CH0).unwrap());

        // The basic module has no hardware comparator.
        assert_eq!(bank.latch_hardware_ovp(CH2), Err(Error::NotSupported));
    }

    #[test]
    fn coupled_trip_forces_all_outputs_off() {
        let mut bank = bank();
        bank.set_output_protection_coupled(true);
        bank.set_ovp_level(CH0, 10.0).unwrap();
        bank.set_ovp_delay(CH0, 0.0).unwrap();
        bank.set_ovp_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH2, true).unwrap();

        feed_voltage(&mut bank, CH0, 11.0);
        bank.tick();
        assert!(bank.is_ovp_tripped(CH0).unwrap());
        assert!(!bank.is_output_enabled(CH2).unwrap());
    }

    #[test]
    fn ramp_reaches_the_target_exactly_and_monotonically() {
        let mut bank = bank();
        bank.set_output_enabled(CH0, true).unwrap();
        bank.start_voltage_ramp(CH0, 10.0, 5.0).unwrap();

        let mut previous = 0.0;
        for _ in 0..2_500 {
            bank.tick();
            let value = bank.u_set(CH0).unwrap();
            assert!(value >= previous);
            previous = value;
        }
        let midway = bank.u_set(CH0).unwrap();
        assert!(midway > 0.0 && midway < 10.0);

        ticks(&mut bank, 2_600);
        assert_eq!(bank.u_set(CH0).unwrap(), 10.0);
        assert_eq!(bank.ramp_countdown(CH0).unwrap(), None);
    }

    #[test]
    fn direct_set_cancels_an_active_ramp() {
        let mut bank = bank();
        bank.set_output_enabled(CH0, true).unwrap();
        bank.start_voltage_ramp(CH0, 10.0, 5.0).unwrap();
        ticks(&mut bank, 100);

        bank.set_voltage(CH0, 3.0).unwrap();
        ticks(&mut bank, 200);
        // The ramp is gone; the setpoint stays where the direct write put it.
        assert_eq!(bank.u_set(CH0).unwrap(), 3.0);
    }

    #[test]
    fn output_disable_aborts_ramps() {
        let mut bank = bank();
        bank.set_output_enabled(CH0, true).unwrap();
        bank.start_voltage_ramp(CH0, 10.0, 5.0).unwrap();
        ticks(&mut bank, 100);

        bank.set_output_enabled(CH0, false).unwrap();
        let level = bank.u_set(CH0).unwrap();
        ticks(&mut bank, 200);
        assert_eq!(bank.u_set(CH0).unwrap(), level);
    }

    #[test]
    fn ramp_countdown_only_shows_for_long_ramps() {
        let mut bank = bank();
        bank.set_output_enabled(CH0, true).unwrap();

        bank.start_voltage_ramp(CH0, 1.0, 0.5).unwrap();
        assert_eq!(bank.ramp_countdown(CH0).unwrap(), None);

        bank.start_voltage_ramp(CH0, 10.0, 8.0).unwrap();
        assert_eq!(bank.ramp_countdown(CH0).unwrap(), Some((8, 8)));
    }

    fn three_step_list(bank: &mut PowerChannels, ch: ChannelId, count: u16) {
        let steps = [
            ListStep { voltage: 1.0, current: 1.0, dwell: 1.0 },
            ListStep { voltage: 2.0, current: 1.0, dwell: 2.0 },
            ListStep { voltage: 3.0, current: 1.0, dwell: 3.0 },
        ];
        bank.set_list(ch, &steps).unwrap();
        bank.set_list_count(ch, count).unwrap();
        bank.set_trigger_mode(ch, TriggerMode::List).unwrap();
    }

    #[test]
    fn list_cycles_and_applies_the_stop_policy_once() {
        let mut bank = bank();
        three_step_list(&mut bank, CH0, 2);
        bank.initiate_trigger(CH0).unwrap();

        // Execution begins on the first tick and applies step zero.
        bank.tick();
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Running);
        assert_eq!(bank.u_set(CH0).unwrap(), 1.0);
        assert!(bank.is_output_enabled(CH0).unwrap());

        // 1s + 2s + 3s in: back on step zero, second cycle.
        ticks(&mut bank, 6_500);
        assert_eq!(bank.current_step_index(CH0).unwrap(), 0);
        assert_eq!(bank.u_set(CH0).unwrap(), 1.0);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Running);

        // After the second full cycle the engine stops and the default
        // policy (output off) is applied.
        ticks(&mut bank, 6_000);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Stopped);
        assert!(!bank.is_output_enabled(CH0).unwrap());
        assert_eq!(bank.u_set(CH0).unwrap(), 0.0);
    }

    #[test]
    fn list_stop_can_snap_to_the_first_step() {
        let mut bank = bank();
        three_step_list(&mut bank, CH0, 1);
        bank.set_trigger_on_list_stop(CH0, TriggerOnListStop::SetToFirstStep)
            .unwrap();
        bank.initiate_trigger(CH0).unwrap();

        ticks(&mut bank, 6_100);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Stopped);
        assert_eq!(bank.u_set(CH0).unwrap(), 1.0);
        assert!(bank.is_output_enabled(CH0).unwrap());
    }

    #[test]
    fn inhibit_pauses_dwell_countdowns() {
        let mut bank = bank();
        three_step_list(&mut bank, CH0, 0);
        bank.initiate_trigger(CH0).unwrap();
        ticks(&mut bank, 500);
        assert_eq!(bank.current_step_index(CH0).unwrap(), 0);

        bank.set_inhibited(true);
        ticks(&mut bank, 2_000);
        // Without the inhibit this would be on step one already.
        assert_eq!(bank.current_step_index(CH0).unwrap(), 0);

        bank.set_inhibited(false);
        ticks(&mut bank, 600);
        assert_eq!(bank.current_step_index(CH0).unwrap(), 1);
    }

    #[test]
    fn empty_list_cannot_be_initiated() {
        let mut bank = bank();
        bank.set_trigger_mode(CH0, TriggerMode::List).unwrap();
        assert_eq!(bank.initiate_trigger(CH0), Err(Error::ListEmpty));
    }

    #[test]
    fn list_steps_beyond_the_limits_fail_initiation() {
        let mut bank = bank();
        let steps = [ListStep { voltage: 39.0, current: 5.0, dwell: 1.0 }];
        bank.set_list(CH0, &steps).unwrap();
        bank.set_trigger_mode(CH0, TriggerMode::List).unwrap();
        bank.set_power_limit(CH0, 100.0).unwrap();

        assert_eq!(bank.initiate_trigger(CH0), Err(Error::PowerLimitExceeded));
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Idle);
    }

    #[test]
    fn manual_trigger_only_fires_armed_manual_engines() {
        let mut bank = bank();
        assert_eq!(bank.generate_manual_trigger(), Err(Error::TriggerIgnored));

        bank.set_trigger_source(CH0, TriggerSource::Manual).unwrap();
        bank.set_trigger_levels(CH0, 5.0, 1.0).unwrap();
        bank.initiate_trigger(CH0).unwrap();
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Armed);

        bank.generate_manual_trigger().unwrap();
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Triggered);

        // Already triggered: a second event has no armed engine to take it.
        assert_eq!(bank.generate_manual_trigger(), Err(Error::TriggerIgnored));

        // Fixed mode applies the programmed levels and stops.
        ticks(&mut bank, 3);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Stopped);
        assert_eq!(bank.u_set(CH0).unwrap(), 5.0);
    }

    #[test]
    fn step_mode_ramps_to_the_trigger_levels() {
        let mut bank = bank();
        bank.set_trigger_mode(CH0, TriggerMode::Step).unwrap();
        bank.set_trigger_levels(CH0, 10.0, 1.0).unwrap();
        bank.set_trigger_ramp(CH0, 1.0, 1.0, 0.0).unwrap();
        bank.initiate_trigger(CH0).unwrap();

        ticks(&mut bank, 500);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Running);
        let midway = bank.u_set(CH0).unwrap();
        assert!(midway > 0.0 && midway < 10.0);

        ticks(&mut bank, 700);
        assert_eq!(bank.trigger_state(CH0).unwrap(), TriggerState::Stopped);
        assert_eq!(bank.u_set(CH0).unwrap(), 10.0);
        assert_eq!(bank.i_set(CH0).unwrap(), 1.0);
    }

    #[test]
    fn series_coupling_splits_the_master_and_rejects_the_slave() {
        let mut bank = bank();
        bank.set_coupling_type(CouplingType::Series).unwrap();
        assert_eq!(bank.coupling_type(), CouplingType::Series);

        bank.set_voltage(CH0, 10.0).unwrap();
        assert_eq!(bank.u_set(CH0).unwrap(), 10.0);

        bank.tick();
        let status = bank.status_snapshot();
        assert_eq!(status.channels[0].unwrap().u_set, 5.0);
        assert_eq!(status.channels[1].unwrap().u_set, 5.0);

        assert_eq!(bank.set_voltage(CH1, 4.0), Err(Error::CouplingViolation));
        let status = bank.status_snapshot();
        assert_eq!(status.channels[1].unwrap().u_set, 5.0);

        // The series pair doubles the voltage range.
        assert_eq!(bank.u_max(CH0).unwrap(), 80.0);
    }

    #[test]
    fn coupling_requires_capable_channels() {
        let mut bank = bank();
        bank.set_module_ok(CH1, false).unwrap();
        assert_eq!(
            bank.set_coupling_type(CouplingType::Parallel),
            Err(Error::ChannelNotOk)
        );
        assert_eq!(bank.coupling_type(), CouplingType::None);

        bank.set_module_ok(CH1, true).unwrap();
        bank.set_coupling_type(CouplingType::Parallel).unwrap();

        // Re-selecting the active type is a no-op.
        assert_eq!(bank.set_coupling_type(CouplingType::Parallel), Ok(()));
    }

    #[test]
    fn coupled_outputs_toggle_together() {
        let mut bank = bank();
        bank.set_coupling_type(CouplingType::CommonGround).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();
        assert!(bank.is_output_enabled(CH1).unwrap());

        bank.set_output_enabled(CH1, false).unwrap();
        assert!(!bank.is_output_enabled(CH0).unwrap());
    }

    #[test]
    fn tracking_mirrors_setpoints_without_coupling() {
        let mut bank = bank();
        bank.enable_tracking(CH0).unwrap();
        bank.enable_tracking(CH2).unwrap();
        assert_eq!(bank.events().last().unwrap().id, EventId::ChannelsTracked);

        bank.set_voltage(CH0, 5.0).unwrap();
        assert_eq!(bank.u_set(CH2).unwrap(), 5.0);

        bank.set_current(CH2, 2.0).unwrap();
        assert_eq!(bank.i_set(CH0).unwrap(), 2.0);

        // The tracked range is the intersection of the group.
        assert_eq!(bank.u_max(CH0).unwrap(), 20.0);
    }

    #[test]
    fn tracking_and_coupling_are_mutually_exclusive() {
        let mut bank = bank();
        bank.set_coupling_type(CouplingType::Series).unwrap();
        assert_eq!(bank.enable_tracking(CH0), Err(Error::CouplingNotAllowed));

        bank.set_coupling_type(CouplingType::None).unwrap();
        bank.enable_tracking(CH0).unwrap();
        bank.enable_tracking(CH1).unwrap();

        // Activating series coupling clears tracking on the members.
        bank.set_coupling_type(CouplingType::Series).unwrap();
        assert!(!bank.is_tracking_enabled(CH0).unwrap());
        assert!(!bank.is_tracking_enabled(CH1).unwrap());
    }

    #[test]
    fn inhibit_refuses_output_enable() {
        let mut bank = bank();
        bank.set_inhibited(true);
        assert_eq!(
            bank.set_output_enabled(CH0, true),
            Err(Error::HardwareInhibited)
        );
        assert_eq!(bank.events().last().unwrap().id, EventId::OutputInhibited);

        bank.set_inhibited(false);
        bank.set_output_enabled(CH0, true).unwrap();
        assert!(bank.is_output_enabled(CH0).unwrap());
    }

    #[test]
    fn failed_module_is_excluded_until_it_recovers() {
        let mut bank = bank();
        bank.set_module_ok(CH0, false).unwrap();
        assert_eq!(bank.set_output_enabled(CH0, true), Err(Error::ChannelNotOk));
        assert_eq!(bank.initiate_trigger(CH0), Err(Error::ChannelNotOk));
        assert_eq!(
            bank.start_voltage_ramp(CH0, 5.0, 1.0),
            Err(Error::ChannelNotOk)
        );

        bank.set_module_ok(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();
    }

    #[test]
    fn staged_edits_only_apply_on_commit() {
        let mut bank = bank();
        bank.stage_voltage(CH0, 7.5).unwrap();
        assert_eq!(bank.u_set(CH0).unwrap(), 0.0);
        assert_eq!(bank.staged_voltage(CH0).unwrap(), Some(7.5));

        bank.commit_staged_voltage(CH0).unwrap();
        assert_eq!(bank.u_set(CH0).unwrap(), 7.5);
        assert_eq!(bank.staged_voltage(CH0).unwrap(), None);
    }

    #[test]
    fn snapshot_generation_advances_once_per_tick() {
        let mut bank = bank();
        let initial = bank.status_generation();
        ticks(&mut bank, 3);
        assert_eq!(bank.status_generation(), initial + 3);

        bank.set_voltage(CH0, 2.0).unwrap();
        // Snapshots only move on tick boundaries.
        assert_eq!(bank.status_snapshot().channels[0].unwrap().u_set, 0.0);
        bank.tick();
        assert_eq!(bank.status_snapshot().channels[0].unwrap().u_set, 2.0);
    }

    #[test]
    fn runtime_settings_apply_to_the_bank() {
        let mut bank = bank();
        let settings = crate::settings::RuntimeSettings {
            telemetry_period: 10,
            output_protection_coupled: true,
            shutdown_when_protection_tripped: false,
        };
        bank.apply_runtime_settings(&settings);

        bank.set_ovp_level(CH0, 10.0).unwrap();
        bank.set_ovp_delay(CH0, 0.0).unwrap();
        bank.set_ovp_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH0, true).unwrap();
        bank.set_output_enabled(CH2, true).unwrap();
        feed_voltage(&mut bank, CH0, 15.0);
        bank.tick();
        assert!(!bank.is_output_enabled(CH2).unwrap());
    }

    #[test]
    fn channel_config_round_trips_through_the_command_api() {
        let mut bank = bank();
        let params = ChannelParams::cv_cc_40v_5a();
        let mut config = crate::settings::ChannelConfig::from_params(&params);
        config.voltage = 12.0;
        config.current = 2.0;
        config.ovp_enabled = true;
        config.ovp_level = 15.0;

        bank.apply_channel_config(CH0, &config).unwrap();
        assert_eq!(bank.u_set(CH0).unwrap(), 12.0);
        assert_eq!(bank.i_set(CH0).unwrap(), 2.0);
        assert_eq!(
            bank.protection_state(CH0, ProtectionKind::OverVoltage).unwrap(),
            ProtectionState::Normal
        );

        config.voltage = 99.0;
        assert_eq!(
            bank.apply_channel_config(CH0, &config),
            Err(Error::DataOutOfRange)
        );
    }
}
