//! Cross-channel coupling and tracking.
//!
//! Series and parallel coupling bind channels 0 and 1 into one electrical
//! unit: commands address the master (channel 0) and fan out with the
//! topology's value split, while independent writes to the slave are
//! rejected. Common-ground and split-rails are purely topological (relay
//! routing) and do not redirect setpoints. Tracking is a looser mirroring
//! across any set of channels and is mutually exclusive with coupling on
//! the same channel.

use enum_iterator::all;

use crate::channel::ChannelArray;
use crate::error::{Error, Result};
use crate::protection::ProtectionKind;
use crate::{ChannelId, CHANNEL_COUNT};

/// Active coupling topology. At most one is active system-wide.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum CouplingType {
    #[default]
    None,
    Parallel,
    Series,
    CommonGround,
    SplitRails,
}

/// Per-channel values produced by fanning one command out to the members
/// it affects.
pub(crate) type Fanout = heapless::Vec<(ChannelId, f32), CHANNEL_COUNT>;

/// A set of channels acting together.
pub(crate) type Members = heapless::Vec<ChannelId, CHANNEL_COUNT>;

/// Validate that `kind` may be activated on the installed channels.
pub(crate) fn validate_coupling(kind: CouplingType, channels: &ChannelArray) -> Result<()> {
    if kind == CouplingType::None {
        return Ok(());
    }

    let (first, second) = match (&channels[0], &channels[1]) {
        (Some(first), Some(second)) => (first, second),
        _ => return Err(Error::CouplingNotAllowed),
    };

    if !first.is_ok() || !second.is_ok() {
        return Err(Error::ChannelNotOk);
    }

    if matches!(kind, CouplingType::Series | CouplingType::Parallel)
        && !(first.params().features.coupling && second.params().features.coupling)
    {
        return Err(Error::CouplingNotAllowed);
    }

    Ok(())
}

/// Owns the active topology and the routing rules it implies.
#[derive(Debug, Copy, Clone, Default)]
pub struct CouplingManager {
    kind: CouplingType,
}

impl CouplingManager {
    pub fn kind(&self) -> CouplingType {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: CouplingType) {
        self.kind = kind;
    }

    /// Whether any topology is active and `ch` is one of its members.
    pub(crate) fn is_member(&self, ch: ChannelId) -> bool {
        self.kind != CouplingType::None && (ch as usize) < 2
    }

    /// Whether `ch` is a member of a setpoint-redirecting topology.
    pub(crate) fn is_redirected_member(&self, ch: ChannelId) -> bool {
        matches!(self.kind, CouplingType::Series | CouplingType::Parallel) && (ch as usize) < 2
    }

    /// The slave of an active series/parallel pair refuses independent
    /// setpoint commands.
    pub(crate) fn is_slave(&self, ch: ChannelId) -> bool {
        self.is_redirected_member(ch) && ch == ChannelId::One
    }

    fn pair(value_first: f32, value_second: f32) -> Fanout {
        let mut fanout = Fanout::new();
        fanout.push((ChannelId::Zero, value_first)).ok();
        fanout.push((ChannelId::One, value_second)).ok();
        fanout
    }

    fn single(ch: ChannelId, value: f32) -> Fanout {
        let mut fanout = Fanout::new();
        fanout.push((ch, value)).ok();
        fanout
    }

    /// Fan a voltage setpoint out to the channels it lands on.
    pub(crate) fn route_voltage(&self, ch: ChannelId, voltage: f32) -> Result<Fanout> {
        if self.is_slave(ch) {
            return Err(Error::CouplingViolation);
        }

        Ok(match self.kind {
            CouplingType::Series if self.is_member(ch) => {
                Self::pair(voltage / 2.0, voltage / 2.0)
            }
            CouplingType::Parallel if self.is_member(ch) => Self::pair(voltage, voltage),
            _ => Self::single(ch, voltage),
        })
    }

    pub(crate) fn route_current(&self, ch: ChannelId, current: f32) -> Result<Fanout> {
        if self.is_slave(ch) {
            return Err(Error::CouplingViolation);
        }

        Ok(match self.kind {
            CouplingType::Series if self.is_member(ch) => Self::pair(current, current),
            CouplingType::Parallel if self.is_member(ch) => {
                Self::pair(current / 2.0, current / 2.0)
            }
            _ => Self::single(ch, current),
        })
    }

    pub(crate) fn route_voltage_limit(&self, ch: ChannelId, limit: f32) -> Result<Fanout> {
        self.route_voltage(ch, limit)
    }

    pub(crate) fn route_current_limit(&self, ch: ChannelId, limit: f32) -> Result<Fanout> {
        self.route_current(ch, limit)
    }

    pub(crate) fn route_power_limit(&self, ch: ChannelId, limit: f32) -> Result<Fanout> {
        if self.is_slave(ch) {
            return Err(Error::CouplingViolation);
        }

        Ok(if self.is_redirected_member(ch) {
            Self::pair(limit / 2.0, limit / 2.0)
        } else {
            Self::single(ch, limit)
        })
    }

    /// Fan a protection level out. The per-member value follows how the
    /// protected quantity divides across the topology.
    pub(crate) fn route_protection_level(
        &self,
        kind: ProtectionKind,
        ch: ChannelId,
        level: f32,
    ) -> Result<Fanout> {
        if self.is_slave(ch) {
            return Err(Error::CouplingViolation);
        }

        if !self.is_redirected_member(ch) {
            return Ok(Self::single(ch, level));
        }

        let halved = match (self.kind, kind) {
            (CouplingType::Series, ProtectionKind::OverVoltage) => true,
            (CouplingType::Parallel, ProtectionKind::OverCurrent) => true,
            (_, ProtectionKind::OverPower) => true,
            _ => false,
        };

        let member = if halved { level / 2.0 } else { level };
        Ok(Self::pair(member, member))
    }

    /// Channels whose output stage toggles together with `ch`.
    pub(crate) fn output_group(&self, ch: ChannelId) -> Members {
        let mut group = Members::new();
        if self.is_member(ch) {
            group.push(ChannelId::Zero).ok();
            group.push(ChannelId::One).ok();
        } else {
            group.push(ch).ok();
        }
        group
    }

    fn members<'a>(&self, channels: &'a ChannelArray) -> Option<(&'a crate::channel::Channel, &'a crate::channel::Channel)> {
        match (&channels[0], &channels[1]) {
            (Some(first), Some(second)) => Some((first, second)),
            _ => None,
        }
    }

    /// Voltage setpoint as seen by the caller: the series sum across the
    /// pair, otherwise the channel's own value.
    pub(crate) fn u_set_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.u_set());
        if self.kind == CouplingType::Series && self.is_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.u_set() + b.u_set())
        } else {
            own
        }
    }

    pub(crate) fn u_mon_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.u_mon());
        if self.kind == CouplingType::Series && self.is_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.u_mon() + b.u_mon())
        } else {
            own
        }
    }

    pub(crate) fn i_set_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.i_set());
        if self.kind == CouplingType::Parallel && self.is_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.i_set() + b.i_set())
        } else {
            own
        }
    }

    pub(crate) fn i_mon_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.i_mon());
        if self.kind == CouplingType::Parallel && self.is_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.i_mon() + b.i_mon())
        } else {
            own
        }
    }

    pub(crate) fn p_mon_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.p_mon());
        if self.is_redirected_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.p_mon() + b.p_mon())
        } else {
            own
        }
    }

    fn tracking_fold(
        ch: ChannelId,
        channels: &ChannelArray,
        own: f32,
        accessor: impl Fn(&crate::channel::Channel) -> f32,
        fold: impl Fn(f32, f32) -> f32,
    ) -> f32 {
        let mut value = own;
        for id in all::<ChannelId>() {
            if id == ch {
                continue;
            }
            if let Some(other) = channels[id as usize].as_ref() {
                if other.flags.tracking_enabled {
                    value = fold(value, accessor(other));
                }
            }
        }
        value
    }

    pub(crate) fn u_min_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize]
            .as_ref()
            .map_or(0.0, |c| c.params().u_min);
        match self.kind {
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.params().u_min.max(b.params().u_min)),
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.params().u_min.max(b.params().u_min)),
            _ if self.is_tracked(ch, channels) => {
                Self::tracking_fold(ch, channels, own, |c| c.params().u_min, f32::max)
            }
            _ => own,
        }
    }

    pub(crate) fn u_max_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize]
            .as_ref()
            .map_or(0.0, |c| c.params().u_max);
        match self.kind {
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.params().u_max.min(b.params().u_max)),
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.params().u_max.min(b.params().u_max)),
            _ if self.is_tracked(ch, channels) => {
                Self::tracking_fold(ch, channels, own, |c| c.params().u_max, f32::min)
            }
            _ => own,
        }
    }

    pub(crate) fn i_min_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize]
            .as_ref()
            .map_or(0.0, |c| c.params().i_min);
        match self.kind {
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.params().i_min.max(b.params().i_min)),
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.params().i_min.max(b.params().i_min)),
            _ if self.is_tracked(ch, channels) => {
                Self::tracking_fold(ch, channels, own, |c| c.params().i_min, f32::max)
            }
            _ => own,
        }
    }

    pub(crate) fn i_max_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize]
            .as_ref()
            .map_or(0.0, |c| c.params().i_max);
        match self.kind {
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.params().i_max.min(b.params().i_max)),
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.params().i_max.min(b.params().i_max)),
            _ if self.is_tracked(ch, channels) => {
                Self::tracking_fold(ch, channels, own, |c| c.params().i_max, f32::min)
            }
            _ => own,
        }
    }

    pub(crate) fn u_limit_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.u_limit());
        match self.kind {
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.u_limit().min(b.u_limit())),
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.u_limit().min(b.u_limit())),
            _ => own,
        }
    }

    pub(crate) fn i_limit_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize].as_ref().map_or(0.0, |c| c.i_limit());
        match self.kind {
            CouplingType::Parallel if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| 2.0 * a.i_limit().min(b.i_limit())),
            CouplingType::Series if self.is_member(ch) => self
                .members(channels)
                .map_or(own, |(a, b)| a.i_limit().min(b.i_limit())),
            _ => own,
        }
    }

    pub(crate) fn power_limit_of(&self, ch: ChannelId, channels: &ChannelArray) -> f32 {
        let own = channels[ch as usize]
            .as_ref()
            .map_or(0.0, |c| c.power_limit());
        if self.is_redirected_member(ch) {
            self.members(channels)
                .map_or(own, |(a, b)| a.power_limit() + b.power_limit())
        } else {
            own
        }
    }

    fn is_tracked(&self, ch: ChannelId, channels: &ChannelArray) -> bool {
        channels[ch as usize]
            .as_ref()
            .map_or(false, |c| c.flags.tracking_enabled)
    }
}

/// Channels currently mirroring as a tracking group.
pub(crate) fn tracking_group(channels: &ChannelArray) -> Members {
    let mut group = Members::new();
    for id in all::<ChannelId>() {
        if let Some(channel) = channels[id as usize].as_ref() {
            if channel.flags.tracking_enabled {
                group.push(id).ok();
            }
        }
    }
    group
}
