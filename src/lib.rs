//! Channel control core for a modular multi-channel bench power supply.
//!
//! This crate owns the safety-relevant control state of the instrument:
//! per-channel operating mode and setpoints, four independent
//! over-protection state machines per channel (OVP/OCP/OPP/OTP), a
//! trigger-and-list sequencing engine, a bounded-time ramp engine, and a
//! coupling manager that makes two channels behave as one electrical unit.
//!
//! The hardware boundary is deliberately narrow: ADC samples are fed in by
//! the acquisition layer, setpoints are observable state for the DAC layer,
//! and all timing is expressed against a control clock advanced once per
//! tick by the owner. Display rendering, SCPI parsing, networking and
//! persistence live outside this crate and consume the [`PowerChannels`]
//! command/query API.

#![cfg_attr(not(test), no_std)]

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};

pub mod channel;
pub mod channels;
pub mod coupling;
pub mod error;
pub mod event_log;
pub mod linear_transformation;
pub mod list;
pub mod protection;
pub mod ramp;
pub mod scheduler;
pub mod settings;
pub mod snapshot;
pub mod telemetry;
pub mod trigger;

pub use channel::{AdcSample, ChannelParams, CurrentRangeSelectionMode, Mode};
pub use channels::{ChannelStatus, PowerChannels, SystemStatus};
pub use coupling::CouplingType;
pub use error::{Error, Result};
pub use list::ListStep;
pub use protection::{ProtectionKind, ProtectionState};
pub use trigger::{TriggerMode, TriggerOnListStop, TriggerPin, TriggerSource, TriggerState};

/// Number of channel slots in the chassis.
pub const CHANNEL_COUNT: usize = 6;

/// Indicates one power channel.
#[derive(Sequence, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelId {
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
    Five = 5,
}

impl ChannelId {
    pub fn from_index(index: usize) -> Option<Self> {
        enum_iterator::all::<Self>().nth(index)
    }
}
