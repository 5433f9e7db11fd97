//! Error type definitions for the channel control core.

/// An enumeration of command failures reported to callers.
///
/// Commands return errors, they never panic; a rejected command leaves all
/// channel state unchanged. Protection trips are deliberately not errors:
/// they are durable state surfaced through the trip queries and the event
/// log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Error {
    /// Value outside the absolute hardware range of the module.
    DataOutOfRange,
    /// Value within hardware range but beyond the user-configured voltage limit.
    VoltageLimitExceeded,
    /// Value within hardware range but beyond the user-configured current limit.
    CurrentLimitExceeded,
    /// The combined V x I product exceeds the configured power limit.
    PowerLimitExceeded,
    /// Requested coupling topology failed validation.
    CouplingNotAllowed,
    /// Independent command addressed to the slave of an active coupling.
    CouplingViolation,
    /// The channel failed module self-test or no module is installed.
    ChannelNotOk,
    /// Output enable refused while the external inhibit input is active.
    HardwareInhibited,
    /// Trigger event with no matching armed engine.
    TriggerIgnored,
    /// List-mode initiate with an empty list program.
    ListEmpty,
    /// Command is not meaningful in the current state.
    InvalidState,
    /// Feature not installed in this build.
    NotSupported,
}

pub type Result<T> = core::result::Result<T, Error>;
