//! Instrument settings trees.
//!
//! Settings are plain data validated before application; applying them
//! funnels through the same command API external callers use, so no
//! configuration path can bypass validation.

pub mod channel_settings;
pub mod runtime_settings;

pub use channel_settings::ChannelConfig;
pub use runtime_settings::RuntimeSettings;
