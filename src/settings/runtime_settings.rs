//! Instrument-wide runtime settings.

use miniconf::Tree;

use crate::telemetry::DEFAULT_TELEMETRY_PERIOD_SECS;

#[derive(Clone, Copy, Debug, PartialEq, Tree)]
pub struct RuntimeSettings {
    /// The configured telemetry period in seconds.
    pub telemetry_period: u64,

    /// Whether one channel's protection trip forces all channel outputs
    /// off.
    pub output_protection_coupled: bool,

    /// Whether a protection trip drives the whole instrument into standby.
    pub shutdown_when_protection_tripped: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            telemetry_period: DEFAULT_TELEMETRY_PERIOD_SECS,
            output_protection_coupled: false,
            shutdown_when_protection_tripped: false,
        }
    }
}

impl RuntimeSettings {
    pub fn handle_update(
        _path: &str,
        settings: &mut Self,
        new_settings: &Self,
    ) -> Result<(), &'static str> {
        if new_settings.telemetry_period == 0 {
            return Err("Telemetry period must be nonzero");
        }

        *settings = *new_settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_validates_the_telemetry_period() {
        let mut settings = RuntimeSettings::default();
        let invalid = RuntimeSettings {
            telemetry_period: 0,
            ..settings
        };
        assert!(RuntimeSettings::handle_update("", &mut settings, &invalid).is_err());
        assert_eq!(settings.telemetry_period, DEFAULT_TELEMETRY_PERIOD_SECS);

        let valid = RuntimeSettings {
            telemetry_period: 30,
            output_protection_coupled: true,
            ..settings
        };
        RuntimeSettings::handle_update("", &mut settings, &valid).unwrap();
        assert_eq!(settings.telemetry_period, 30);
        assert!(settings.output_protection_coupled);
    }
}
