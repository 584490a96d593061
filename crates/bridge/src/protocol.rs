use tracing::warn;

// ---------------------------------------------------------------------------
// Inbound device lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundEvent {
    TemperatureReading(i64),
    IlluminationReading(i64),
    MotionDetected,
    MotionNotify,
    SecurityOn,
    SecurityOff,
    LightsAuto,
    /// `lights:on` or `lights:off`; either ends automatic lighting.
    LightsManual,
    EmergencyOn,
    Unrecognized(String),
}

/// Parse one line of device output. Matching is by prefix and case-sensitive.
/// A reading whose value is not an integer comes back as `Unrecognized`.
pub(crate) fn parse_line(raw: &str) -> InboundEvent {
    let line = raw.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix("temperature:") {
        return match parse_value(rest) {
            Some(v) => InboundEvent::TemperatureReading(v),
            None => malformed(line),
        };
    }
    if let Some(rest) = line.strip_prefix("illumination:") {
        return match parse_value(rest) {
            Some(v) => InboundEvent::IlluminationReading(v),
            None => malformed(line),
        };
    }

    if line.starts_with("motion:detected") {
        InboundEvent::MotionDetected
    } else if line.starts_with("motion:notify") {
        InboundEvent::MotionNotify
    } else if line.starts_with("security:on") {
        InboundEvent::SecurityOn
    } else if line.starts_with("security:off") {
        InboundEvent::SecurityOff
    } else if line.starts_with("lights:auto") {
        InboundEvent::LightsAuto
    } else if line.starts_with("lights:on") || line.starts_with("lights:off") {
        InboundEvent::LightsManual
    } else if line.starts_with("emergency:on") {
        InboundEvent::EmergencyOn
    } else {
        InboundEvent::Unrecognized(line.to_string())
    }
}

fn parse_value(s: &str) -> Option<i64> {
    s.trim().parse().ok()
}

fn malformed(line: &str) -> InboundEvent {
    warn!(line = %line, "device: reading value is not an integer, keeping last value");
    InboundEvent::Unrecognized(line.to_string())
}

// ---------------------------------------------------------------------------
// Email commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundCommand {
    SendReport,
    EmergencyOff,
    ThermostatAuto,
    ThermostatHeating,
    ThermostatCooling,
    ThermostatOff,
    LightsAuto,
    LightsOn,
    LightsOff,
    SecurityOn,
    SecurityOff,
}

impl OutboundCommand {
    /// Every recognised command category, in polling order.
    pub(crate) const ALL: [OutboundCommand; 11] = [
        OutboundCommand::SendReport,
        OutboundCommand::EmergencyOff,
        OutboundCommand::ThermostatAuto,
        OutboundCommand::ThermostatHeating,
        OutboundCommand::ThermostatCooling,
        OutboundCommand::ThermostatOff,
        OutboundCommand::LightsAuto,
        OutboundCommand::LightsOn,
        OutboundCommand::LightsOff,
        OutboundCommand::SecurityOn,
        OutboundCommand::SecurityOff,
    ];

    /// Subject substring that selects this command in the inbox.
    pub(crate) fn subject(self) -> &'static str {
        match self {
            OutboundCommand::SendReport => "SEND REPORT",
            OutboundCommand::EmergencyOff => "SET EMERGENCY OFF",
            OutboundCommand::ThermostatAuto => "SET THERMOSTAT AUTO",
            OutboundCommand::ThermostatHeating => "SET THERMOSTAT HEATING",
            OutboundCommand::ThermostatCooling => "SET THERMOSTAT COOLING",
            OutboundCommand::ThermostatOff => "SET THERMOSTAT OFF",
            OutboundCommand::LightsAuto => "SET LIGHTS AUTO",
            OutboundCommand::LightsOn => "SET LIGHTS ON",
            OutboundCommand::LightsOff => "SET LIGHTS OFF",
            OutboundCommand::SecurityOn => "SET HOME SECURITY ON",
            OutboundCommand::SecurityOff => "SET HOME SECURITY OFF",
        }
    }

    /// Line written to the device, or `None` for commands handled locally.
    pub(crate) fn device_token(self) -> Option<&'static str> {
        match self {
            OutboundCommand::SendReport => None,
            OutboundCommand::EmergencyOff => Some("emergency:off"),
            OutboundCommand::ThermostatAuto => Some("thermostat:auto"),
            OutboundCommand::ThermostatHeating => Some("thermostat:heating"),
            OutboundCommand::ThermostatCooling => Some("thermostat:cooling"),
            OutboundCommand::ThermostatOff => Some("thermostat:off"),
            OutboundCommand::LightsAuto => Some("lights:auto"),
            OutboundCommand::LightsOn => Some("lights:on"),
            OutboundCommand::LightsOff => Some("lights:off"),
            OutboundCommand::SecurityOn => Some("security:on"),
            OutboundCommand::SecurityOff => Some("security:off"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
