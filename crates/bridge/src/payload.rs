use serde::Deserialize;

use crate::db::SensorKind;

// ---------------------------------------------------------------------------
// Inbound message types
// ---------------------------------------------------------------------------

/// JSON envelope published by the LoRa gateway on the telemetry topic.
/// Unknown extra fields (RSSI, frame counters, ...) are ignored.
#[derive(Debug, Deserialize)]
pub struct TelemetryEnvelope {
    pub source: String,
    pub data: String,
}

// ---------------------------------------------------------------------------
// Free-text reading parser
// ---------------------------------------------------------------------------

/// A quantity a device can embed in the free-text body of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    Flow,
    Pressure,
    /// Cumulative delivered volume; a property of the flow channel, not a
    /// distinct sensor kind.
    TotalDelivered,
    Level,
}

impl ReadingKind {
    /// The registered sensor kind this reading is recorded against.
    pub fn sensor_kind(&self) -> SensorKind {
        match self {
            ReadingKind::Flow | ReadingKind::TotalDelivered => SensorKind::Flow,
            ReadingKind::Pressure => SensorKind::Pressure,
            ReadingKind::Level => SensorKind::Level,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReadingKind::Flow => "flow",
            ReadingKind::Pressure => "pressure",
            ReadingKind::TotalDelivered => "total-delivered",
            ReadingKind::Level => "level",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: ReadingKind,
    pub value: f64,
}

/// Textual markers the devices emit, in the order readings are applied.
/// `TotalDelivered:` must stay after `Flow:` so that when both appear the
/// flow channel ends up holding the cumulative volume.
const MARKERS: &[(&str, ReadingKind)] = &[
    ("Flow:", ReadingKind::Flow),
    ("Pressure:", ReadingKind::Pressure),
    ("TotalDelivered:", ReadingKind::TotalDelivered),
    ("WaterLevel:", ReadingKind::Level),
];

/// Extract every recognized reading from a free-text body.
///
/// Each marker is independently optional; a body with no markers yields an
/// empty vec, which is not an error. Unit text after the number is ignored,
/// and a marker whose value does not parse is skipped.
pub fn parse_readings(body: &str) -> Vec<Reading> {
    let mut readings = Vec::new();
    for (marker, kind) in MARKERS {
        if let Some(at) = body.find(marker) {
            let rest = &body[at + marker.len()..];
            if let Some(value) = leading_float(rest) {
                readings.push(Reading { kind: *kind, value });
            }
        }
    }
    readings
}

/// Parse the first float token in `s`, ignoring leading whitespace and
/// anything after the number ("12.5 L/min" -> 12.5, "-3.2 psi" -> -3.2).
fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || "+-.eE".contains(c)))
        .unwrap_or(s.len());
    // Trailing 'e'/'.'/sign chars can leave a non-numeric tail ("3.2e" from
    // "3.2eV"); shrink until the token parses.
    let mut token = &s[..end];
    while !token.is_empty() {
        if let Ok(v) = token.parse::<f64>() {
            return Some(v);
        }
        token = &token[..token.len() - 1];
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(readings: &[Reading]) -> Vec<ReadingKind> {
        readings.iter().map(|r| r.kind).collect()
    }

    // -- parse_readings: single markers -----------------------------------

    #[test]
    fn parse_flow() {
        let r = parse_readings("Flow: 12.5 L/min");
        assert_eq!(r, vec![Reading { kind: ReadingKind::Flow, value: 12.5 }]);
    }

    #[test]
    fn parse_pressure_negative() {
        let r = parse_readings("Pressure: -3.2 psi");
        assert_eq!(
            r,
            vec![Reading { kind: ReadingKind::Pressure, value: -3.2 }]
        );
    }

    #[test]
    fn parse_total_delivered() {
        let r = parse_readings("TotalDelivered: 340.0 L");
        assert_eq!(
            r,
            vec![Reading { kind: ReadingKind::TotalDelivered, value: 340.0 }]
        );
    }

    #[test]
    fn parse_water_level() {
        let r = parse_readings("WaterLevel: 3.4 m");
        assert_eq!(r, vec![Reading { kind: ReadingKind::Level, value: 3.4 }]);
    }

    // -- parse_readings: combinations -------------------------------------

    #[test]
    fn parse_full_message_preserves_marker_order() {
        let r = parse_readings("Flow: 12.5 L/min Pressure: 2.1 psi TotalDelivered: 340.0 L");
        assert_eq!(
            kinds(&r),
            vec![
                ReadingKind::Flow,
                ReadingKind::Pressure,
                ReadingKind::TotalDelivered
            ]
        );
        assert_eq!(r[0].value, 12.5);
        assert_eq!(r[1].value, 2.1);
        assert_eq!(r[2].value, 340.0);
    }

    #[test]
    fn parse_markers_in_any_body_order() {
        // Output order follows the marker table, not the body.
        let r = parse_readings("TotalDelivered: 340.0 L Flow: 12.5 L/min");
        assert_eq!(
            kinds(&r),
            vec![ReadingKind::Flow, ReadingKind::TotalDelivered]
        );
    }

    #[test]
    fn parse_no_markers_returns_empty() {
        assert!(parse_readings("battery low, rssi -97").is_empty());
        assert!(parse_readings("").is_empty());
    }

    #[test]
    fn parse_marker_without_number_is_skipped() {
        let r = parse_readings("Flow: n/a Pressure: 2.1 psi");
        assert_eq!(
            r,
            vec![Reading { kind: ReadingKind::Pressure, value: 2.1 }]
        );
    }

    #[test]
    fn parse_markers_are_case_sensitive() {
        assert!(parse_readings("flow: 12.5").is_empty());
    }

    // -- leading_float -----------------------------------------------------

    #[test]
    fn leading_float_plain() {
        assert_eq!(leading_float("12.5 L/min"), Some(12.5));
    }

    #[test]
    fn leading_float_no_space_before_unit() {
        assert_eq!(leading_float("12.5L/min"), Some(12.5));
    }

    #[test]
    fn leading_float_signed() {
        assert_eq!(leading_float("-3.2 psi"), Some(-3.2));
        assert_eq!(leading_float("+7 psi"), Some(7.0));
    }

    #[test]
    fn leading_float_scientific() {
        assert_eq!(leading_float("1.2e3"), Some(1200.0));
    }

    #[test]
    fn leading_float_trailing_exponent_char() {
        // 'e' belongs to the token set but "3.2e" alone does not parse.
        assert_eq!(leading_float("3.2eV"), Some(3.2));
    }

    #[test]
    fn leading_float_garbage() {
        assert_eq!(leading_float("n/a"), None);
        assert_eq!(leading_float(""), None);
    }

    // -- reading kind mapping ----------------------------------------------

    #[test]
    fn total_delivered_targets_flow_sensors() {
        assert_eq!(
            ReadingKind::TotalDelivered.sensor_kind(),
            SensorKind::Flow
        );
    }

    // -- TelemetryEnvelope deserialization ---------------------------------

    #[test]
    fn envelope_deserialize_valid() {
        let json = r#"{"source":"LORA1","data":"Flow: 12.5 L/min"}"#;
        let env: TelemetryEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.source, "LORA1");
        assert_eq!(env.data, "Flow: 12.5 L/min");
    }

    #[test]
    fn envelope_deserialize_extra_fields_ignored() {
        let json = r#"{"source":"LORA1","data":"","rssi":-97,"fcnt":12}"#;
        let env: TelemetryEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.source, "LORA1");
    }

    #[test]
    fn envelope_deserialize_missing_field_fails() {
        let json = r#"{"source":"LORA1"}"#;
        assert!(serde_json::from_str::<TelemetryEnvelope>(json).is_err());
    }
}
