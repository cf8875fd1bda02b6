use serde::{de, Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::{Error, Result};

/// Status text reported when the sender omits the field.
const UNKNOWN_STATUS: &str = "UNKNOWN";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Device status, decoded once at ingestion so downstream logic matches on
/// the tag instead of searching strings.  Labels other than `OK` and
/// `OFFLINE` keep the text exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// `"OK"`, exactly.
    Normal,
    /// Anything containing `"FAULT"`, e.g. `"FAULT: OC"` or `"RELAY FAULT"`.
    Fault(String),
    /// `"OFFLINE"`, exactly.
    Offline,
    /// Any other label (`"IDLE"`, classifier labels, missing status).
    Unknown(String),
}

impl Status {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "OK" => Self::Normal,
            "OFFLINE" => Self::Offline,
            s if s.contains("FAULT") => Self::Fault(s.to_string()),
            s => Self::Unknown(s.to_string()),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// The fault reason: the text after `"FAULT:"` when the label has that
    /// shape, `""` for a bare `"FAULT"`, otherwise the whole label.
    pub fn fault_reason(&self) -> Option<&str> {
        let Self::Fault(label) = self else {
            return None;
        };
        let reason = match label.strip_prefix("FAULT:") {
            Some(rest) => rest.trim(),
            None if label == "FAULT" => "",
            None => label.trim(),
        };
        Some(reason)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "OK"),
            Self::Offline => write!(f, "OFFLINE"),
            Self::Fault(label) | Self::Unknown(label) => write!(f, "{label}"),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One decoded telemetry sample.  `timestamp` is the arrival time in unix
/// seconds; the sender does not stamp its payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub status: Status,
}

impl Reading {
    /// The zeroed reading served before any telemetry has arrived.
    pub fn offline(timestamp: f64) -> Self {
        Self {
            timestamp,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            status: Status::Offline,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    #[serde(default)]
    pub(crate) voltage: f64,
    #[serde(default)]
    pub(crate) current: f64,
    #[serde(default)]
    pub(crate) power: f64,
    #[serde(default)]
    pub(crate) status: Option<String>,
}

/// Decode a raw payload received at `timestamp`.
///
/// Missing numeric fields read as `0`, a missing status as `UNKNOWN`.
/// Non-JSON payloads, non-object JSON and non-numeric values are errors.
pub fn decode(payload: &[u8], timestamp: f64) -> Result<Reading> {
    // Derived struct impls also accept arrays; the device only sends objects.
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(Error::Decode(de::Error::custom(
            "telemetry payload is not a JSON object",
        )));
    }
    let msg: TelemetryMsg = serde_json::from_value(value)?;
    let status = match msg.status {
        Some(s) => Status::parse(&s),
        None => Status::Unknown(UNKNOWN_STATUS.to_string()),
    };
    Ok(Reading {
        timestamp,
        voltage: msg.voltage,
        current: msg.current,
        power: msg.power,
        status,
    })
}

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ===========================================================================
// Tests
// ===========================================================================
