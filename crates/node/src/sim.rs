//! Telemetry simulator for local development and demos.
//!
//! Produces the same JSON shape the metering device publishes:
//! `{"voltage", "current", "power", "status"}`.
//!
//! - `normal`: mains around 230 V with a light, safe load
//! - `overload`: current ramps until it trips the overcurrent limit, then
//!   starts over
//! - `spike`: a few normal samples, a short-circuit fault, then the
//!   protection cutting the supply

use serde::Serialize;
use std::fmt;

/// Overcurrent limit the device firmware trips at.
pub const OVERCURRENT_LIMIT_MA: u32 = 350;

const OVERLOAD_START_MA: u32 = 200;
const OVERLOAD_STEP_MA: u32 = 20;
const OVERLOAD_RESET_MA: u32 = 500;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profile selectable via the `SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Normal,
    Overload,
    Spike,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "overload" => Self::Overload,
            "spike" => Self::Spike,
            _ => Self::Normal, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Overload => write!(f, "overload"),
            Self::Spike => write!(f, "spike"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One telemetry message, rounded the way the device reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub status: String,
}

impl Sample {
    fn new(voltage: f64, current: f64, status: &str) -> Self {
        Self {
            voltage: round_to(voltage, 1),
            current: round_to(current, 3),
            power: round_to(voltage * current, 2),
            status: status.to_string(),
        }
    }
}

fn round_to(x: f64, places: i32) -> f64 {
    let scale = 10_f64.powi(places);
    (x * scale).round() / scale
}

fn uniform(lo: f64, hi: f64) -> f64 {
    lo + (hi - lo) * fastrand::f64()
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct PowerSim {
    scenario: Scenario,
    /// Overload ramp position, in milliamps.
    ramp_ma: u32,
    /// Position in the spike cycle.
    step: usize,
}

impl PowerSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            ramp_ma: OVERLOAD_START_MA,
            step: 0,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Produce the next message.
    pub fn next_sample(&mut self) -> Sample {
        match self.scenario {
            Scenario::Normal => normal_sample(),
            Scenario::Overload => self.overload_sample(),
            Scenario::Spike => self.spike_sample(),
        }
    }

    fn overload_sample(&mut self) -> Sample {
        self.ramp_ma += OVERLOAD_STEP_MA;
        let status = if self.ramp_ma > OVERCURRENT_LIMIT_MA {
            "FAULT: OC"
        } else {
            "OK"
        };
        let sample = Sample::new(uniform(228.0, 232.0), self.ramp_ma as f64 / 1000.0, status);
        if self.ramp_ma > OVERLOAD_RESET_MA {
            self.ramp_ma = OVERLOAD_START_MA;
        }
        sample
    }

    fn spike_sample(&mut self) -> Sample {
        let sample = match self.step {
            0..=2 => Sample::new(230.0, 0.15, "OK"),
            3 => Sample::new(240.0, 2.5, "FAULT: COMPONENT SHORT"),
            _ => Sample::new(0.0, 0.0, "OFFLINE"),
        };
        self.step = (self.step + 1) % 5;
        sample
    }
}

fn normal_sample() -> Sample {
    Sample::new(uniform(228.0, 232.0), 0.15 + uniform(0.01, 0.05), "OK")
}

// ===========================================================================
// Tests
// ===========================================================================
