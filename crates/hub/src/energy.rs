//! Integration of instantaneous power into energy.
//!
//! Each message contributes `power * dt` for the interval since the previous
//! message.  Intervals at or beyond [`MAX_INTEGRATION_GAP_HOURS`] contribute
//! nothing: a gap that long means the link dropped or the process just
//! started, and the last known power says nothing about what happened in
//! between.

/// Outlier guard: the longest interval (6 minutes) that is integrated.
pub const MAX_INTEGRATION_GAP_HOURS: f64 = 0.1;

const SECS_PER_HOUR: f64 = 3600.0;
const WATTS_PER_KILOWATT: f64 = 1000.0;

/// Energy in kWh for `power_w` held between two unix timestamps, or `None`
/// when the interval is rejected by the outlier guard (too long, or the
/// clock went backwards).  Negative power readings count as zero, so the
/// totals never decrease.
pub fn energy_increment_kwh(previous_ts: f64, now_ts: f64, power_w: f64) -> Option<f64> {
    let dt_hours = (now_ts - previous_ts) / SECS_PER_HOUR;
    if !(0.0..MAX_INTEGRATION_GAP_HOURS).contains(&dt_hours) {
        return None;
    }
    Some(power_w.max(0.0) * dt_hours / WATTS_PER_KILOWATT)
}

/// Running session total plus the timestamp of the previous message.
///
/// Owned by the ingestion task alone; messages are processed strictly one
/// at a time so `previous_ts` needs no lock.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    previous_ts: f64,
    session_kwh: f64,
}

impl EnergyAccumulator {
    pub fn new(start_ts: f64) -> Self {
        Self {
            previous_ts: start_ts,
            session_kwh: 0.0,
        }
    }

    /// Integrate one message.  `previous_ts` always advances to `now_ts`,
    /// whether or not the interval was accepted, so one missed window costs
    /// at most one interval.
    pub fn accumulate(&mut self, now_ts: f64, power_w: f64) -> Option<f64> {
        let increment = energy_increment_kwh(self.previous_ts, now_ts, power_w);
        self.previous_ts = now_ts;
        if let Some(kwh) = increment {
            self.session_kwh += kwh;
        }
        increment
    }

    pub fn session_kwh(&self) -> f64 {
        self.session_kwh
    }

    pub fn previous_ts(&self) -> f64 {
        self.previous_ts
    }
}

// ===========================================================================
// Tests
// ===========================================================================
