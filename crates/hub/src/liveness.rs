//! Presentation-layer offline clamp for the live read path.

use crate::telemetry::{Reading, Status};

/// Default seconds without telemetry before the served reading goes offline.
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: f64 = 5.0;

/// The reading to serve at `now`.  When nothing has arrived for longer than
/// `timeout_secs` the status is forced to `OFFLINE` and the electrical values
/// are zeroed.  Only the served copy changes; persisted rows keep the values
/// that were actually received, and no event is logged.
pub fn served_reading(last: &Reading, now: f64, timeout_secs: f64) -> Reading {
    if now - last.timestamp > timeout_secs {
        Reading {
            status: Status::Offline,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            ..last.clone()
        }
    } else {
        last.clone()
    }
}
