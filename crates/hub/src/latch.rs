//! Fault latch: edge-triggers one alert per fault episode.
//!
//! ```text
//! Normal ──[status is Fault]──▶ Faulted ──[status is exactly OK]──▶ Normal
//!                                  │  ▲
//!                                  └──┘ Fault / Offline / Unknown: no change
//! ```
//!
//! Only `OK` clears the latch.  A device that trips and then reports
//! `OFFLINE` stays latched, so a fault that takes the device down is not
//! treated as cleared.

use crate::telemetry::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatchState {
    #[default]
    Normal,
    Faulted,
}

/// What observing one status did to the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Normal → Faulted: dispatch exactly one alert.
    Tripped,
    /// Faulted → Normal: the next fault alerts again.
    Cleared,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct FaultLatch {
    state: LatchState,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, status: &Status) -> Transition {
        match (self.state, status) {
            (LatchState::Normal, Status::Fault(_)) => {
                self.state = LatchState::Faulted;
                Transition::Tripped
            }
            (LatchState::Faulted, Status::Normal) => {
                self.state = LatchState::Normal;
                Transition::Cleared
            }
            _ => Transition::Unchanged,
        }
    }

    pub fn state(&self) -> LatchState {
        self.state
    }

    /// True while an alert has been sent for the current episode.
    pub fn alert_sent(&self) -> bool {
        self.state == LatchState::Faulted
    }
}

// ===========================================================================
// Tests
// ===========================================================================
