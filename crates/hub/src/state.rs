use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::latch::{FaultLatch, Transition};
use crate::liveness::served_reading;
use crate::telemetry::Reading;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Handle shared by the ingestion task (the only writer) and the HTTP
/// handlers (readers).
pub type SharedState = Arc<RwLock<SystemState>>;

pub fn new_shared(default_label: &str) -> SharedState {
    Arc::new(RwLock::new(SystemState::new(default_label)))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Replaced wholesale on every message, never edited in place.
    pub snapshot: Arc<LiveSnapshot>,
    pub latch: FaultLatch,
    pub recording: Recording,
}

/// The most recent reading plus the session energy total at that moment.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub reading: Reading,
    pub session_kwh: f64,
}

#[derive(Debug, Clone)]
pub struct Recording {
    pub active: bool,
    pub label: String,
}

/// What a reader gets: the clamped reading and session total, copied out
/// under one read lock.
#[derive(Debug, Clone)]
pub struct LiveView {
    pub reading: Reading,
    pub session_kwh: f64,
    pub mqtt_connected: bool,
    pub recording: bool,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(default_label: &str) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            snapshot: Arc::new(LiveSnapshot {
                reading: Reading::offline(0.0),
                session_kwh: 0.0,
            }),
            latch: FaultLatch::new(),
            recording: Recording {
                active: false,
                label: default_label.to_string(),
            },
        }
    }

    /// Publish a new reading and run it through the fault latch.
    ///
    /// Returns the latch transition and, while recording is active, the
    /// label the reading should be recorded under.
    pub fn apply_reading(
        &mut self,
        reading: Reading,
        session_kwh: f64,
    ) -> (Transition, Option<String>) {
        let transition = self.latch.observe(&reading.status);
        self.snapshot = Arc::new(LiveSnapshot {
            reading,
            session_kwh,
        });
        let label = self
            .recording
            .active
            .then(|| self.recording.label.clone());
        (transition, label)
    }

    pub fn start_recording(&mut self, label: String) {
        self.recording = Recording {
            active: true,
            label,
        };
    }

    pub fn stop_recording(&mut self) {
        self.recording.active = false;
    }

    /// Build the reader view at `now`, with the offline clamp applied.
    pub fn live_view(&self, now: f64, offline_timeout_secs: f64) -> LiveView {
        LiveView {
            reading: served_reading(&self.snapshot.reading, now, offline_timeout_secs),
            session_kwh: self.snapshot.session_kwh,
            mqtt_connected: self.mqtt_connected,
            recording: self.recording.active,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
