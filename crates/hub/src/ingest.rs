//! Telemetry ingestion: the MQTT subscriber loop and the per-message
//! pipeline (decode → energy → fault latch → store).
//!
//! One task drives the pipeline, so messages are handled strictly one at a
//! time.  Errors are contained per message: a bad payload or a failed write
//! is logged and the loop moves on.  Alerts go through a channel to a
//! separate dispatcher task so a slow notifier never stalls ingestion.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use time::UtcOffset;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collab::{with_timeout, AlertNotifier};
use crate::config::Config;
use crate::db::{Db, LogLevel};
use crate::energy::EnergyAccumulator;
use crate::error::Result;
use crate::latch::Transition;
use crate::recording::Recorder;
use crate::state::SharedState;
use crate::telemetry::{self, unix_now, Reading};

/// Pending alerts beyond this are dropped (and logged).
const ALERT_QUEUE: usize = 16;

/// Pause after a broker error before polling again; rumqttc reconnects on
/// the next poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Result of one successfully decoded message.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub reading: Reading,
    /// `None` when the interval was rejected by the outlier guard.
    pub increment_kwh: Option<f64>,
    pub transition: Transition,
}

pub struct Pipeline {
    db: Db,
    shared: SharedState,
    accumulator: EnergyAccumulator,
    alerts: mpsc::Sender<Reading>,
    recorder: Recorder,
    utc_offset: UtcOffset,
}

impl Pipeline {
    pub fn new(
        db: Db,
        shared: SharedState,
        alerts: mpsc::Sender<Reading>,
        recorder: Recorder,
        utc_offset: UtcOffset,
        start_ts: f64,
    ) -> Self {
        Self {
            db,
            shared,
            accumulator: EnergyAccumulator::new(start_ts),
            alerts,
            recorder,
            utc_offset,
        }
    }

    /// Handle one payload received at `now`.  Only a decode failure is
    /// returned as an error; store failures are logged and the remaining
    /// steps still run.
    pub async fn handle(&mut self, payload: &[u8], now: f64) -> Result<Outcome> {
        let reading = telemetry::decode(payload, now)?;

        // ── Energy ─────────────────────────────────────────────────
        let increment_kwh = self.accumulator.accumulate(now, reading.power);
        if let Some(kwh) = increment_kwh {
            let day = Db::day_key(now, self.utc_offset);
            if let Err(e) = self.db.upsert_daily_energy(&day, kwh).await {
                error!(%day, kwh, "upsert_daily_energy failed: {e}");
            }
        } else {
            debug!(power = reading.power, "interval outside outlier guard, not integrated");
        }

        // ── Snapshot + fault latch (one write lock) ────────────────
        let (transition, label) = {
            let mut st = self.shared.write().await;
            st.apply_reading(reading.clone(), self.accumulator.session_kwh())
        };

        match transition {
            Transition::Tripped => {
                let msg = format!(
                    "Fault detected: {} at {:.1} W",
                    reading.status, reading.power
                );
                warn!(
                    reason = reading.status.fault_reason().unwrap_or_default(),
                    power = reading.power,
                    "fault latch tripped"
                );
                self.log_event(LogLevel::Warning, &msg).await;
                if let Err(e) = self.alerts.try_send(reading.clone()) {
                    error!("alert not queued: {e}");
                }
            }
            Transition::Cleared => {
                info!("fault latch cleared");
                self.log_event(LogLevel::Info, "System status normal, fault alert reset")
                    .await;
            }
            Transition::Unchanged => {}
        }

        // ── Persist ────────────────────────────────────────────────
        if let Err(e) = self.db.insert_measurement(&reading).await {
            error!("insert_measurement failed: {e}");
        }

        if let Some(label) = label {
            if let Err(e) = self.recorder.append(&reading, &label).await {
                error!(%label, "recording append failed: {e}");
            }
        }

        Ok(Outcome {
            reading,
            increment_kwh,
            transition,
        })
    }

    async fn log_event(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.db.append_log(level, message).await {
            error!(level = level.as_str(), "append_log failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Alert dispatcher
// ---------------------------------------------------------------------------

/// Deliver queued alerts one by one.  Failures are logged, never retried.
pub async fn run_alerts(
    mut rx: mpsc::Receiver<Reading>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    timeout: Duration,
) {
    while let Some(reading) = rx.recv().await {
        let Some(notifier) = &notifier else {
            warn!(status = %reading.status, "alert notifier not configured, alert dropped");
            continue;
        };
        match with_timeout(timeout, notifier.send_alert(&reading)).await {
            Ok(()) => info!(status = %reading.status, "fault alert sent"),
            Err(e) => error!(status = %reading.status, "fault alert failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Running ingestion: the subscriber and alert dispatcher tasks.
pub struct IngestHandle {
    client: AsyncClient,
    subscriber: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl IngestHandle {
    pub async fn stop(self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect: {e}");
        }
        self.subscriber.abort();
        self.dispatcher.abort();
        info!("ingestion stopped");
    }
}

/// Connect to the broker and start ingesting.  Nothing runs until this is
/// called.
pub fn start(
    cfg: &Config,
    db: Db,
    shared: SharedState,
    notifier: Option<Arc<dyn AlertNotifier>>,
) -> IngestHandle {
    let mut options = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    options.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));
    let (client, eventloop) = AsyncClient::new(options, 20);

    let (alert_tx, alert_rx) = mpsc::channel(ALERT_QUEUE);
    let dispatcher = tokio::spawn(run_alerts(
        alert_rx,
        notifier,
        cfg.collaborators.timeout(),
    ));

    let pipeline = Pipeline::new(
        db.clone(),
        Arc::clone(&shared),
        alert_tx,
        Recorder::new(&cfg.recording.dataset_path),
        cfg.billing.utc_offset(),
        unix_now(),
    );
    let subscriber = tokio::spawn(run_subscriber(
        client.clone(),
        eventloop,
        cfg.mqtt.topic.clone(),
        pipeline,
        shared,
        db,
    ));

    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        topic = %cfg.mqtt.topic,
        "ingestion started"
    );

    IngestHandle {
        client,
        subscriber,
        dispatcher,
    }
}

async fn run_subscriber(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    mut pipeline: Pipeline,
    shared: SharedState,
    db: Db,
) {
    // Persist one ERROR per outage, not one per reconnect attempt.
    let mut outage_logged = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic != topic {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }
                match pipeline.handle(&p.payload, unix_now()).await {
                    Ok(outcome) => debug!(
                        status = %outcome.reading.status,
                        power = outcome.reading.power,
                        kwh = outcome.increment_kwh,
                        "telemetry"
                    ),
                    Err(e) => warn!(topic = %p.topic, "dropping telemetry: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Subscribe on every connect; a clean session forgets it.
                if let Err(e) = client.try_subscribe(&topic, QoS::AtMostOnce) {
                    error!(%topic, "subscribe failed: {e}");
                }
                outage_logged = false;
                shared.write().await.mqtt_connected = true;
                info!(%topic, "mqtt connected");
                if let Err(e) = db
                    .append_log(LogLevel::Info, "Connected to MQTT broker")
                    .await
                {
                    error!("append_log failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                shared.write().await.mqtt_connected = false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                shared.write().await.mqtt_connected = false;
                if !outage_logged {
                    outage_logged = true;
                    if let Err(db_err) = db
                        .append_log(LogLevel::Error, &format!("MQTT connection failed: {e}"))
                        .await
                    {
                        error!("append_log failed: {db_err}");
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
