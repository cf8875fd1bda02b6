//! Read-side composition: the live dashboard payload, the weekly history,
//! and the usage context handed to the report generator.  Pure reads over
//! the shared state and the store.

use serde::Serialize;
use std::collections::BTreeMap;
use time::UtcOffset;

use crate::collab::UsageContext;
use crate::config::Config;
use crate::db::{Db, DailySummary, LogEvent, Measurement};
use crate::error::Result;
use crate::state::SharedState;
use crate::telemetry::Reading;

/// Days shown in the history chart.
pub const HISTORY_DAYS: i64 = 7;

/// Window of fault events included in the usage context.
const FAULT_WINDOW_SECS: f64 = 30.0 * 60.0;
const FAULT_CONTEXT_LIMIT: i64 = 10;

/// The config values the read side needs.
#[derive(Debug, Clone)]
pub struct ReadSettings {
    pub cost_per_kwh: f64,
    pub offline_timeout_secs: f64,
    pub history_limit: i64,
    pub log_limit: i64,
    pub utc_offset: UtcOffset,
}

impl From<&Config> for ReadSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            cost_per_kwh: cfg.billing.cost_per_kwh,
            offline_timeout_secs: cfg.monitor.offline_timeout_secs,
            history_limit: cfg.monitor.history_limit,
            log_limit: cfg.monitor.log_limit,
            utc_offset: cfg.billing.utc_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveState {
    /// Latest reading, clamped to OFFLINE when stale.
    pub live: Reading,
    pub session_kwh: f64,
    pub today_kwh: f64,
    /// `today_kwh * cost_per_kwh`.
    pub bill: f64,
    /// Oldest first.
    pub history: Vec<Measurement>,
    /// Newest first.
    pub logs: Vec<LogEvent>,
    pub recording: bool,
    pub mqtt_connected: bool,
    pub uptime_secs: u64,
}

pub async fn live_state(
    shared: &SharedState,
    db: &Db,
    settings: &ReadSettings,
    now: f64,
) -> Result<LiveState> {
    let view = shared
        .read()
        .await
        .live_view(now, settings.offline_timeout_secs);

    let today = Db::day_key(now, settings.utc_offset);
    let today_kwh = db.get_daily_kwh(&today).await?;

    // The store hands back newest first; the chart wants time order.
    let mut history = db.recent_measurements(settings.history_limit).await?;
    history.reverse();

    let logs = db.recent_logs(settings.log_limit).await?;

    Ok(LiveState {
        live: view.reading,
        session_kwh: view.session_kwh,
        today_kwh,
        bill: today_kwh * settings.cost_per_kwh,
        history,
        logs,
        recording: view.recording,
        mqtt_connected: view.mqtt_connected,
        uptime_secs: view.uptime_secs,
    })
}

pub fn by_date(rows: Vec<DailySummary>) -> BTreeMap<String, f64> {
    rows.into_iter().map(|r| (r.date, r.kwh)).collect()
}

/// `{date: kwh}` for the most recent [`HISTORY_DAYS`] days on record,
/// ascending by date.
pub async fn weekly_history(db: &Db) -> Result<BTreeMap<String, f64>> {
    Ok(by_date(db.recent_daily_summaries(HISTORY_DAYS).await?))
}

pub async fn usage_context(
    shared: &SharedState,
    db: &Db,
    settings: &ReadSettings,
    now: f64,
) -> Result<UsageContext> {
    let view = shared
        .read()
        .await
        .live_view(now, settings.offline_timeout_secs);
    let daily_kwh = weekly_history(db).await?;
    let today = Db::day_key(now, settings.utc_offset);
    let today_kwh = daily_kwh.get(&today).copied().unwrap_or(0.0);
    let recent_faults = db
        .recent_faults(now - FAULT_WINDOW_SECS, FAULT_CONTEXT_LIMIT)
        .await?;

    Ok(UsageContext {
        status: view.reading.status.to_string(),
        power_w: view.reading.power,
        today_kwh,
        daily_kwh,
        recent_faults,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LogLevel;
    use crate::state::new_shared;
    use crate::telemetry::Status;
    use std::time::Duration;

    const NOW: f64 = 1_709_300_000.0; // 2024-03-01T13:33:20Z

    fn settings() -> ReadSettings {
        ReadSettings {
            cost_per_kwh: 8.0,
            offline_timeout_secs: 5.0,
            history_limit: 50,
            log_limit: 10,
            utc_offset: UtcOffset::UTC,
        }
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:", Duration::from_secs(3))
            .await
            .unwrap();
        db.init_schema().await.unwrap();
        db
    }

    fn reading(ts: f64, power: f64) -> Reading {
        Reading {
            timestamp: ts,
            voltage: 230.0,
            current: power / 230.0,
            power,
            status: Status::Normal,
        }
    }

    #[tokio::test]
    async fn live_state_composes_snapshot_energy_bill_and_history() {
        let db = test_db().await;
        let shared = new_shared("LEVEL_1");
        for i in 0..3 {
            let r = reading(NOW - 3.0 + i as f64, 10.0 + i as f64);
            db.insert_measurement(&r).await.unwrap();
            shared.write().await.apply_reading(r, 0.25);
        }
        db.upsert_daily_energy("2024-03-01", 1.5).await.unwrap();
        db.append_log(LogLevel::Info, "hello").await.unwrap();

        let s = live_state(&shared, &db, &settings(), NOW).await.unwrap();

        assert_eq!(s.live.status, Status::Normal);
        assert_eq!(s.live.power, 12.0);
        assert_eq!(s.session_kwh, 0.25);
        assert_eq!(s.today_kwh, 1.5);
        assert_eq!(s.bill, 12.0);
        let ts: Vec<f64> = s.history.iter().map(|m| m.timestamp).collect();
        assert_eq!(ts, [NOW - 3.0, NOW - 2.0, NOW - 1.0]);
        assert_eq!(s.logs.len(), 1);
    }

    #[tokio::test]
    async fn live_state_history_respects_limit_and_order() {
        let db = test_db().await;
        let shared = new_shared("LEVEL_1");
        for i in 0..60 {
            db.insert_measurement(&reading(NOW - 60.0 + i as f64, 1.0))
                .await
                .unwrap();
        }
        let s = live_state(&shared, &db, &settings(), NOW).await.unwrap();
        assert_eq!(s.history.len(), 50);
        assert_eq!(s.history.first().unwrap().timestamp, NOW - 50.0);
        assert_eq!(s.history.last().unwrap().timestamp, NOW - 1.0);
    }

    #[tokio::test]
    async fn stale_snapshot_served_offline_but_persisted_values_kept() {
        let db = test_db().await;
        let shared = new_shared("LEVEL_1");
        let r = reading(NOW - 6.0, 92.0);
        db.insert_measurement(&r).await.unwrap();
        shared.write().await.apply_reading(r, 0.0);

        let s = live_state(&shared, &db, &settings(), NOW).await.unwrap();

        assert_eq!(s.live.status, Status::Offline);
        assert_eq!(s.live.voltage, 0.0);
        assert_eq!(s.live.current, 0.0);
        assert_eq!(s.live.power, 0.0);
        assert_eq!(s.history[0].power, 92.0);
        assert_eq!(s.history[0].status, "OK");
        // No event logged for the offline clamp.
        assert!(s.logs.is_empty());
    }

    #[tokio::test]
    async fn empty_store_is_zero_not_error() {
        let db = test_db().await;
        let shared = new_shared("LEVEL_1");
        let s = live_state(&shared, &db, &settings(), NOW).await.unwrap();
        assert_eq!(s.today_kwh, 0.0);
        assert_eq!(s.bill, 0.0);
        assert!(s.history.is_empty());
        assert!(weekly_history(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_surfaces() {
        let db = test_db().await;
        db.pool().close().await;
        let shared = new_shared("LEVEL_1");
        assert!(live_state(&shared, &db, &settings(), NOW).await.is_err());
    }

    #[tokio::test]
    async fn weekly_history_last_seven_ascending() {
        let db = test_db().await;
        for d in (1..=10).rev() {
            db.upsert_daily_energy(&format!("2024-02-{d:02}"), d as f64)
                .await
                .unwrap();
        }
        let h = weekly_history(&db).await.unwrap();
        let keys: Vec<&String> = h.keys().collect();
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], "2024-02-04");
        assert_eq!(keys[6], "2024-02-10");
        assert_eq!(h["2024-02-10"], 10.0);

        let json = serde_json::to_string(&h).unwrap();
        assert!(json.starts_with("{\"2024-02-04\":4.0"), "{json}");
    }

    #[tokio::test]
    async fn usage_context_collects_recent_faults_only() {
        let db = test_db().await;
        let shared = new_shared("LEVEL_1");
        db.upsert_daily_energy("2024-03-01", 0.75).await.unwrap();
        db.append_log_at(NOW - 3600.0, LogLevel::Warning, "old").await.unwrap();
        db.append_log_at(NOW - 60.0, LogLevel::Warning, "fresh").await.unwrap();
        db.append_log_at(NOW - 30.0, LogLevel::Info, "info").await.unwrap();

        let ctx = usage_context(&shared, &db, &settings(), NOW).await.unwrap();
        assert_eq!(ctx.status, "OFFLINE");
        assert_eq!(ctx.today_kwh, 0.75);
        assert_eq!(ctx.recent_faults.len(), 1);
        assert_eq!(ctx.recent_faults[0].message, "fresh");
    }
}
