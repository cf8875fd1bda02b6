//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use time::UtcOffset;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub web: WebConfig,
    pub billing: BillingConfig,
    pub monitor: MonitorConfig,
    pub recording: RecordingConfig,
    pub collaborators: CollaboratorConfig,
    /// Never read from the file; see [`Config::apply_env`].
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub busy_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub cost_per_kwh: f64,
    /// Offset used to decide which calendar day energy is booked to.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub offline_timeout_secs: f64,
    pub history_limit: i64,
    pub log_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub dataset_path: String,
    pub default_label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub timeout_secs: u64,
    pub gemini_model: String,
}

#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub gemini_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            topic: "digikey/power/telemetry".to_string(),
            client_id: "power-hub".to_string(),
            keep_alive_secs: 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:power_monitor.db?mode=rwc".to_string(),
            busy_timeout_secs: 3,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            cost_per_kwh: 8.0,
            utc_offset_minutes: 0,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            offline_timeout_secs: crate::liveness::DEFAULT_OFFLINE_TIMEOUT_SECS,
            history_limit: 50,
            log_limit: 10,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dataset_path: "ml_dataset.csv".to_string(),
            default_label: "LEVEL_1".to_string(),
        }
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            gemini_model: "gemini-1.5-flash".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl BillingConfig {
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC)
    }
}

impl CollaboratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

impl Config {
    /// Apply secrets and deployment overrides from the environment.  Takes a
    /// lookup function so tests don't have to mutate the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = non_empty("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port}"))?;
        }
        if let Some(url) = non_empty("DB_URL") {
            self.store.url = url;
        }
        if let Some(port) = non_empty("WEB_PORT") {
            self.web.port = port
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port}"))?;
        }

        self.secrets = Secrets {
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty("TELEGRAM_CHAT_ID"),
        };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── MQTT ────────────────────────────────────────────
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if self.mqtt.topic.trim().is_empty() {
            errors.push("mqtt.topic is empty".to_string());
        } else if self.mqtt.topic.contains(&['+', '#'][..]) {
            errors.push(format!(
                "mqtt.topic '{}' must be a concrete topic, not a wildcard filter",
                self.mqtt.topic
            ));
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                self.mqtt.keep_alive_secs
            ));
        }

        // ── Store ───────────────────────────────────────────
        if self.store.url.trim().is_empty() {
            errors.push("store.url is empty".to_string());
        }
        if !(1..=9).contains(&self.store.busy_timeout_secs) {
            errors.push(format!(
                "store.busy_timeout_secs {} out of range [1, 9]",
                self.store.busy_timeout_secs
            ));
        }

        // ── Web ─────────────────────────────────────────────
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        // ── Billing ─────────────────────────────────────────
        if !self.billing.cost_per_kwh.is_finite() || self.billing.cost_per_kwh < 0.0 {
            errors.push(format!(
                "billing.cost_per_kwh must be a non-negative number, got {}",
                self.billing.cost_per_kwh
            ));
        }
        if !(-720..=840).contains(&self.billing.utc_offset_minutes) {
            errors.push(format!(
                "billing.utc_offset_minutes {} out of range [-720, 840]",
                self.billing.utc_offset_minutes
            ));
        }

        // ── Monitor ─────────────────────────────────────────
        if !self.monitor.offline_timeout_secs.is_finite() || self.monitor.offline_timeout_secs <= 0.0
        {
            errors.push(format!(
                "monitor.offline_timeout_secs must be positive, got {}",
                self.monitor.offline_timeout_secs
            ));
        }
        if !(1..=1000).contains(&self.monitor.history_limit) {
            errors.push(format!(
                "monitor.history_limit {} out of range [1, 1000]",
                self.monitor.history_limit
            ));
        }
        if !(1..=1000).contains(&self.monitor.log_limit) {
            errors.push(format!(
                "monitor.log_limit {} out of range [1, 1000]",
                self.monitor.log_limit
            ));
        }

        // ── Recording ───────────────────────────────────────
        if self.recording.dataset_path.trim().is_empty() {
            errors.push("recording.dataset_path is empty".to_string());
        }
        if let Err(e) = validate_label(&self.recording.default_label) {
            errors.push(format!("recording.default_label: {e}"));
        }

        // ── Collaborators ───────────────────────────────────
        if self.collaborators.timeout_secs == 0 {
            errors.push("collaborators.timeout_secs must be positive".to_string());
        }
        if self.collaborators.gemini_model.trim().is_empty() {
            errors.push("collaborators.gemini_model is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Recording labels end up as a bare CSV column.
pub fn validate_label(label: &str) -> std::result::Result<(), String> {
    if label.trim().is_empty() {
        return Err("label is empty".to_string());
    }
    if label.contains(&[',', '\n', '\r', '"'][..]) {
        return Err(format!("label '{label}' contains CSV control characters"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file (defaults when it doesn't exist), apply
/// the process environment, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.topic, "digikey/power/telemetry");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.web.port, 5000);
        assert_eq!(config.billing.cost_per_kwh, 8.0);
        assert_eq!(config.monitor.offline_timeout_secs, 5.0);
        assert_eq!(config.monitor.history_limit, 50);
        assert_eq!(config.monitor.log_limit, 10);
        assert_eq!(config.store.busy_timeout_secs, 3);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[mqtt]
host = "192.168.1.10"
topic = "home/power/telemetry"

[billing]
cost_per_kwh = 0.31
utc_offset_minutes = 330
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "192.168.1.10");
        assert_eq!(config.mqtt.topic, "home/power/telemetry");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.billing.cost_per_kwh, 0.31);
        assert_eq!(
            config.billing.utc_offset(),
            UtcOffset::from_hms(5, 30, 0).unwrap()
        );
        config.validate().unwrap();
    }

    #[test]
    fn secrets_are_not_read_from_file() {
        let toml_str = r#"
[secrets]
gemini_api_key = "leaked"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.secrets.gemini_api_key.is_none());
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_and_secrets() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("MQTT_HOST", "10.0.0.2"),
                ("MQTT_PORT", "8883"),
                ("DB_URL", "sqlite::memory:"),
                ("WEB_PORT", "8080"),
                ("GEMINI_API_KEY", "g-key"),
                ("TELEGRAM_BOT_TOKEN", "t-token"),
                ("TELEGRAM_CHAT_ID", ""),
            ]))
            .unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.store.url, "sqlite::memory:");
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.secrets.gemini_api_key.as_deref(), Some("g-key"));
        assert_eq!(config.secrets.telegram_bot_token.as_deref(), Some("t-token"));
        assert_eq!(config.secrets.telegram_chat_id, None);
    }

    #[test]
    fn env_bad_port_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("MQTT_PORT", "nope")])).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn wildcard_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic = "power/+/telemetry".into();
        assert_validation_err(&cfg, "wildcard");
    }

    #[test]
    fn empty_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.topic = " ".into();
        assert_validation_err(&cfg, "mqtt.topic is empty");
    }

    #[test]
    fn busy_timeout_must_be_single_digit_seconds() {
        let mut cfg = Config::default();
        cfg.store.busy_timeout_secs = 30;
        assert_validation_err(&cfg, "store.busy_timeout_secs 30 out of range");
        cfg.store.busy_timeout_secs = 0;
        assert_validation_err(&cfg, "store.busy_timeout_secs 0 out of range");
    }

    #[test]
    fn negative_cost_rejected() {
        let mut cfg = Config::default();
        cfg.billing.cost_per_kwh = -1.0;
        assert_validation_err(&cfg, "cost_per_kwh must be a non-negative number");
    }

    #[test]
    fn utc_offset_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.billing.utc_offset_minutes = 15 * 60;
        assert_validation_err(&cfg, "utc_offset_minutes");
    }

    #[test]
    fn offline_timeout_must_be_positive() {
        let mut cfg = Config::default();
        cfg.monitor.offline_timeout_secs = 0.0;
        assert_validation_err(&cfg, "offline_timeout_secs must be positive");
    }

    #[test]
    fn limits_bounded() {
        let mut cfg = Config::default();
        cfg.monitor.history_limit = 0;
        cfg.monitor.log_limit = 5000;
        assert_validation_err(&cfg, "history_limit 0");
        assert_validation_err(&cfg, "log_limit 5000");
    }

    #[test]
    fn label_with_comma_rejected() {
        let mut cfg = Config::default();
        cfg.recording.default_label = "A,B".into();
        assert_validation_err(&cfg, "CSV control characters");
    }

    #[test]
    fn all_errors_reported_together() {
        let mut cfg = Config::default();
        cfg.mqtt.port = 0;
        cfg.web.port = 0;
        cfg.collaborators.timeout_secs = 0;
        assert_validation_err(&cfg, "3 errors");
    }

    #[test]
    fn single_error_is_singular() {
        let mut cfg = Config::default();
        cfg.web.port = 0;
        assert_validation_err(&cfg, "(1 error)");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = load("/nonexistent/power-hub/config.toml").unwrap();
        assert_eq!(cfg.mqtt.client_id, "power-hub");
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../../../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.store.url, StoreConfig::default().url);
        assert_eq!(config.collaborators.timeout_secs, 15);
    }
}
