//! Outbound collaborators: the AI report generator, the alert notifier and
//! the chart renderer used in pushed reports.
//!
//! All three sit behind traits so the core only hands them context data.
//! Network calls are bounded by the configured timeout and a failure never
//! reaches ingestion or the read API: callers get a placeholder text instead.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::db::LogEvent;
use crate::error::{Error, Result};
use crate::telemetry::Reading;

/// Returned in place of generated text when the generator fails.
pub const ANALYSIS_UNAVAILABLE: &str = "Analysis unavailable";

// ---------------------------------------------------------------------------
// Context handed to the report generator
// ---------------------------------------------------------------------------

/// Usage data the generator reasons over.
#[derive(Debug, Clone, Serialize)]
pub struct UsageContext {
    pub status: String,
    pub power_w: f64,
    pub today_kwh: f64,
    /// `{date: kwh}`, ascending.
    pub daily_kwh: BTreeMap<String, f64>,
    pub recent_faults: Vec<LogEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportRequest {
    /// Health check and usage trend for the dashboard.
    Analysis { context: UsageContext },
    /// Free-form question from the dashboard chat box.
    Chat {
        context: UsageContext,
        question: String,
    },
    /// Short commentary for a pushed usage report.
    Summary { daily_kwh: BTreeMap<String, f64> },
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, request: &ReportRequest) -> Result<String>;
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// One alert for a reading that tripped the fault latch.
    async fn send_alert(&self, reading: &Reading) -> Result<()>;
    /// A usage report pushed on demand.
    async fn send_report(&self, text: &str) -> Result<()>;
}

/// Turns `{date: kwh}` into something a pushed report can carry.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, daily_kwh: &BTreeMap<String, f64>) -> String;
}

// ---------------------------------------------------------------------------
// Bundle used by the HTTP layer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Collaborators {
    pub reports: Option<Arc<dyn ReportGenerator>>,
    pub notifier: Option<Arc<dyn AlertNotifier>>,
    pub chart: Arc<dyn ChartRenderer>,
    pub timeout: Duration,
}

impl Collaborators {
    /// Build the configured collaborators; each is absent when its
    /// credentials are missing.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let timeout = cfg.collaborators.timeout();
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        let reports = cfg.secrets.gemini_api_key.as_ref().map(|key| {
            Arc::new(GeminiClient::new(
                http.clone(),
                key.clone(),
                cfg.collaborators.gemini_model.clone(),
            )) as Arc<dyn ReportGenerator>
        });

        let notifier = match (
            &cfg.secrets.telegram_bot_token,
            &cfg.secrets.telegram_chat_id,
        ) {
            (Some(token), Some(chat_id)) => Some(Arc::new(TelegramNotifier::new(
                http,
                token.clone(),
                chat_id.clone(),
            )) as Arc<dyn AlertNotifier>),
            _ => None,
        };

        Ok(Self {
            reports,
            notifier,
            chart: Arc::new(TextBarChart::default()),
            timeout,
        })
    }

    /// Generated text, or [`ANALYSIS_UNAVAILABLE`] on failure or timeout.
    /// Callers check `reports.is_some()` first when "not configured" needs
    /// its own response.
    pub async fn report_or_fallback(&self, request: &ReportRequest) -> String {
        let Some(reports) = &self.reports else {
            return ANALYSIS_UNAVAILABLE.to_string();
        };
        match with_timeout(self.timeout, reports.generate(request)).await {
            Ok(text) => text,
            Err(e) => {
                warn!("report generator failed: {e}");
                ANALYSIS_UNAVAILABLE.to_string()
            }
        }
    }
}

/// Run a collaborator call with a deadline.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut).await?
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            http,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            model,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// The instruction line plus the request as JSON.  The wording is kept to a
/// minimum; the model gets the data, not a script.
fn prompt_for(request: &ReportRequest) -> Result<String> {
    let instruction = match request {
        ReportRequest::Analysis { .. } => {
            "You are a home energy analyst. Report system health (prioritise any faults), \
             the usage trend, how today compares to the average, and one actionable tip. \
             Answer as a short HTML snippet."
        }
        ReportRequest::Chat { .. } => {
            "You are a home energy assistant. Answer the question using the usage data. \
             Keep it short."
        }
        ReportRequest::Summary { .. } => {
            "Summarise this daily energy usage in under 100 words: abnormal days, trend, \
             and an efficiency rating out of 100. Plain text."
        }
    };
    let data = serde_json::to_string_pretty(request)
        .map_err(|e| Error::Collaborator(format!("failed to encode context: {e}")))?;
    Ok(format!("{instruction}\n\n{data}"))
}

#[async_trait]
impl ReportGenerator for GeminiClient {
    async fn generate(&self, request: &ReportRequest) -> Result<String> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt_for(request)? }] }]
        });
        let resp: serde_json::Value = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        resp.pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Collaborator("generator returned no text".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Text chart
// ---------------------------------------------------------------------------

/// One `#` bar per day, scaled to the largest day.
pub struct TextBarChart {
    pub width: usize,
}

impl Default for TextBarChart {
    fn default() -> Self {
        Self { width: 20 }
    }
}

impl ChartRenderer for TextBarChart {
    fn render(&self, daily_kwh: &BTreeMap<String, f64>) -> String {
        let max = daily_kwh.values().copied().fold(0.0_f64, f64::max);
        daily_kwh
            .iter()
            .map(|(date, &kwh)| {
                let len = if max > 0.0 {
                    (kwh.max(0.0) / max * self.width as f64).round() as usize
                } else {
                    0
                };
                format!(
                    "{date} {bar:<width$} {kwh:.2}",
                    bar = "#".repeat(len),
                    width = self.width
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// The bot token is part of the request path, so request errors are
/// reported without their URL.
pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: reqwest::Client, token: String, chat_id: String) -> Self {
        Self {
            http,
            base_url: TELEGRAM_BASE_URL.to_string(),
            token,
            chat_id,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        self.http
            .post(url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn alert_text(r: &Reading) -> String {
    format!(
        "ALERT: {status}\nvoltage {v:.1} V, current {i:.3} A, power {p:.1} W\nat unix time {ts:.0}",
        status = r.status,
        v = r.voltage,
        i = r.current,
        p = r.power,
        ts = r.timestamp
    )
}

#[async_trait]
impl AlertNotifier for TelegramNotifier {
    async fn send_alert(&self, reading: &Reading) -> Result<()> {
        self.send_message(&alert_text(reading)).await
    }

    async fn send_report(&self, text: &str) -> Result<()> {
        self.send_message(text).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telemetry::Status;
    use std::sync::Mutex;

    /// Generator returning a fixed answer, or failing / hanging on demand.
    pub(crate) enum FakeGenerator {
        Answer(&'static str),
        Fail,
        Hang,
    }

    #[async_trait]
    impl ReportGenerator for FakeGenerator {
        async fn generate(&self, _request: &ReportRequest) -> Result<String> {
            match self {
                Self::Answer(text) => Ok(text.to_string()),
                Self::Fail => Err(Error::Collaborator("boom".into())),
                Self::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
            }
        }
    }

    /// Notifier that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) alerts: Mutex<Vec<Reading>>,
        pub(crate) reports: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn send_alert(&self, reading: &Reading) -> Result<()> {
            self.alerts.lock().unwrap().push(reading.clone());
            Ok(())
        }

        async fn send_report(&self, text: &str) -> Result<()> {
            self.reports.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn collaborators(generator: FakeGenerator) -> Collaborators {
        Collaborators {
            reports: Some(Arc::new(generator)),
            notifier: None,
            chart: Arc::new(TextBarChart::default()),
            timeout: Duration::from_millis(50),
        }
    }

    fn summary_request() -> ReportRequest {
        ReportRequest::Summary {
            daily_kwh: BTreeMap::from([("2024-01-01".to_string(), 1.5)]),
        }
    }

    #[tokio::test]
    async fn report_passes_through_answer() {
        let c = collaborators(FakeGenerator::Answer("all good"));
        assert_eq!(c.report_or_fallback(&summary_request()).await, "all good");
    }

    #[tokio::test]
    async fn report_failure_falls_back() {
        let c = collaborators(FakeGenerator::Fail);
        assert_eq!(
            c.report_or_fallback(&summary_request()).await,
            ANALYSIS_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn report_timeout_falls_back() {
        let c = collaborators(FakeGenerator::Hang);
        assert_eq!(
            c.report_or_fallback(&summary_request()).await,
            ANALYSIS_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn unconfigured_generator_falls_back() {
        let c = Collaborators {
            reports: None,
            notifier: None,
            chart: Arc::new(TextBarChart::default()),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            c.report_or_fallback(&summary_request()).await,
            ANALYSIS_UNAVAILABLE
        );
    }

    #[test]
    fn from_config_without_secrets_has_no_collaborators() {
        let c = Collaborators::from_config(&Config::default()).unwrap();
        assert!(c.reports.is_none());
        assert!(c.notifier.is_none());
    }

    #[test]
    fn telegram_needs_both_token_and_chat() {
        let mut cfg = Config::default();
        cfg.secrets.telegram_bot_token = Some("t".into());
        let c = Collaborators::from_config(&cfg).unwrap();
        assert!(c.notifier.is_none());

        cfg.secrets.telegram_chat_id = Some("42".into());
        let c = Collaborators::from_config(&cfg).unwrap();
        assert!(c.notifier.is_some());
    }

    #[test]
    fn text_chart_scales_to_largest_day() {
        let chart = TextBarChart { width: 4 };
        let daily = BTreeMap::from([
            ("2024-01-01".to_string(), 1.0),
            ("2024-01-02".to_string(), 2.0),
            ("2024-01-03".to_string(), 0.0),
        ]);
        assert_eq!(
            chart.render(&daily),
            "2024-01-01 ##   1.00\n2024-01-02 #### 2.00\n2024-01-03      0.00"
        );
    }

    #[test]
    fn text_chart_all_zero_days() {
        let chart = TextBarChart { width: 2 };
        let daily = BTreeMap::from([("2024-01-01".to_string(), 0.0)]);
        assert_eq!(chart.render(&daily), "2024-01-01    0.00");
    }

    #[test]
    fn prompt_carries_context_data() {
        let prompt = prompt_for(&ReportRequest::Chat {
            context: UsageContext {
                status: "FAULT: OC".into(),
                power_w: 92.0,
                today_kwh: 0.4,
                daily_kwh: BTreeMap::new(),
                recent_faults: vec![],
            },
            question: "why did it trip?".into(),
        })
        .unwrap();
        assert!(prompt.contains("\"kind\": \"chat\""));
        assert!(prompt.contains("FAULT: OC"));
        assert!(prompt.contains("why did it trip?"));
    }

    #[test]
    fn alert_text_names_status_and_values() {
        let text = alert_text(&Reading {
            timestamp: 1.0,
            voltage: 230.0,
            current: 0.4,
            power: 92.0,
            status: Status::Fault("FAULT: OC".into()),
        });
        assert!(text.contains("FAULT: OC"));
        assert!(text.contains("0.400 A"));
        assert!(text.contains("92.0 W"));
    }

    // Nothing listens on port 1, so every request fails to connect.
    const UNREACHABLE: &str = "http://127.0.0.1:1";

    #[tokio::test]
    async fn telegram_error_does_not_leak_token() {
        let notifier = TelegramNotifier::new(
            reqwest::Client::new(),
            "123456:SECRET_TOKEN".into(),
            "42".into(),
        )
        .with_base_url(UNREACHABLE);
        let err = notifier.send_report("hello").await.unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
        assert!(!err.to_string().contains("SECRET_TOKEN"), "{err}");
    }

    #[tokio::test]
    async fn gemini_error_does_not_leak_api_key() {
        let client = GeminiClient::new(
            reqwest::Client::new(),
            "SECRET_API_KEY".into(),
            "gemini-test".into(),
        )
        .with_base_url(UNREACHABLE);
        let err = client.generate(&summary_request()).await.unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
        assert!(!err.to_string().contains("SECRET_API_KEY"), "{err}");
    }
}
