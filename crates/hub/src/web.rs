use anyhow::Context;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api::{self, ReadSettings, HISTORY_DAYS};
use crate::collab::{with_timeout, Collaborators, ReportRequest};
use crate::config::{validate_label, Config};
use crate::db::{Db, LogLevel};
use crate::error::Error;
use crate::state::SharedState;
use crate::telemetry::unix_now;

const INDEX_HTML: &str = include_str!("ui/index.html");

const ANALYSIS_NOT_CONFIGURED: &str = "AI analysis not configured (GEMINI_API_KEY missing)";
const NOTIFIER_NOT_CONFIGURED: &str = "notifier not configured (TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID missing)";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub collab: Arc<Collaborators>,
    pub settings: Arc<ReadSettings>,
    pub default_label: Arc<str>,
}

impl AppState {
    pub fn new(cfg: &Config, shared: SharedState, db: Db, collab: Collaborators) -> Self {
        Self {
            shared,
            db,
            collab: Arc::new(collab),
            settings: Arc::new(ReadSettings::from(cfg)),
            default_label: Arc::from(cfg.recording.default_label.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Internal(Error),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Internal(e) => {
                error!("request failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}

type ApiResult = Result<Response, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/data", get(api_data))
        .route("/api/history", get(api_history))
        .route("/api/record", post(api_record))
        .route("/api/analyze", post(api_analyze))
        .route("/api/chat", post(api_chat))
        .route("/api/notify", post(api_notify))
        .route("/api/admin/reset", post(api_admin_reset))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    state.db.ping().await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

async fn api_data(State(state): State<AppState>) -> ApiResult {
    let live = api::live_state(&state.shared, &state.db, &state.settings, unix_now()).await?;
    Ok(Json(live).into_response())
}

async fn api_history(State(state): State<AppState>) -> ApiResult {
    Ok(Json(api::weekly_history(&state.db).await?).into_response())
}

// ---- Recording ----

#[derive(Debug, Deserialize)]
struct RecordRequest {
    #[serde(default)]
    action: String,
    label: Option<String>,
}

async fn api_record(State(state): State<AppState>, Json(req): Json<RecordRequest>) -> ApiResult {
    match req.action.as_str() {
        "start" => {
            let label = req
                .label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| state.default_label.to_string());
            validate_label(&label).map_err(ApiError::BadRequest)?;
            state.shared.write().await.start_recording(label.clone());
            info!(%label, "recording started");
            Ok(Json(json!({ "status": "recording started", "label": label })).into_response())
        }
        "stop" => {
            state.shared.write().await.stop_recording();
            info!("recording stopped");
            Ok(Json(json!({ "status": "recording stopped" })).into_response())
        }
        _ => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "invalid action" })),
        )
            .into_response()),
    }
}

// ---- Report generator ----

fn not_configured(msg: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "result": msg })),
    )
        .into_response()
}

async fn api_analyze(State(state): State<AppState>) -> ApiResult {
    if state.collab.reports.is_none() {
        return Ok(not_configured(ANALYSIS_NOT_CONFIGURED));
    }
    let context = api::usage_context(&state.shared, &state.db, &state.settings, unix_now()).await?;
    let result = state
        .collab
        .report_or_fallback(&ReportRequest::Analysis { context })
        .await;
    Ok(Json(json!({ "result": result })).into_response())
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
}

async fn api_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> ApiResult {
    let question = req.message.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    if state.collab.reports.is_none() {
        return Ok(not_configured(ANALYSIS_NOT_CONFIGURED));
    }
    let context = api::usage_context(&state.shared, &state.db, &state.settings, unix_now()).await?;
    let result = state
        .collab
        .report_or_fallback(&ReportRequest::Chat {
            context,
            question: question.to_string(),
        })
        .await;
    Ok(Json(json!({ "result": result })).into_response())
}

// ---- Notifier ----

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Scope {
    #[default]
    Recent,
    Full,
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    #[serde(default)]
    scope: Scope,
}

async fn api_notify(State(state): State<AppState>, Json(req): Json<NotifyRequest>) -> ApiResult {
    let Some(notifier) = state.collab.notifier.clone() else {
        return Ok(not_configured(NOTIFIER_NOT_CONFIGURED));
    };

    let rows = match req.scope {
        Scope::Recent => state.db.recent_daily_summaries(HISTORY_DAYS).await?,
        Scope::Full => state.db.all_daily_summaries().await?,
    };
    if rows.is_empty() {
        return Ok(Json(json!({ "result": "no data available to report" })).into_response());
    }

    let days = rows.len();
    let total: f64 = rows.iter().map(|r| r.kwh).sum();
    let average = total / days as f64;
    let daily_kwh = api::by_date(rows);
    let chart = state.collab.chart.render(&daily_kwh);
    let commentary = state
        .collab
        .report_or_fallback(&ReportRequest::Summary { daily_kwh })
        .await;

    let text = report_text(
        req.scope,
        Totals {
            days,
            total,
            average,
            cost_per_kwh: state.settings.cost_per_kwh,
        },
        &chart,
        &commentary,
    );
    match with_timeout(state.collab.timeout, notifier.send_report(&text)).await {
        Ok(()) => Ok(Json(json!({ "result": "report sent" })).into_response()),
        Err(e) => {
            warn!("usage report failed: {e}");
            Ok(Json(json!({ "result": "report could not be sent" })).into_response())
        }
    }
}

struct Totals {
    days: usize,
    total: f64,
    average: f64,
    cost_per_kwh: f64,
}

fn report_text(scope: Scope, t: Totals, chart: &str, commentary: &str) -> String {
    let title = match scope {
        Scope::Recent => "Weekly energy report",
        Scope::Full => "Full energy report",
    };
    format!(
        "{title} ({days} days)\n\
         Total: {total:.2} kWh\n\
         Average: {average:.2} kWh/day\n\
         Cost: {cost:.2}\n\n\
         {chart}\n\n\
         {commentary}",
        days = t.days,
        total = t.total,
        average = t.average,
        cost = t.total * t.cost_per_kwh
    )
}

// ---- Admin ----

async fn api_admin_reset(State(state): State<AppState>) -> ApiResult {
    state.db.reset_history().await?;
    state
        .db
        .append_log(LogLevel::Warning, "Usage history reset by administrator")
        .await?;
    warn!("usage history reset");
    Ok(Json(json!({ "status": "reset" })).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("dashboard listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
