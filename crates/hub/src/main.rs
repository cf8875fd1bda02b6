mod api;
mod collab;
mod config;
mod db;
mod energy;
mod error;
mod ingest;
mod latch;
mod liveness;
mod recording;
mod state;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use collab::Collaborators;
use db::Db;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(path = %config_path, "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.store.url, cfg.store.busy_timeout())
        .await
        .with_context(|| format!("failed to open store {}", cfg.store.url))?;
    db.init_schema().await?;
    info!(url = %cfg.store.url, "store ready");

    // ── Shared state + collaborators ────────────────────────────────
    let shared = state::new_shared(&cfg.recording.default_label);
    let collab = Collaborators::from_config(&cfg)?;
    info!(
        reports = collab.reports.is_some(),
        notifier = collab.notifier.is_some(),
        "collaborators configured"
    );

    // ── Ingestion ───────────────────────────────────────────────────
    let ingest = ingest::start(&cfg, db.clone(), Arc::clone(&shared), collab.notifier.clone());

    // ── Web server ──────────────────────────────────────────────────
    let port = cfg.web.port;
    let app = AppState::new(&cfg, shared, db, collab);
    let mut server = tokio::spawn(web::serve(app, port));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
        res = &mut server => {
            match res {
                Ok(Ok(())) => info!("web server exited"),
                Ok(Err(e)) => error!("web server failed: {e:#}"),
                Err(e) => error!("web server task panicked: {e}"),
            }
        }
    }

    server.abort();
    ingest.stop().await;
    Ok(())
}
