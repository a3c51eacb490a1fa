mod alerts;
mod catalog;
mod config;
mod db;
mod error;
mod irrigation;
mod model;
mod retry;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use alerts::AlertRegistry;
use catalog::PlotCatalog;
use db::Db;
use irrigation::IrrigationEngine;
use retry::RetryScheduler;
use store::PlotStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let port: u16 = match env::var("WEB_PORT") {
        Ok(s) => s
            .trim()
            .parse()
            .with_context(|| format!("WEB_PORT is not a port number: {s:?}"))?,
        Err(_) => 8080,
    };
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (retry settings, seed plots + sensors) ──────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let settings = cfg.retry_settings();

    let plots = db.list_plots().await?;
    if plots.is_empty() {
        tracing::warn!("no plots configured in the database");
    }
    tracing::info!(
        plots = plots.len(),
        alerted = plots.iter().filter(|p| p.has_alert).count(),
        tries_count = settings.max_attempts,
        interval_sec = settings.interval.as_secs(),
        "db ready"
    );

    // ── Shared state (ephemeral activity feed) ──────────────────────
    let shared = state::shared();
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Irrigation core ─────────────────────────────────────────────
    let store: Arc<dyn PlotStore> = Arc::new(db.clone());
    let scheduler = RetryScheduler::new(Arc::clone(&store), shared.clone(), settings);

    let resumed = scheduler
        .resume_orphaned()
        .await
        .context("failed to resume interrupted retry campaigns")?;
    if resumed > 0 {
        tracing::info!(resumed, "interrupted retry campaigns restarted");
    }

    let app = web::AppState {
        engine: Arc::new(IrrigationEngine::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            shared.clone(),
        )),
        alerts: Arc::new(AlertRegistry::new(store, shared.clone())),
        catalog: Arc::new(PlotCatalog::new(db, Arc::clone(&scheduler), shared.clone())),
        shared,
    };

    // ── Web server (until ctrl-c) ───────────────────────────────────
    web::serve(app, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await?;

    scheduler.shutdown().await;
    tracing::info!("controller stopped");
    Ok(())
}
