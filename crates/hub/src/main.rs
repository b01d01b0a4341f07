mod aggregate;
mod config;
mod db;
mod device;
mod dispatch;
mod frame;
mod reader;
mod relay;
mod serial;
mod state;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aggregate::TelemetryAggregator;
use db::UsageStore;
use dispatch::CommandDispatcher;
use reader::ReaderLoop;
use relay::RelayTracker;
use serial::{ConnectionManager, SerialPortOpener};
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "smartfarm.toml".to_string());
    let mut cfg = config::load(&config_path)?;

    if let Ok(port) = env::var("SERIAL_PORT") {
        cfg.serial.port = Some(port);
    }
    if let Ok(port) = env::var("WEB_PORT") {
        cfg.web.port = port
            .parse()
            .with_context(|| format!("WEB_PORT is not a port number: {port}"))?;
    }
    cfg.validate().context("invalid configuration after env overrides")?;

    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:smartfarm.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let store = UsageStore::connect(&db_url).await?;
    store.migrate().await?;
    info!(%db_url, "usage store ready");

    // ── Components ──────────────────────────────────────────────────
    let conn = Arc::new(ConnectionManager::new(SerialPortOpener::new(cfg.serial.clone())));
    let relays = Arc::new(RelayTracker::new());
    let shared = SystemState::shared();
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&conn),
        Arc::clone(&relays),
        Arc::clone(&shared),
    ));
    let aggregator = TelemetryAggregator::new(store.clone(), Arc::clone(&relays));

    shared.write().await.record_system("hub started".to_string());

    // ── Reader loop ─────────────────────────────────────────────────
    let reader = ReaderLoop::new(
        Arc::clone(&conn),
        store.clone(),
        Arc::clone(&shared),
        Duration::from_millis(cfg.serial.poll_interval_ms),
    );
    tokio::spawn(reader.run());

    // ── HTTP API ────────────────────────────────────────────────────
    let app = AppState {
        shared,
        conn,
        relays,
        dispatcher,
        aggregator,
        store,
        devices: Arc::new(cfg.devices.clone()),
        window_hours: cfg.usage.window_hours,
    };
    web::serve(app, &cfg.web).await
}
