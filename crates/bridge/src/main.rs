use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, time::Duration};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use irrigation_bridge::{bus, config, db::Db};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:bridge.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "bridge.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (topics, TTL, entity registry) ──────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    if cfg.fields.is_empty() {
        info!("no fields configured — inbound telemetry will only match level sensors");
    }

    // Env overrides for the broker, handy in containers.
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| cfg.broker.host.clone());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.broker.port);

    // ── Bus connection ──────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(cfg.broker.client_id.clone(), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let bus = bus::BusLink::new(client);

    // ── Stale-data sweeper ──────────────────────────────────────────
    let sweep_db = db.clone();
    let ttl = cfg.ingest.data_ttl_secs;
    let sweep_every = cfg.ingest.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_every));
        loop {
            ticker.tick().await;
            match sweep_db.sweep_expired(ttl).await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "stale sensor data evicted"),
                Err(e) => error!("stale-data sweep failed: {e:#}"),
            }
        }
    });

    // ── Listener ────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn(bus::run(
        bus,
        eventloop,
        db,
        cfg.topics.telemetry.clone(),
        shutdown_rx,
    ));

    info!(topic = %cfg.topics.telemetry, "bridge started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = listener.await;

    Ok(())
}
