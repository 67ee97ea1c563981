//! Fleet dispatch - live bus telemetry and dispatch core
//!
//! Ingests driver location and status updates, keeps the authoritative live
//! state per bus, fans deltas out to subscribers and runs passenger check-in.
//!
//! Module structure:
//! - `domain/` - Core types (buses, status machine, reservations, notifications)
//! - `io/` - External interfaces (HTTP API, push listener, MQTT ingest and egress)
//! - `services/` - State store, ingestion, registry, fan-out, ledger, notifier
//! - `infra/` - Infrastructure (Config, Metrics, Broker, Seed data)

use clap::Parser;
use fleet_dispatch::infra::{Config, FleetSeed, Metrics};
use fleet_dispatch::io::{start_http_server, start_push_listener, MqttPublisher, PushListenerConfig};
use fleet_dispatch::services::Fleet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Fleet dispatch - live bus tracking, check-in and notifications
#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Seed file with routes, buses and reservations (overrides [seed] file)
    #[arg(short, long)]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug for per-update visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "fleet-dispatch starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    // Embedded broker first so the MQTT clients below can connect to it
    fleet_dispatch::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        http_port = %config.http_port(),
        push_enabled = %config.push_enabled(),
        push_port = %config.push_port(),
        mqtt_enabled = %config.mqtt_enabled(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        speed_unit = ?config.speed_unit(),
        notification_policy = ?config.notification_policy(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let (fleet, fanout_engine) = Fleet::new(&config, metrics.clone());
    let fleet = Arc::new(fleet);

    if let Some(path) = args.seed.as_deref().or(config.seed_file()) {
        let seed = FleetSeed::from_file(path)?;
        fleet.apply_seed(seed)?;
    }

    // Fan-out worker: drains the broadcast queue into subscriber channels
    tokio::spawn(fanout_engine.run());

    // HTTP API (driver, check-in, dashboard, /metrics)
    let http_fleet = fleet.clone();
    let http_shutdown = shutdown_rx.clone();
    let http_port = config.http_port();
    let site_id = config.site_id().to_string();
    let request_timeout = Duration::from_millis(config.http_request_timeout_ms());
    tokio::spawn(async move {
        if let Err(e) =
            start_http_server(http_port, http_fleet, site_id, request_timeout, http_shutdown).await
        {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Push listener for live subscribers
    if config.push_enabled() {
        let push_config = PushListenerConfig {
            port: config.push_port(),
            write_timeout: Duration::from_millis(config.push_write_timeout_ms()),
            handshake_timeout: Duration::from_millis(config.push_handshake_timeout_ms()),
        };
        let push_fleet = fleet.clone();
        let push_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_push_listener(push_config, push_fleet, push_shutdown).await {
                tracing::error!(error = %e, "Push listener error");
            }
        });
    }

    // MQTT telemetry ingest
    if config.mqtt_enabled() {
        let mqtt_config = config.clone();
        let mqtt_fleet = fleet.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                fleet_dispatch::io::mqtt::start_mqtt_client(&mqtt_config, mqtt_fleet, mqtt_shutdown).await
            {
                tracing::error!(error = %e, "MQTT client error");
            }
        });
    }

    // MQTT egress of bus deltas
    if config.mqtt_egress_enabled() {
        let publisher = MqttPublisher::new(&config, fleet.clone());
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
    }

    // Periodic metrics summary
    let reporter_fleet = fleet.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = reporter_fleet
                .metrics()
                .report(reporter_fleet.bus_count(), reporter_fleet.subscriber_count());
            summary.log();
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let listeners and publishers observe the signal
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("fleet-dispatch shutdown complete");
    Ok(())
}
