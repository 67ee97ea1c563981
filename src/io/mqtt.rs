//! MQTT client for driver telemetry
//!
//! Driver devices publish to `<prefix>/<bus_id>/location` (JSON location
//! update) and `<prefix>/<bus_id>/status` (status name, bare or as
//! `{"status":"ACTIVE"}`). Everything goes through the same ingestion
//! path as the HTTP API.

use crate::domain::BusId;
use crate::infra::config::Config;
use crate::services::{Fleet, IngestOutcome};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a telemetry topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Location,
    Status,
}

/// Split `<prefix>/<bus_id>/<kind>` into bus id and kind
pub fn parse_topic(topic: &str) -> Option<(BusId, TopicKind)> {
    let mut parts = topic.rsplit('/');
    let kind = match parts.next()? {
        "location" => TopicKind::Location,
        "status" => TopicKind::Status,
        _ => return None,
    };
    let bus = parts.next()?.parse::<u64>().ok()?;
    Some((BusId(bus), kind))
}

/// Status name from a bare or JSON-wrapped payload
fn status_payload(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
        .unwrap_or_else(|| payload.trim().trim_matches('"').to_string())
}

/// Apply one telemetry message to the fleet
pub fn handle_publish(fleet: &Fleet, topic: &str, payload: &[u8]) {
    let Some((bus, kind)) = parse_topic(topic) else {
        debug!(topic = %topic, "mqtt_unknown_topic");
        return;
    };

    match kind {
        TopicKind::Location => match fleet.submit_location_json(Some(bus), payload) {
            Ok(IngestOutcome::Accepted(snapshot)) => {
                debug!(bus_id = %bus, version = %snapshot.version, "mqtt_location_applied");
            }
            Ok(IngestOutcome::Discarded) => {}
            Err(e) => debug!(bus_id = %bus, error = %e, "mqtt_location_rejected"),
        },
        TopicKind::Status => {
            let Ok(text) = std::str::from_utf8(payload) else {
                warn!(topic = %topic, "mqtt_status_invalid_utf8");
                return;
            };
            let status = status_payload(text);
            if let Err(e) = fleet.set_status_str(bus, &status) {
                warn!(bus_id = %bus, status = %status, error = %e, "mqtt_status_rejected");
            }
        }
    }
}

/// Start the MQTT client and feed telemetry into the fleet
pub async fn start_mqtt_client(
    config: &Config,
    fleet: Arc<Fleet>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("fleet-ingest-{}", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_location_topic(), QoS::AtMostOnce).await?;
    client.subscribe(config.mqtt_status_topic(), QoS::AtLeastOnce).await?;

    info!(
        location_topic = %config.mqtt_location_topic(),
        status_topic = %config.mqtt_status_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_subscribed"
    );

    // Rate-limit payload warnings to 1 per second
    let mut last_bad_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.payload.is_empty() {
                            if last_bad_warn.elapsed() > Duration::from_secs(1) {
                                warn!(topic = %publish.topic, "mqtt_empty_payload");
                                last_bad_warn = Instant::now();
                            }
                            continue;
                        }
                        handle_publish(&fleet, &publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BusRecord, BusStatus};
    use crate::infra::Metrics;
    use chrono::Utc;

    fn fleet() -> Fleet {
        let (fleet, _engine) = Fleet::new(&Config::default(), Arc::new(Metrics::new()));
        fleet
            .register_bus(BusRecord {
                id: BusId(12),
                number: "AA-112".to_string(),
                capacity: 40,
                route_id: None,
                driver_id: None,
            })
            .unwrap();
        fleet
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(parse_topic("fleet/12/location"), Some((BusId(12), TopicKind::Location)));
        assert_eq!(parse_topic("fleet/12/status"), Some((BusId(12), TopicKind::Status)));
        assert_eq!(parse_topic("a/b/fleet/3/status"), Some((BusId(3), TopicKind::Status)));
        assert_eq!(parse_topic("fleet/abc/location"), None);
        assert_eq!(parse_topic("fleet/12/doors"), None);
        assert_eq!(parse_topic("location"), None);
    }

    #[test]
    fn test_status_payload_forms() {
        assert_eq!(status_payload("ACTIVE"), "ACTIVE");
        assert_eq!(status_payload("\"waiting\""), "waiting");
        assert_eq!(status_payload(r#"{"status":"DELAYED"}"#), "DELAYED");
    }

    #[test]
    fn test_handle_publish_applies_telemetry() {
        let fleet = fleet();
        handle_publish(&fleet, "fleet/12/status", b"{\"status\":\"waiting\"}");
        assert_eq!(fleet.bus(BusId(12)).unwrap().status, BusStatus::Waiting);

        let payload = format!(r#"{{"latitude":9.01,"longitude":38.76,"timestamp":"{}"}}"#, Utc::now().to_rfc3339());
        handle_publish(&fleet, "fleet/12/location", payload.as_bytes());
        let bus = fleet.bus(BusId(12)).unwrap();
        assert_eq!(bus.position.map(|p| p.latitude), Some(9.01));

        // Rejected transitions and unknown buses leave state alone
        handle_publish(&fleet, "fleet/12/status", b"EMERGENCYY");
        handle_publish(&fleet, "fleet/99/location", payload.as_bytes());
        assert_eq!(fleet.bus(BusId(12)).unwrap().status, BusStatus::Waiting);
    }
}
