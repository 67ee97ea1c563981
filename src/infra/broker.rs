//! Embedded MQTT broker using rumqttd
//!
//! Lets driver devices publish telemetry straight to the dispatch host when
//! no site broker exists. Disabled unless `[broker] enabled = true`.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

/// Driver payloads are small JSON documents
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// One connection per device plus dashboards and egress
const MAX_CONNECTIONS: usize = 5000;

/// Parse `bind_address:port` into a listen address
pub fn listen_addr(bind_address: &str, port: u16) -> Option<SocketAddr> {
    format!("{bind_address}:{port}").parse().ok()
}

/// Start the embedded broker on its own thread if enabled.
///
/// Returns false when disabled or the bind address is invalid.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let bind_address = app_config.broker_bind_address();
    let port = app_config.broker_port();
    let Some(listen) = listen_addr(bind_address, port) else {
        warn!(bind_address = %bind_address, port = %port, "broker_invalid_bind_address");
        return false;
    };

    let router_config = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: MAX_CONNECTIONS,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_BYTES,
                max_inflight_count: 100,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    let config = Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    };

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the life of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give the broker time to bind before clients connect
    thread::sleep(std::time::Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr("0.0.0.0", 1883), Some("0.0.0.0:1883".parse().unwrap()));
        assert!(listen_addr("not an ip", 1883).is_none());
    }

    #[test]
    fn test_disabled_broker_not_started() {
        assert!(!start_embedded_broker(&AppConfig::default()));
    }
}
