//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http` - HTTP API for drivers, check-in and dashboards
//! - `push` - TCP JSON-lines listener for live subscribers
//! - `mqtt` - MQTT client for driver telemetry
//! - `mqtt_egress` - MQTT publisher for bus deltas
//! - `prometheus` - Prometheus text exposition for `/metrics`

pub mod http;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod push;

// Re-export commonly used types
pub use http::start_http_server;
pub use mqtt_egress::MqttPublisher;
pub use push::{start_push_listener, PushListenerConfig};
