//! Infrastructure - configuration, metrics, broker and seed data
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Embedded MQTT broker (rumqttd)
//! - `seed` - Startup fleet data (routes, buses, reservations)

pub mod broker;
pub mod config;
pub mod metrics;
pub mod seed;

// Re-export commonly used types
pub use config::{Config, NotificationPolicy};
pub use metrics::Metrics;
pub use seed::FleetSeed;
