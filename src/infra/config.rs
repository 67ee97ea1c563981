//! Configuration loading from TOML files
//!
//! The binary selects the file with `--config <path>`, falling back to the
//! CONFIG_FILE environment variable and then `config/dev.toml`. A file that
//! cannot be read or parsed falls back to defaults.

use crate::domain::SpeedUnit;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Deployment identifier, logged at startup
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "fleet".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port(), request_timeout_ms: default_request_timeout_ms() }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_push_port")]
    pub port: u16,
    /// A subscriber that cannot take a line within this window is dropped
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// A client that sends no subscription request within this window is dropped
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_push_port(),
            write_timeout_ms: default_write_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

fn default_push_port() -> u16 {
    8081
}

fn default_write_timeout_ms() -> u64 {
    2000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Subscription filter for location reports (`fleet/{bus}/location`)
    #[serde(default = "default_location_topic")]
    pub location_topic: String,
    /// Subscription filter for status reports (`fleet/{bus}/status`)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            location_topic: default_location_topic(),
            status_topic: default_status_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_location_topic() -> String {
    "fleet/+/location".to_string()
}

fn default_status_topic() -> String {
    "fleet/+/status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Republish every bus delta over MQTT
    #[serde(default)]
    pub enabled: bool,
    /// Deltas go to `{prefix}/{bus_id}` (QoS 0)
    #[serde(default = "default_updates_prefix")]
    pub updates_prefix: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self { enabled: false, updates_prefix: default_updates_prefix() }
    }
}

fn default_updates_prefix() -> String {
    "fleet/updates".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Unit the driver clients report speed in
    #[serde(default)]
    pub speed_unit: SpeedUnit,
    /// Reject updates stamped further than this into the future
    #[serde(default = "default_max_future_skew_ms")]
    pub max_future_skew_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { speed_unit: SpeedUnit::default(), max_future_skew_ms: default_max_future_skew_ms() }
    }
}

fn default_max_future_skew_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Bus deltas waiting for the fan-out engine
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-subscriber outbound buffer; a full buffer drops the message
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_subscriber_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    #[default]
    FireAndForget,
    Retain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub policy: NotificationPolicy,
    /// Per-user queue depth under the retain policy
    #[serde(default = "default_retain_depth")]
    pub retain_depth: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { policy: NotificationPolicy::default(), retain_depth: default_retain_depth() }
    }
}

fn default_retain_depth() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SeedConfig {
    /// JSON file with routes, buses and reservations loaded at startup
    #[serde(default)]
    pub file: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_port: u16,
    http_request_timeout_ms: u64,
    push_enabled: bool,
    push_port: u16,
    push_write_timeout_ms: u64,
    push_handshake_timeout_ms: u64,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_location_topic: String,
    mqtt_status_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_egress_enabled: bool,
    mqtt_egress_updates_prefix: String,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    speed_unit: SpeedUnit,
    max_future_skew_ms: u64,
    fanout_queue_capacity: usize,
    subscriber_capacity: usize,
    notification_policy: NotificationPolicy,
    notification_retain_depth: usize,
    metrics_interval_secs: u64,
    seed_file: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            http_port: toml_config.http.port,
            http_request_timeout_ms: toml_config.http.request_timeout_ms,
            push_enabled: toml_config.push.enabled,
            push_port: toml_config.push.port,
            push_write_timeout_ms: toml_config.push.write_timeout_ms,
            push_handshake_timeout_ms: toml_config.push.handshake_timeout_ms,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_location_topic: toml_config.mqtt.location_topic,
            mqtt_status_topic: toml_config.mqtt.status_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_updates_prefix: toml_config.mqtt_egress.updates_prefix,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            speed_unit: toml_config.ingest.speed_unit,
            max_future_skew_ms: toml_config.ingest.max_future_skew_ms,
            // A zero-capacity tokio channel panics
            fanout_queue_capacity: toml_config.fanout.queue_capacity.max(1),
            subscriber_capacity: toml_config.fanout.subscriber_capacity.max(1),
            notification_policy: toml_config.notifications.policy,
            notification_retain_depth: toml_config.notifications.retain_depth,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            seed_file: toml_config.seed.file,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn http_request_timeout_ms(&self) -> u64 {
        self.http_request_timeout_ms
    }

    pub fn push_enabled(&self) -> bool {
        self.push_enabled
    }

    pub fn push_port(&self) -> u16 {
        self.push_port
    }

    pub fn push_write_timeout_ms(&self) -> u64 {
        self.push_write_timeout_ms
    }

    pub fn push_handshake_timeout_ms(&self) -> u64 {
        self.push_handshake_timeout_ms
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_location_topic(&self) -> &str {
        &self.mqtt_location_topic
    }

    pub fn mqtt_status_topic(&self) -> &str {
        &self.mqtt_status_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_updates_prefix(&self) -> &str {
        &self.mqtt_egress_updates_prefix
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn speed_unit(&self) -> SpeedUnit {
        self.speed_unit
    }

    pub fn max_future_skew_ms(&self) -> u64 {
        self.max_future_skew_ms
    }

    pub fn fanout_queue_capacity(&self) -> usize {
        self.fanout_queue_capacity
    }

    pub fn subscriber_capacity(&self) -> usize {
        self.subscriber_capacity
    }

    pub fn notification_policy(&self) -> NotificationPolicy {
        self.notification_policy
    }

    pub fn notification_retain_depth(&self) -> usize {
        self.notification_retain_depth
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn seed_file(&self) -> Option<&str> {
        self.seed_file.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to pick the retain policy
    pub fn with_notification_policy(mut self, policy: NotificationPolicy, depth: usize) -> Self {
        self.notification_policy = policy;
        self.notification_retain_depth = depth;
        self
    }

    /// Builder method for tests to shrink subscriber buffers
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }
}
