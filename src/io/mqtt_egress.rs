//! MQTT publisher for bus deltas
//!
//! Holds an all-buses subscription and republishes every delta to
//! `<prefix>/<bus_id>` (QoS 0, not retained) for map tiles and other
//! downstream consumers that prefer a broker to the push listener.

use crate::infra::config::Config;
use crate::services::{Fleet, Interest, Outbound, Subscription};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Topic a bus delta is published on
pub fn update_topic(prefix: &str, bus: crate::domain::BusId) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), bus)
}

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    fleet: Arc<Fleet>,
    subscription: Subscription,
    prefix: String,
}

impl MqttPublisher {
    /// Connect to the configured broker and open the all-buses subscription
    pub fn new(config: &Config, fleet: Arc<Fleet>) -> Self {
        let client_id = format!("fleet-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let subscription = fleet.subscribe(Interest::AllBuses);
        Self {
            client,
            fleet,
            subscription,
            prefix: config.mqtt_egress_updates_prefix().to_string(),
        }
    }

    /// Run until shutdown, then release the subscription
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.prefix, subscriber = %self.subscription.id, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        break;
                    }
                }
                message = self.subscription.rx.recv() => {
                    let Some(message) = message else {
                        warn!("mqtt_egress_subscription_closed");
                        break;
                    };
                    self.publish(message);
                }
            }
        }

        self.fleet.unsubscribe(self.subscription.id);
    }

    fn publish(&self, message: Outbound) {
        let Outbound::BusUpdate(snapshot) = message else {
            return;
        };
        let topic = update_topic(&self.prefix, snapshot.id);
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        // try_publish never blocks on a full client queue
        match self.client.try_publish(&topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => debug!(topic = %topic, version = %snapshot.version, "mqtt_egress_published"),
            Err(e) => debug!(topic = %topic, error = %e, "mqtt_egress_publish_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BusId;

    #[test]
    fn test_update_topic() {
        assert_eq!(update_topic("fleet/updates", BusId(7)), "fleet/updates/7");
        assert_eq!(update_topic("fleet/updates/", BusId(7)), "fleet/updates/7");
    }
}
