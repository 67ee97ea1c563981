//! Fleet facade - wires the core services together
//!
//! Transports (HTTP, push listener, MQTT) talk to [`Fleet`] only. It owns
//! the state store, ingestion gateway, reservation ledger, notification
//! dispatcher and subscription registry, and adds the cross-cutting rules
//! that span them: alerts on EMERGENCY and DELAYED, retiring buses that
//! still carry reservations, and implicit bus interest for user channels.

use crate::domain::{
    BusId, BusRecord, BusSnapshot, BusStatus, FleetError, LocationUpdate, Notification,
    NotificationKind, Reservation, Route, RouteId, StatusCommand, UserId,
};
use crate::infra::seed::FleetSeed;
use crate::infra::{Config, Metrics};
use crate::services::fanout::{create_fanout, FanoutEngine};
use crate::services::ingestion::{IngestOutcome, IngestionGateway};
use crate::services::ledger::{CheckInReceipt, ReservationLedger};
use crate::services::notifier::{DeliveryPolicy, NotificationDispatcher};
use crate::services::registry::{Interest, SubscriberId, Subscription, SubscriptionRegistry};
use crate::services::state_store::{BusStateStore, TransitionOutcome};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Fleet-wide counts for the dashboard header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetStatistics {
    pub total_buses: usize,
    pub inactive_buses: usize,
    pub waiting_buses: usize,
    pub active_buses: usize,
    pub delayed_buses: usize,
    pub maintenance_buses: usize,
    pub emergency_buses: usize,
    pub total_passengers: u64,
    pub total_capacity: u64,
}

/// Counts of records loaded from a seed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub routes: usize,
    pub buses: usize,
    pub reservations: usize,
}

/// Geographic bounding box, inclusive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Area {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Area {
    #[inline]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}

pub struct Fleet {
    store: Arc<BusStateStore>,
    ingestion: IngestionGateway,
    ledger: ReservationLedger,
    notifier: Arc<NotificationDispatcher>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<Metrics>,
}

impl Fleet {
    /// Build the core. The returned engine must be spawned for broadcasts to flow.
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> (Self, FanoutEngine) {
        let registry = Arc::new(SubscriptionRegistry::new(config.subscriber_capacity(), metrics.clone()));
        let (fanout, engine) =
            create_fanout(registry.clone(), metrics.clone(), config.fanout_queue_capacity());
        let store = Arc::new(BusStateStore::new(fanout, metrics.clone()));
        let policy =
            DeliveryPolicy::from_config(config.notification_policy(), config.notification_retain_depth());
        let notifier = Arc::new(NotificationDispatcher::new(registry.clone(), policy, metrics.clone()));
        let ingestion = IngestionGateway::new(
            store.clone(),
            metrics.clone(),
            config.speed_unit(),
            config.max_future_skew_ms(),
        );
        let ledger = ReservationLedger::new(store.clone(), notifier.clone(), metrics.clone());

        let fleet = Self { store, ingestion, ledger, notifier, registry, metrics };
        (fleet, engine)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    // ---- registration ----

    pub fn register_route(&self, route: Route) {
        self.store.register_route(route);
    }

    pub fn register_bus(&self, record: BusRecord) -> Result<BusSnapshot, FleetError> {
        self.store.register_bus(record)
    }

    pub fn assign_driver(&self, bus: BusId, driver: Option<UserId>) -> Result<BusSnapshot, FleetError> {
        self.store.assign_driver(bus, driver)
    }

    /// Remove a bus that no open reservation references
    pub fn retire_bus(&self, bus: BusId) -> Result<(), FleetError> {
        self.ledger.retire_bus(bus)
    }

    /// Load routes, buses and reservations, in that order
    pub fn apply_seed(&self, seed: FleetSeed) -> anyhow::Result<SeedSummary> {
        let mut summary = SeedSummary::default();
        for route in seed.routes {
            self.register_route(route);
            summary.routes += 1;
        }
        for bus in seed.buses {
            let id = bus.id;
            self.register_bus(bus).with_context(|| format!("Failed to seed bus {id}"))?;
            summary.buses += 1;
        }
        for reservation in seed.reservations {
            let code = reservation.confirmation_code.clone();
            self.ledger
                .register(reservation)
                .with_context(|| format!("Failed to seed reservation {code}"))?;
            summary.reservations += 1;
        }
        info!(
            routes = %summary.routes,
            buses = %summary.buses,
            reservations = %summary.reservations,
            "seed_loaded"
        );
        Ok(summary)
    }

    // ---- ingestion & status ----

    pub fn submit_location(&self, bus: BusId, update: LocationUpdate) -> Result<IngestOutcome, FleetError> {
        self.ingestion.submit(bus, update)
    }

    pub fn submit_location_json(&self, bus: Option<BusId>, payload: &[u8]) -> Result<IngestOutcome, FleetError> {
        self.ingestion.submit_json(bus, payload)
    }

    /// Explicit status change. A move into DELAYED alerts the bus's passengers.
    pub fn set_status(&self, bus: BusId, status: BusStatus) -> Result<BusSnapshot, FleetError> {
        let outcome = self.store.apply_status(bus, StatusCommand::Set(status))?;
        self.after_transition(&outcome, None);
        Ok(outcome.snapshot().clone())
    }

    /// Status change from a free-form string (`"active"`, `"WAITING"`, ...)
    pub fn set_status_str(&self, bus: BusId, status: &str) -> Result<BusSnapshot, FleetError> {
        let outcome = self.ingestion.set_status(bus, status)?;
        self.after_transition(&outcome, None);
        Ok(outcome.snapshot().clone())
    }

    /// Driver-triggered alert; pre-empts any state
    pub fn trigger_emergency(&self, bus: BusId, message: Option<&str>) -> Result<BusSnapshot, FleetError> {
        let outcome = self.store.apply_status(bus, StatusCommand::Set(BusStatus::Emergency))?;
        self.after_transition(&outcome, message);
        Ok(outcome.snapshot().clone())
    }

    /// Leave EMERGENCY, back to the pre-empted state or WAITING
    pub fn clear_emergency(&self, bus: BusId) -> Result<BusSnapshot, FleetError> {
        let outcome = self.store.apply_status(bus, StatusCommand::ClearEmergency)?;
        Ok(outcome.snapshot().clone())
    }

    pub fn set_passenger_count(&self, bus: BusId, count: u32) -> Result<BusSnapshot, FleetError> {
        self.store.set_passenger_count(bus, count)
    }

    fn after_transition(&self, outcome: &TransitionOutcome, message: Option<&str>) {
        let TransitionOutcome::Changed { snapshot, .. } = outcome else {
            return;
        };
        match snapshot.status {
            BusStatus::Emergency => {
                let text = match message.map(str::trim).filter(|m| !m.is_empty()) {
                    Some(m) => m.to_string(),
                    None => format!("Emergency reported on bus {}", snapshot.number),
                };
                let mut recipients = self.ledger.passengers_on(snapshot.id);
                if let Some(driver) = snapshot.driver_id {
                    if !recipients.contains(&driver) {
                        recipients.push(driver);
                    }
                }
                for user in &recipients {
                    self.notifier.notify(Notification::new(*user, NotificationKind::Emergency, text.clone()));
                }
                warn!(bus_id = %snapshot.id, recipients = %recipients.len(), "emergency_alert_sent");
            }
            BusStatus::Delayed => {
                let text = format!("Bus {} is running behind schedule", snapshot.number);
                let passengers = self.ledger.passengers_on(snapshot.id);
                for user in &passengers {
                    self.notifier.notify(Notification::new(*user, NotificationKind::DelayAlert, text.clone()));
                }
                info!(bus_id = %snapshot.id, recipients = %passengers.len(), "delay_alert_sent");
            }
            _ => {}
        }
    }

    // ---- reservations ----

    pub fn register_reservation(&self, reservation: Reservation) -> Result<Reservation, FleetError> {
        self.ledger.register(reservation)
    }

    pub fn check_in(&self, code: &str) -> Result<CheckInReceipt, FleetError> {
        self.ledger.check_in(code)
    }

    pub fn confirm_reservation(&self, code: &str) -> Result<Reservation, FleetError> {
        self.ledger.confirm(code)
    }

    pub fn cancel_reservation(&self, code: &str, reason: Option<&str>) -> Result<Reservation, FleetError> {
        self.ledger.cancel(code, reason)
    }

    pub fn reservation(&self, code: &str) -> Option<Reservation> {
        self.ledger.get(code)
    }

    pub fn reservations_for_bus_on(&self, bus: BusId, day: NaiveDate) -> Result<Vec<Reservation>, FleetError> {
        if !self.store.contains(bus) {
            return Err(FleetError::BusNotFound(bus));
        }
        Ok(self.ledger.reservations_for_bus_on(bus, day))
    }

    /// The driver's list for the current UTC day
    pub fn reservations_for_bus_today(&self, bus: BusId) -> Result<Vec<Reservation>, FleetError> {
        self.reservations_for_bus_on(bus, Utc::now().date_naive())
    }

    // ---- subscriptions ----

    /// Open a push channel.
    ///
    /// A user channel also follows the user's buses: the one they drive and
    /// the ones they hold open reservations on. Retained notifications are
    /// flushed into it straight away.
    pub fn subscribe(&self, interest: Interest) -> Subscription {
        let Interest::User(user) = interest else {
            return self.registry.subscribe(interest);
        };
        let subscription = self.notifier.open_channel(user, || self.registry.subscribe(interest));
        let mut buses = self.ledger.buses_for_passenger(user);
        if let Some(bus) = self.store.bus_for_driver(user) {
            buses.push(bus);
        }
        for bus in buses {
            self.registry.add_interest(subscription.id, Interest::Bus(bus));
        }
        subscription
    }

    pub fn add_interest(&self, id: SubscriberId, interest: Interest) -> bool {
        self.registry.add_interest(id, interest)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Direct notification, e.g. from an operator console
    pub fn notify(&self, user: UserId, kind: NotificationKind, message: &str) {
        self.notifier.notify(Notification::new(user, kind, message));
    }

    pub fn pending_notifications(&self, user: UserId) -> usize {
        self.notifier.pending_len(user)
    }

    // ---- queries ----

    /// Full bus list, most urgent first
    pub fn buses(&self) -> Vec<BusSnapshot> {
        let mut list = self.store.snapshots();
        list.sort_by(|a, b| {
            b.status.display_priority().cmp(&a.status.display_priority()).then(a.id.cmp(&b.id))
        });
        list
    }

    pub fn bus(&self, id: BusId) -> Result<BusSnapshot, FleetError> {
        self.store.snapshot(id).ok_or(FleetError::BusNotFound(id))
    }

    pub fn bus_by_number(&self, number: &str) -> Option<BusSnapshot> {
        self.store.snapshots().into_iter().find(|b| b.number.eq_ignore_ascii_case(number.trim()))
    }

    pub fn buses_by_status(&self, status: BusStatus) -> Vec<BusSnapshot> {
        self.filtered(|b| b.status == status)
    }

    pub fn buses_by_route(&self, route: RouteId) -> Vec<BusSnapshot> {
        self.filtered(|b| b.route_id() == Some(route))
    }

    /// Buses with at least one free seat
    pub fn available_buses(&self) -> Vec<BusSnapshot> {
        self.filtered(|b| b.current_passengers < b.capacity)
    }

    /// Buses whose last known position lies inside `area`
    pub fn buses_in_area(&self, area: Area) -> Vec<BusSnapshot> {
        self.filtered(|b| b.position.as_ref().is_some_and(|p| area.contains(p.latitude, p.longitude)))
    }

    pub fn statistics(&self) -> FleetStatistics {
        let mut stats = FleetStatistics::default();
        for bus in self.store.snapshots() {
            stats.total_buses += 1;
            stats.total_passengers += u64::from(bus.current_passengers);
            stats.total_capacity += u64::from(bus.capacity);
            match bus.status {
                BusStatus::Inactive => stats.inactive_buses += 1,
                BusStatus::Waiting => stats.waiting_buses += 1,
                BusStatus::Active => stats.active_buses += 1,
                BusStatus::Delayed => stats.delayed_buses += 1,
                BusStatus::Maintenance => stats.maintenance_buses += 1,
                BusStatus::Emergency => stats.emergency_buses += 1,
            }
        }
        stats
    }

    pub fn bus_count(&self) -> usize {
        self.store.len()
    }

    fn filtered(&self, keep: impl Fn(&BusSnapshot) -> bool) -> Vec<BusSnapshot> {
        let mut list: Vec<BusSnapshot> = self.store.snapshots().into_iter().filter(|b| keep(b)).collect();
        list.sort_by_key(|b| b.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReservationId, ReservationStatus};
    use crate::infra::NotificationPolicy;
    use crate::services::registry::Outbound;
    use chrono::Duration;

    fn fleet(config: Config) -> (Fleet, FanoutEngine) {
        let (fleet, engine) = Fleet::new(&config, Arc::new(Metrics::new()));
        fleet.register_route(Route {
            id: RouteId(3),
            number: "R3".to_string(),
            name: "Piassa - Bole".to_string(),
            stops: vec!["Piassa".into(), "Bole".into()],
            fare: 5.0,
            operating_hours: String::new(),
        });
        for (id, number) in [(1, "AA-101"), (2, "AA-102")] {
            fleet
                .register_bus(BusRecord {
                    id: BusId(id),
                    number: number.to_string(),
                    capacity: 50,
                    route_id: Some(RouteId(3)),
                    driver_id: Some(UserId(100 + id)),
                })
                .unwrap();
        }
        (fleet, engine)
    }

    fn reservation(code: &str, passenger: u64, bus: u64) -> Reservation {
        Reservation {
            id: ReservationId(passenger),
            confirmation_code: code.to_string(),
            passenger_id: UserId(passenger),
            bus_id: BusId(bus),
            boarding_stop: "Piassa".to_string(),
            alighting_stop: "Bole".to_string(),
            seat_number: 1,
            scheduled_departure: Utc::now() + Duration::hours(1),
            status: ReservationStatus::Confirmed,
            checked_in_at: None,
        }
    }

    fn notifications(sub: &mut Subscription) -> Vec<Notification> {
        std::iter::from_fn(|| sub.rx.try_recv().ok())
            .filter_map(|m| match m {
                Outbound::Notification(n) => Some(n),
                Outbound::BusUpdate(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_emergency_alerts_driver_and_passengers() {
        let (fleet, _engine) = fleet(Config::default());
        fleet.register_reservation(reservation("CONF-1", 5, 1)).unwrap();
        let mut passenger = fleet.subscribe(Interest::User(UserId(5)));
        let mut driver = fleet.subscribe(Interest::User(UserId(101)));
        let mut other = fleet.subscribe(Interest::User(UserId(102)));

        let snap = fleet.trigger_emergency(BusId(1), Some("Engine fire")).unwrap();
        assert_eq!(snap.status, BusStatus::Emergency);

        let got = notifications(&mut passenger);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, NotificationKind::Emergency);
        assert_eq!(got[0].message, "Engine fire");
        assert_eq!(notifications(&mut driver).len(), 1);
        assert!(notifications(&mut other).is_empty());

        let cleared = fleet.clear_emergency(BusId(1)).unwrap();
        assert_eq!(cleared.status, BusStatus::Inactive);
    }

    #[test]
    fn test_delay_alert_only_on_change() {
        let (fleet, _engine) = fleet(Config::default());
        fleet.register_reservation(reservation("CONF-1", 5, 1)).unwrap();
        let mut passenger = fleet.subscribe(Interest::User(UserId(5)));

        fleet.set_status(BusId(1), BusStatus::Waiting).unwrap();
        fleet.set_status(BusId(1), BusStatus::Active).unwrap();
        fleet.set_status(BusId(1), BusStatus::Delayed).unwrap();
        fleet.set_status(BusId(1), BusStatus::Delayed).unwrap();

        let got = notifications(&mut passenger);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, NotificationKind::DelayAlert);
    }

    #[test]
    fn test_retire_bus_blocked_by_open_reservation() {
        let (fleet, _engine) = fleet(Config::default());
        fleet.register_reservation(reservation("CONF-1", 5, 1)).unwrap();
        assert_eq!(fleet.retire_bus(BusId(1)), Err(FleetError::BusInUse(BusId(1))));

        fleet.cancel_reservation("CONF-1", None).unwrap();
        assert_eq!(fleet.retire_bus(BusId(1)), Ok(()));
        assert_eq!(fleet.bus(BusId(1)), Err(FleetError::BusNotFound(BusId(1))));
        assert_eq!(fleet.retire_bus(BusId(1)), Err(FleetError::BusNotFound(BusId(1))));
    }

    #[test]
    fn test_user_channel_follows_driven_bus() {
        let (fleet, mut engine) = fleet(Config::default());
        let mut driver = fleet.subscribe(Interest::User(UserId(101)));
        engine.drain();
        while driver.rx.try_recv().is_ok() {}

        fleet.set_status(BusId(1), BusStatus::Waiting).unwrap();
        fleet.set_status(BusId(2), BusStatus::Waiting).unwrap();
        engine.drain();

        let updates: Vec<BusId> = std::iter::from_fn(|| driver.rx.try_recv().ok())
            .filter_map(|m| match m {
                Outbound::BusUpdate(s) => Some(s.id),
                Outbound::Notification(_) => None,
            })
            .collect();
        assert_eq!(updates, vec![BusId(1)]);
    }

    #[test]
    fn test_retained_notifications_flushed_on_subscribe() {
        let config = Config::default().with_notification_policy(NotificationPolicy::Retain, 8);
        let (fleet, _engine) = fleet(config);
        fleet.register_reservation(reservation("CONF-1", 5, 1)).unwrap();
        fleet.check_in("CONF-1").unwrap();
        assert_eq!(fleet.pending_notifications(UserId(5)), 1);

        let mut sub = fleet.subscribe(Interest::User(UserId(5)));
        let got = notifications(&mut sub);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, NotificationKind::CheckIn);
        assert_eq!(fleet.pending_notifications(UserId(5)), 0);
    }

    #[test]
    fn test_queries() {
        let (fleet, _engine) = fleet(Config::default());
        fleet.trigger_emergency(BusId(2), None).unwrap();
        fleet.set_passenger_count(BusId(1), 50).unwrap();
        let t = Utc::now();
        fleet
            .submit_location(
                BusId(1),
                LocationUpdate {
                    bus_id: None,
                    latitude: 9.03,
                    longitude: 38.74,
                    speed: None,
                    heading: None,
                    accuracy: None,
                    timestamp: t,
                    sequence: None,
                },
            )
            .unwrap();

        let order: Vec<BusId> = fleet.buses().into_iter().map(|b| b.id).collect();
        assert_eq!(order, vec![BusId(2), BusId(1)]);

        assert_eq!(fleet.bus_by_number("aa-101").map(|b| b.id), Some(BusId(1)));
        assert_eq!(fleet.buses_by_status(BusStatus::Emergency).len(), 1);
        assert_eq!(fleet.buses_by_route(RouteId(3)).len(), 2);
        assert_eq!(fleet.available_buses().into_iter().map(|b| b.id).collect::<Vec<_>>(), vec![BusId(2)]);

        let area = Area { min_lat: 9.0, max_lat: 9.1, min_lon: 38.7, max_lon: 38.8 };
        assert_eq!(fleet.buses_in_area(area).len(), 1);

        let stats = fleet.statistics();
        assert_eq!(stats.total_buses, 2);
        assert_eq!(stats.emergency_buses, 1);
        assert_eq!(stats.inactive_buses, 1);
        assert_eq!(stats.total_passengers, 50);
        assert_eq!(stats.total_capacity, 100);
    }

    #[test]
    fn test_apply_seed_fails_with_context() {
        let (fleet, _engine) = fleet(Config::default());
        let seed: FleetSeed = serde_json::from_str(
            r#"{"buses":[{"id":9,"number":"AA-109","capacity":30,"route_id":77}]}"#,
        )
        .unwrap();
        let err = fleet.apply_seed(seed).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to seed bus 9"));
    }
}
