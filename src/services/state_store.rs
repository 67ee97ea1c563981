//! Bus state store - the authoritative live state of every bus
//!
//! Each bus sits behind its own `parking_lot::Mutex` inside a `DashMap`, so
//! writers for different buses never contend and writers for the same bus
//! serialize. The `Arc` is cloned out of the map before locking; no map
//! guard is held while a bus lock is taken.
//!
//! Every accepted mutation bumps the bus version and is handed to the
//! fan-out queue *before* the bus lock is released. This keeps broadcast
//! order equal to commit order for each bus.

use crate::domain::{
    Bus, BusId, BusRecord, BusSnapshot, BusStatus, FleetError, OrderKey, Position, Route, RouteId,
    RouteSummary, StatusCommand, UserId,
};
use crate::infra::Metrics;
use crate::services::fanout::FanoutHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of applying a location update
#[derive(Debug, Clone, PartialEq)]
pub enum LocationOutcome {
    Accepted(BusSnapshot),
    /// Key not newer than the stored one; state untouched, nothing broadcast
    Stale { current: OrderKey, received: OrderKey },
}

/// Result of a permitted status command
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Changed { from: BusStatus, snapshot: BusSnapshot },
    /// Same-state command, nothing broadcast
    Unchanged(BusSnapshot),
}

impl TransitionOutcome {
    pub fn snapshot(&self) -> &BusSnapshot {
        match self {
            TransitionOutcome::Changed { snapshot, .. } => snapshot,
            TransitionOutcome::Unchanged(snapshot) => snapshot,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, TransitionOutcome::Changed { .. })
    }
}

pub struct BusStateStore {
    buses: DashMap<BusId, Arc<Mutex<Bus>>>,
    routes: DashMap<RouteId, Arc<Route>>,
    fanout: FanoutHandle,
    metrics: Arc<Metrics>,
}

impl BusStateStore {
    pub fn new(fanout: FanoutHandle, metrics: Arc<Metrics>) -> Self {
        Self { buses: DashMap::new(), routes: DashMap::new(), fanout, metrics }
    }

    /// Add or replace a route definition
    pub fn register_route(&self, route: Route) {
        info!(route_id = %route.id, number = %route.number, "route_registered");
        self.routes.insert(route.id, Arc::new(route));
    }

    pub fn route(&self, id: RouteId) -> Option<Arc<Route>> {
        self.routes.get(&id).map(|r| r.value().clone())
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    /// Register a new bus: INACTIVE, empty, no position
    pub fn register_bus(&self, record: BusRecord) -> Result<BusSnapshot, FleetError> {
        if record.capacity == 0 {
            return Err(FleetError::Validation(format!("bus {} has zero capacity", record.id)));
        }
        if let Some(route_id) = record.route_id {
            if !self.routes.contains_key(&route_id) {
                return Err(FleetError::RouteNotFound(route_id));
            }
        }

        let id = record.id;
        let cell = match self.buses.entry(id) {
            Entry::Occupied(_) => return Err(FleetError::DuplicateBus(id)),
            Entry::Vacant(slot) => slot.insert(Arc::new(Mutex::new(Bus::new(record)))).value().clone(),
        };

        let mut bus = cell.lock();
        let snapshot = self.commit(&mut bus);
        info!(bus_id = %id, number = %bus.number, capacity = %bus.capacity, "bus_registered");
        Ok(snapshot)
    }

    pub fn remove_bus(&self, id: BusId) -> Result<(), FleetError> {
        self.buses.remove(&id).map(|_| ()).ok_or(FleetError::BusNotFound(id))?;
        info!(bus_id = %id, "bus_removed");
        Ok(())
    }

    /// Assign (or clear) the driver of a bus
    pub fn assign_driver(&self, id: BusId, driver: Option<UserId>) -> Result<BusSnapshot, FleetError> {
        let cell = self.cell(id)?;
        let mut bus = cell.lock();
        bus.driver_id = driver;
        info!(bus_id = %id, driver_id = ?driver, "driver_assigned");
        Ok(self.commit(&mut bus))
    }

    /// Last-write-wins position update keyed by `(timestamp, sequence)`
    pub fn apply_location(
        &self,
        id: BusId,
        position: Position,
        key: OrderKey,
    ) -> Result<LocationOutcome, FleetError> {
        let cell = self.cell(id)?;
        let mut bus = cell.lock();

        if let Some(current) = bus.last_key {
            if key <= current {
                return Ok(LocationOutcome::Stale { current, received: key });
            }
        }

        bus.position = Some(position);
        bus.last_key = Some(key);
        let snapshot = self.commit(&mut bus);
        debug!(bus_id = %id, version = %snapshot.version, "location_accepted");
        Ok(LocationOutcome::Accepted(snapshot))
    }

    /// Run a status command through the bus's state machine
    pub fn apply_status(&self, id: BusId, command: StatusCommand) -> Result<TransitionOutcome, FleetError> {
        let cell = self.cell(id)?;
        let mut bus = cell.lock();

        let previous = match bus.status.apply(command) {
            Ok(previous) => previous,
            Err(e) => {
                self.metrics.record_transition(false);
                return Err(e);
            }
        };

        match previous {
            Some(from) => {
                self.metrics.record_transition(true);
                let snapshot = self.commit(&mut bus);
                info!(bus_id = %id, from = %from, to = %snapshot.status, "status_changed");
                Ok(TransitionOutcome::Changed { from, snapshot })
            }
            None => {
                let route = self.summary(bus.route_id);
                Ok(TransitionOutcome::Unchanged(bus.snapshot(route)))
            }
        }
    }

    /// One passenger boards. Fails without side effects when the bus is full.
    pub fn record_boarding(&self, id: BusId) -> Result<BusSnapshot, FleetError> {
        let cell = self.cell(id)?;
        let mut bus = cell.lock();
        if !bus.has_free_seat() {
            return Err(FleetError::CapacityExceeded {
                capacity: bus.capacity,
                requested: bus.current_passengers.saturating_add(1),
            });
        }
        bus.current_passengers += 1;
        Ok(self.commit(&mut bus))
    }

    /// Manual headcount from the driver
    pub fn set_passenger_count(&self, id: BusId, count: u32) -> Result<BusSnapshot, FleetError> {
        let cell = self.cell(id)?;
        let mut bus = cell.lock();
        if count > bus.capacity {
            return Err(FleetError::CapacityExceeded { capacity: bus.capacity, requested: count });
        }
        if count == bus.current_passengers {
            let route = self.summary(bus.route_id);
            return Ok(bus.snapshot(route));
        }
        bus.current_passengers = count;
        Ok(self.commit(&mut bus))
    }

    pub fn snapshot(&self, id: BusId) -> Option<BusSnapshot> {
        let cell = self.buses.get(&id).map(|c| c.value().clone())?;
        let bus = cell.lock();
        Some(bus.snapshot(self.summary(bus.route_id)))
    }

    /// Point-in-time copy of every bus, unordered
    pub fn snapshots(&self) -> Vec<BusSnapshot> {
        let cells: Vec<Arc<Mutex<Bus>>> = self.buses.iter().map(|c| c.value().clone()).collect();
        cells
            .into_iter()
            .map(|cell| {
                let bus = cell.lock();
                bus.snapshot(self.summary(bus.route_id))
            })
            .collect()
    }

    pub fn driver_of(&self, id: BusId) -> Result<Option<UserId>, FleetError> {
        let cell = self.cell(id)?;
        let driver = cell.lock().driver_id;
        Ok(driver)
    }

    /// Bus currently assigned to a driver, if any
    pub fn bus_for_driver(&self, driver: UserId) -> Option<BusId> {
        let cells: Vec<Arc<Mutex<Bus>>> = self.buses.iter().map(|c| c.value().clone()).collect();
        cells.into_iter().find_map(|cell| {
            let bus = cell.lock();
            (bus.driver_id == Some(driver)).then_some(bus.id)
        })
    }

    pub fn contains(&self, id: BusId) -> bool {
        self.buses.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    fn cell(&self, id: BusId) -> Result<Arc<Mutex<Bus>>, FleetError> {
        self.buses.get(&id).map(|c| c.value().clone()).ok_or(FleetError::BusNotFound(id))
    }

    fn summary(&self, route_id: Option<RouteId>) -> Option<RouteSummary> {
        route_id.and_then(|id| self.routes.get(&id).map(|r| RouteSummary::from(r.value().as_ref())))
    }

    /// Bump version and queue the broadcast; caller holds the bus lock
    fn commit(&self, bus: &mut Bus) -> BusSnapshot {
        bus.version += 1;
        let snapshot = bus.snapshot(self.summary(bus.route_id));
        self.fanout.publish(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fanout::{create_fanout, FanoutEngine};
    use crate::services::registry::SubscriptionRegistry;
    use chrono::{DateTime, Duration, Utc};

    fn store() -> (BusStateStore, FanoutEngine) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(16, metrics.clone()));
        let (handle, engine) = create_fanout(registry, metrics.clone(), 64);
        (BusStateStore::new(handle, metrics), engine)
    }

    fn record(id: u64, capacity: u32) -> BusRecord {
        BusRecord { id: BusId(id), number: format!("AA-{id}"), capacity, route_id: None, driver_id: None }
    }

    fn position(ts: DateTime<Utc>) -> Position {
        Position { latitude: 9.0, longitude: 38.7, speed_kmh: 20.0, heading: None, accuracy: None, updated_at: ts }
    }

    fn key(ts: DateTime<Utc>) -> OrderKey {
        OrderKey { timestamp: ts, sequence: 0 }
    }

    #[test]
    fn test_register_bus_validation() {
        let (store, _engine) = store();
        assert!(matches!(store.register_bus(record(1, 0)), Err(FleetError::Validation(_))));

        store.register_bus(record(1, 40)).unwrap();
        assert_eq!(store.register_bus(record(1, 40)), Err(FleetError::DuplicateBus(BusId(1))));

        let mut with_route = record(2, 40);
        with_route.route_id = Some(RouteId(9));
        assert_eq!(store.register_bus(with_route), Err(FleetError::RouteNotFound(RouteId(9))));
    }

    #[test]
    fn test_location_last_write_wins() {
        let (store, _engine) = store();
        store.register_bus(record(1, 40)).unwrap();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);
        let t2 = t0 + Duration::seconds(2);
        let t3 = t0 + Duration::seconds(3);

        assert!(matches!(store.apply_location(BusId(1), position(t1), key(t1)), Ok(LocationOutcome::Accepted(_))));
        assert!(matches!(store.apply_location(BusId(1), position(t3), key(t3)), Ok(LocationOutcome::Accepted(_))));
        assert!(matches!(store.apply_location(BusId(1), position(t2), key(t2)), Ok(LocationOutcome::Stale { .. })));
        // Equal key is a duplicate
        assert!(matches!(store.apply_location(BusId(1), position(t3), key(t3)), Ok(LocationOutcome::Stale { .. })));

        let snap = store.snapshot(BusId(1)).unwrap();
        assert_eq!(snap.position.unwrap().updated_at, t3);
        assert_eq!(snap.version, 3);
    }

    #[test]
    fn test_sequence_breaks_timestamp_tie() {
        let (store, _engine) = store();
        store.register_bus(record(1, 40)).unwrap();
        let t = Utc::now();
        let first = OrderKey { timestamp: t, sequence: 1 };
        let second = OrderKey { timestamp: t, sequence: 2 };
        store.apply_location(BusId(1), position(t), first).unwrap();
        assert!(matches!(store.apply_location(BusId(1), position(t), second), Ok(LocationOutcome::Accepted(_))));
        assert!(matches!(store.apply_location(BusId(1), position(t), first), Ok(LocationOutcome::Stale { .. })));
    }

    #[test]
    fn test_unknown_bus() {
        let (store, _engine) = store();
        let t = Utc::now();
        assert_eq!(
            store.apply_location(BusId(404), position(t), key(t)),
            Err(FleetError::BusNotFound(BusId(404)))
        );
        assert!(store.snapshot(BusId(404)).is_none());
    }

    #[test]
    fn test_status_transitions_and_versions() {
        let (store, _engine) = store();
        store.register_bus(record(1, 40)).unwrap();

        let outcome = store.apply_status(BusId(1), StatusCommand::Set(BusStatus::Waiting)).unwrap();
        assert!(outcome.changed());
        let version = outcome.snapshot().version;

        let same = store.apply_status(BusId(1), StatusCommand::Set(BusStatus::Waiting)).unwrap();
        assert!(!same.changed());
        assert_eq!(same.snapshot().version, version);

        store.apply_status(BusId(1), StatusCommand::Set(BusStatus::Maintenance)).unwrap();
        let err = store.apply_status(BusId(1), StatusCommand::Set(BusStatus::Active)).unwrap_err();
        assert_eq!(err, FleetError::InvalidTransition { from: BusStatus::Maintenance, to: BusStatus::Active });
        assert_eq!(store.snapshot(BusId(1)).unwrap().status, BusStatus::Maintenance);
    }

    #[test]
    fn test_boarding_respects_capacity() {
        let (store, _engine) = store();
        store.register_bus(record(1, 2)).unwrap();
        store.record_boarding(BusId(1)).unwrap();
        let snap = store.record_boarding(BusId(1)).unwrap();
        assert_eq!(snap.current_passengers, 2);
        assert_eq!(
            store.record_boarding(BusId(1)),
            Err(FleetError::CapacityExceeded { capacity: 2, requested: 3 })
        );
        assert_eq!(store.snapshot(BusId(1)).unwrap().current_passengers, 2);
    }

    #[test]
    fn test_set_passenger_count() {
        let (store, _engine) = store();
        store.register_bus(record(1, 10)).unwrap();
        assert_eq!(store.set_passenger_count(BusId(1), 7).unwrap().current_passengers, 7);
        assert!(matches!(
            store.set_passenger_count(BusId(1), 11),
            Err(FleetError::CapacityExceeded { capacity: 10, requested: 11 })
        ));
        let before = store.snapshot(BusId(1)).unwrap().version;
        assert_eq!(store.set_passenger_count(BusId(1), 7).unwrap().version, before);
    }

    #[test]
    fn test_every_commit_is_queued_in_order() {
        let (store, mut engine) = store();
        store.register_bus(record(1, 40)).unwrap();
        let t = Utc::now();
        store.apply_location(BusId(1), position(t), key(t)).unwrap();
        store.apply_location(BusId(1), position(t), key(t)).unwrap();
        store.apply_status(BusId(1), StatusCommand::Set(BusStatus::Waiting)).unwrap();
        // register + location + status; the stale update is not queued
        assert_eq!(engine.drain(), 3);
    }

    #[test]
    fn test_driver_lookup() {
        let (store, _engine) = store();
        store.register_bus(record(1, 40)).unwrap();
        store.register_bus(record(2, 40)).unwrap();
        store.assign_driver(BusId(2), Some(UserId(77))).unwrap();
        assert_eq!(store.bus_for_driver(UserId(77)), Some(BusId(2)));
        assert_eq!(store.driver_of(BusId(2)), Ok(Some(UserId(77))));
        assert_eq!(store.bus_for_driver(UserId(78)), None);
    }

    #[test]
    fn test_concurrent_boarding_never_exceeds_capacity() {
        let (store, _engine) = store();
        store.register_bus(record(1, 10)).unwrap();
        let successes = std::sync::atomic::AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..5 {
                        if store.record_boarding(BusId(1)).is_ok() {
                            successes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(successes.into_inner(), 10);
        assert_eq!(store.snapshot(BusId(1)).unwrap().current_passengers, 10);
    }
}
