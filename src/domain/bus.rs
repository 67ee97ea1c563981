//! Bus and route models

use crate::domain::status::{BusStatus, StatusMachine};
use crate::domain::types::{BusId, OrderKey, Position, RouteId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Route definition, owned by the routing collaborator and immutable here
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub number: String,
    pub name: String,
    /// Ordered stop names
    #[serde(default)]
    pub stops: Vec<String>,
    #[serde(default)]
    pub fare: f64,
    #[serde(default)]
    pub operating_hours: String,
}

/// Route fields embedded in bus payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub id: RouteId,
    pub number: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl From<&Route> for RouteSummary {
    fn from(route: &Route) -> Self {
        Self {
            id: route.id,
            number: route.number.clone(),
            name: route.name.clone(),
            origin: route.stops.first().cloned(),
            destination: route.stops.last().cloned(),
        }
    }
}

/// Bus registration as supplied by the fleet-management collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct BusRecord {
    pub id: BusId,
    pub number: String,
    pub capacity: u32,
    #[serde(default)]
    pub route_id: Option<RouteId>,
    #[serde(default)]
    pub driver_id: Option<UserId>,
}

/// Live state of one bus. Only the state store mutates it.
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: BusId,
    pub number: String,
    pub capacity: u32,
    pub current_passengers: u32,
    pub route_id: Option<RouteId>,
    pub driver_id: Option<UserId>,
    pub position: Option<Position>,
    pub(crate) status: StatusMachine,
    /// Key of the last accepted location update
    pub(crate) last_key: Option<OrderKey>,
    /// Bumped on every accepted mutation
    pub(crate) version: u64,
}

impl Bus {
    pub fn new(record: BusRecord) -> Self {
        Self {
            id: record.id,
            number: record.number,
            capacity: record.capacity,
            current_passengers: 0,
            route_id: record.route_id,
            driver_id: record.driver_id,
            position: None,
            status: StatusMachine::default(),
            last_key: None,
            version: 0,
        }
    }

    #[inline]
    pub fn status(&self) -> BusStatus {
        self.status.current()
    }

    #[inline]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_key.map(|k| k.timestamp)
    }

    #[inline]
    pub fn has_free_seat(&self) -> bool {
        self.current_passengers < self.capacity
    }

    pub fn snapshot(&self, route: Option<RouteSummary>) -> BusSnapshot {
        BusSnapshot {
            id: self.id,
            number: self.number.clone(),
            status: self.status(),
            position: self.position.clone(),
            current_passengers: self.current_passengers,
            capacity: self.capacity,
            route,
            driver_id: self.driver_id,
            version: self.version,
        }
    }
}

/// Bus state as seen by dashboards and subscribers.
///
/// The same shape serves the full poll list and single-bus broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusSnapshot {
    pub id: BusId,
    pub number: String,
    pub status: BusStatus,
    pub position: Option<Position>,
    pub current_passengers: u32,
    pub capacity: u32,
    pub route: Option<RouteSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<UserId>,
    /// Per-bus mutation counter; increases with every broadcast
    pub version: u64,
}

impl BusSnapshot {
    #[inline]
    pub fn route_id(&self) -> Option<RouteId> {
        self.route.as_ref().map(|r| r.id)
    }

    #[inline]
    pub fn speed_kmh(&self) -> f64 {
        self.position.as_ref().map(|p| p.speed_kmh).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            id: RouteId(3),
            number: "R3".to_string(),
            name: "Piassa - Bole".to_string(),
            stops: vec!["Piassa".into(), "Meskel Square".into(), "Bole".into()],
            fare: 5.0,
            operating_hours: "06:00-22:00".to_string(),
        }
    }

    #[test]
    fn test_route_summary_endpoints() {
        let summary = RouteSummary::from(&route());
        assert_eq!(summary.origin.as_deref(), Some("Piassa"));
        assert_eq!(summary.destination.as_deref(), Some("Bole"));
    }

    #[test]
    fn test_new_bus_defaults() {
        let bus = Bus::new(BusRecord {
            id: BusId(1),
            number: "AA-101".to_string(),
            capacity: 50,
            route_id: Some(RouteId(3)),
            driver_id: None,
        });
        assert_eq!(bus.status(), BusStatus::Inactive);
        assert_eq!(bus.current_passengers, 0);
        assert!(bus.has_free_seat());
        assert!(bus.last_update().is_none());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let bus = Bus::new(BusRecord {
            id: BusId(1),
            number: "AA-101".to_string(),
            capacity: 50,
            route_id: Some(RouteId(3)),
            driver_id: None,
        });
        let snapshot = bus.snapshot(Some(RouteSummary::from(&route())));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["status"], "INACTIVE");
        assert_eq!(json["route"]["number"], "R3");
        assert!(json["position"].is_null());
        assert!(json.get("driver_id").is_none());
        assert_eq!(snapshot.speed_kmh(), 0.0);
    }
}
