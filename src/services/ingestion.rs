//! Location ingestion gateway
//!
//! Entry point for driver telemetry. Validates an update, converts speed to
//! km/h and hands it to the state store, which applies it only if its
//! `(timestamp, sequence)` key is newer than the stored one. Stale and
//! duplicate reports are discarded quietly; mobile clients retry and
//! reorder on poor connections.
//!
//! Position updates never change status. Status moves through
//! [`IngestionGateway::set_status`] only.

use crate::domain::{
    BusId, BusSnapshot, BusStatus, FleetError, LocationUpdate, Position, SpeedUnit, StatusCommand,
};
use crate::infra::Metrics;
use crate::services::state_store::{BusStateStore, LocationOutcome, TransitionOutcome};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of a submitted update that passed validation
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(BusSnapshot),
    /// Not newer than the current state; silently ignored
    Discarded,
}

pub struct IngestionGateway {
    store: Arc<BusStateStore>,
    metrics: Arc<Metrics>,
    speed_unit: SpeedUnit,
    max_future_skew: ChronoDuration,
}

impl IngestionGateway {
    pub fn new(
        store: Arc<BusStateStore>,
        metrics: Arc<Metrics>,
        speed_unit: SpeedUnit,
        max_future_skew_ms: u64,
    ) -> Self {
        let skew = ChronoDuration::milliseconds(i64::try_from(max_future_skew_ms).unwrap_or(i64::MAX));
        Self { store, metrics, speed_unit, max_future_skew: skew }
    }

    /// Apply a location update for `bus_id`
    pub fn submit(&self, bus_id: BusId, update: LocationUpdate) -> Result<IngestOutcome, FleetError> {
        let started = Instant::now();

        let position = match self.validate(bus_id, &update) {
            Ok(position) => position,
            Err(e) => {
                self.metrics.record_update_rejected();
                warn!(bus_id = %bus_id, error = %e, "location_rejected");
                return Err(e);
            }
        };

        match self.store.apply_location(bus_id, position, update.order_key()) {
            Ok(LocationOutcome::Accepted(snapshot)) => {
                self.metrics.record_update_accepted(started.elapsed().as_micros() as u64);
                Ok(IngestOutcome::Accepted(snapshot))
            }
            Ok(LocationOutcome::Stale { current, received }) => {
                self.metrics.record_update_stale();
                debug!(
                    bus_id = %bus_id,
                    current = %current.timestamp.to_rfc3339(),
                    received = %received.timestamp.to_rfc3339(),
                    "location_stale_discarded"
                );
                Ok(IngestOutcome::Discarded)
            }
            Err(e) => {
                self.metrics.record_update_rejected();
                warn!(bus_id = %bus_id, error = %e, "location_rejected");
                Err(e)
            }
        }
    }

    /// Decode and apply a raw JSON payload.
    ///
    /// `path_bus` is the bus named by the transport (URL or topic); when
    /// absent the payload must carry `busId`. Malformed input is logged and
    /// reported as a validation error, never a panic.
    pub fn submit_json(&self, path_bus: Option<BusId>, payload: &[u8]) -> Result<IngestOutcome, FleetError> {
        let update: LocationUpdate = match serde_json::from_slice(payload) {
            Ok(update) => update,
            Err(e) => {
                self.metrics.record_update_rejected();
                warn!(bus_id = ?path_bus, error = %e, "location_payload_malformed");
                return Err(FleetError::Validation(format!("malformed location payload: {e}")));
            }
        };

        let bus_id = match (path_bus, update.bus_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => {
                self.metrics.record_update_rejected();
                return Err(FleetError::Validation("location payload has no busId".to_string()));
            }
        };
        self.submit(bus_id, update)
    }

    /// Explicit status change from the driver client (`"ACTIVE"`, `"waiting"`, ...)
    pub fn set_status(&self, bus_id: BusId, status: &str) -> Result<TransitionOutcome, FleetError> {
        let target: BusStatus = status.parse()?;
        self.store.apply_status(bus_id, StatusCommand::Set(target))
    }

    fn validate(&self, bus_id: BusId, update: &LocationUpdate) -> Result<Position, FleetError> {
        if let Some(payload_bus) = update.bus_id {
            if payload_bus != bus_id {
                return Err(FleetError::Validation(format!(
                    "payload busId {payload_bus} does not match bus {bus_id}"
                )));
            }
        }
        if !update.latitude.is_finite() || !(-90.0..=90.0).contains(&update.latitude) {
            return Err(FleetError::Validation(format!("latitude {} out of range", update.latitude)));
        }
        if !update.longitude.is_finite() || !(-180.0..=180.0).contains(&update.longitude) {
            return Err(FleetError::Validation(format!("longitude {} out of range", update.longitude)));
        }

        let raw_speed = update.speed.unwrap_or(0.0);
        if !raw_speed.is_finite() || raw_speed < 0.0 {
            return Err(FleetError::Validation(format!("speed {raw_speed} invalid")));
        }

        // Geolocation reports NaN heading while stationary
        let heading = update.heading.filter(|h| !h.is_nan());
        if let Some(h) = heading {
            if !(0.0..=360.0).contains(&h) {
                return Err(FleetError::Validation(format!("heading {h} out of range")));
            }
        }

        let accuracy = update.accuracy.filter(|a| !a.is_nan());
        if let Some(a) = accuracy {
            if !a.is_finite() || a < 0.0 {
                return Err(FleetError::Validation(format!("accuracy {a} invalid")));
            }
        }

        if update.timestamp > Utc::now() + self.max_future_skew {
            return Err(FleetError::Validation(format!(
                "timestamp {} is in the future",
                update.timestamp.to_rfc3339()
            )));
        }

        Ok(Position {
            latitude: update.latitude,
            longitude: update.longitude,
            speed_kmh: self.speed_unit.to_kmh(raw_speed),
            heading,
            accuracy,
            updated_at: update.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BusRecord;
    use crate::services::fanout::{create_fanout, FanoutEngine};
    use crate::services::registry::SubscriptionRegistry;
    use chrono::{DateTime, Duration};

    fn gateway(unit: SpeedUnit) -> (IngestionGateway, Arc<Metrics>, FanoutEngine) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(16, metrics.clone()));
        let (handle, engine) = create_fanout(registry, metrics.clone(), 64);
        let store = Arc::new(BusStateStore::new(handle, metrics.clone()));
        store
            .register_bus(BusRecord {
                id: BusId(7),
                number: "AA-107".to_string(),
                capacity: 40,
                route_id: None,
                driver_id: None,
            })
            .unwrap();
        (IngestionGateway::new(store, metrics.clone(), unit, 30_000), metrics, engine)
    }

    fn update(ts: DateTime<Utc>) -> LocationUpdate {
        LocationUpdate {
            bus_id: None,
            latitude: 9.03,
            longitude: 38.74,
            speed: Some(10.0),
            heading: Some(90.0),
            accuracy: Some(5.0),
            timestamp: ts,
            sequence: None,
        }
    }

    #[test]
    fn test_reordered_updates_keep_newest() {
        let (gw, metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        let base = Utc::now() - Duration::minutes(1);
        let t = |s| base + Duration::seconds(s);

        assert!(matches!(gw.submit(BusId(7), update(t(1))), Ok(IngestOutcome::Accepted(_))));
        assert!(matches!(gw.submit(BusId(7), update(t(3))), Ok(IngestOutcome::Accepted(_))));
        assert_eq!(gw.submit(BusId(7), update(t(2))), Ok(IngestOutcome::Discarded));

        let snap = gw.store.snapshot(BusId(7)).unwrap();
        assert_eq!(snap.position.unwrap().updated_at, t(3));
        assert_eq!(metrics.updates_accepted(), 2);
        assert_eq!(metrics.updates_stale(), 1);
    }

    #[test]
    fn test_speed_converted_to_kmh() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        let outcome = gw.submit(BusId(7), update(Utc::now())).unwrap();
        let IngestOutcome::Accepted(snap) = outcome else { panic!("expected accepted") };
        assert!((snap.speed_kmh() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_does_not_change_status() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::KilometersPerHour);
        gw.submit(BusId(7), update(Utc::now())).unwrap();
        assert_eq!(gw.store.snapshot(BusId(7)).unwrap().status, BusStatus::Inactive);
    }

    #[test]
    fn test_unknown_bus_not_found() {
        let (gw, metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        assert_eq!(gw.submit(BusId(99), update(Utc::now())), Err(FleetError::BusNotFound(BusId(99))));
        assert_eq!(metrics.updates_rejected(), 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        let now = Utc::now();

        let mut bad_lat = update(now);
        bad_lat.latitude = 91.0;
        assert!(matches!(gw.submit(BusId(7), bad_lat), Err(FleetError::Validation(_))));

        let mut bad_speed = update(now);
        bad_speed.speed = Some(-1.0);
        assert!(matches!(gw.submit(BusId(7), bad_speed), Err(FleetError::Validation(_))));

        let mut future = update(now + Duration::minutes(10));
        future.heading = None;
        assert!(matches!(gw.submit(BusId(7), future), Err(FleetError::Validation(_))));

        let mut mismatched = update(now);
        mismatched.bus_id = Some(BusId(8));
        assert!(matches!(gw.submit(BusId(7), mismatched), Err(FleetError::Validation(_))));

        assert!(gw.store.snapshot(BusId(7)).unwrap().position.is_none());
    }

    #[test]
    fn test_nan_heading_treated_as_absent() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        let mut u = update(Utc::now());
        u.heading = Some(f64::NAN);
        let IngestOutcome::Accepted(snap) = gw.submit(BusId(7), u).unwrap() else { panic!("expected accepted") };
        assert!(snap.position.unwrap().heading.is_none());
    }

    #[test]
    fn test_malformed_json_is_discarded() {
        let (gw, metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        assert!(matches!(gw.submit_json(Some(BusId(7)), b"{not json"), Err(FleetError::Validation(_))));
        assert!(matches!(
            gw.submit_json(None, br#"{"latitude":9.0,"longitude":38.7,"timestamp":"2026-03-01T08:00:00Z"}"#),
            Err(FleetError::Validation(_))
        ));
        assert_eq!(metrics.updates_rejected(), 2);
    }

    #[test]
    fn test_json_with_bus_id_in_payload() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        let payload = format!(
            r#"{{"busId":7,"latitude":9.0,"longitude":38.7,"speed":null,"timestamp":"{}"}}"#,
            Utc::now().to_rfc3339()
        );
        assert!(matches!(gw.submit_json(None, payload.as_bytes()), Ok(IngestOutcome::Accepted(_))));
    }

    #[test]
    fn test_set_status_parses_and_validates() {
        let (gw, _metrics, _engine) = gateway(SpeedUnit::MetersPerSecond);
        assert!(matches!(gw.set_status(BusId(7), "bogus"), Err(FleetError::Validation(_))));
        assert!(matches!(gw.set_status(BusId(7), "active"), Err(FleetError::InvalidTransition { .. })));
        assert!(gw.set_status(BusId(7), "waiting").unwrap().changed());
        assert!(gw.set_status(BusId(7), "ACTIVE").unwrap().changed());
    }
}
