//! Fleet seed file
//!
//! Routes, buses and reservations owned by the collaborating systems,
//! loaded once at startup from JSON:
//!
//! ```json
//! {
//!   "routes": [{"id": 3, "number": "R3", "name": "Piassa - Bole", "stops": ["Piassa", "Bole"]}],
//!   "buses": [{"id": 1, "number": "AA-101", "capacity": 50, "route_id": 3, "driver_id": 101}],
//!   "reservations": [{"id": 1, "confirmation_code": "CONF-777", "passenger_id": 5, "bus_id": 1,
//!                     "boarding_stop": "Piassa", "alighting_stop": "Bole", "seat_number": 12,
//!                     "scheduled_departure": "2026-03-01T08:00:00Z", "status": "CONFIRMED"}]
//! }
//! ```

use crate::domain::{BusRecord, Reservation, Route};
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetSeed {
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub buses: Vec<BusRecord>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

impl FleetSeed {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))
    }
}
