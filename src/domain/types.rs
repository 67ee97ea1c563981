//! Identifiers and inbound wire types shared across the fleet core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for bus IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BusId(pub u64);

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for route IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RouteId(pub u64);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for user IDs (drivers and passengers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for reservation IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ReservationId(pub u64);

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit the driver clients report speed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SpeedUnit {
    /// Browser geolocation native unit
    #[default]
    #[serde(rename = "mps")]
    MetersPerSecond,
    #[serde(rename = "kmh")]
    KilometersPerHour,
    #[serde(rename = "mph")]
    MilesPerHour,
}

impl SpeedUnit {
    /// Convert a raw speed in this unit to km/h
    #[inline]
    pub fn to_kmh(self, value: f64) -> f64 {
        match self {
            SpeedUnit::MetersPerSecond => value * 3.6,
            SpeedUnit::KilometersPerHour => value,
            SpeedUnit::MilesPerHour => value * 1.609_344,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedUnit::MetersPerSecond => "mps",
            SpeedUnit::KilometersPerHour => "kmh",
            SpeedUnit::MilesPerHour => "mph",
        }
    }
}

/// Location/status report from a driver session, as received on the wire
///
/// Speed is in the configured native unit; the ingestion gateway converts it.
/// `heading` and `accuracy` are optional because mobile geolocation reports
/// them as null while stationary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    #[serde(default, alias = "bus_id")]
    pub bus_id: Option<BusId>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// ISO-8601 timestamp taken on the device
    pub timestamp: DateTime<Utc>,
    /// Optional client sequence number, breaks ties between equal timestamps
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl LocationUpdate {
    /// Acceptance key for last-write-wins ordering
    #[inline]
    pub fn order_key(&self) -> OrderKey {
        OrderKey { timestamp: self.timestamp, sequence: self.sequence.unwrap_or(0) }
    }
}

/// Ordering key of an accepted location update.
///
/// Field order matters: derived `Ord` compares timestamp first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// Current position of a bus in canonical units
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_conversion() {
        assert!((SpeedUnit::MetersPerSecond.to_kmh(10.0) - 36.0).abs() < 1e-9);
        assert_eq!(SpeedUnit::KilometersPerHour.to_kmh(42.0), 42.0);
        assert!((SpeedUnit::MilesPerHour.to_kmh(10.0) - 16.09344).abs() < 1e-9);
    }

    #[test]
    fn test_location_update_from_driver_json() {
        let json = r#"{
            "busId": 7,
            "latitude": 9.03,
            "longitude": 38.74,
            "speed": 12.5,
            "heading": null,
            "accuracy": 8.0,
            "timestamp": "2026-03-01T08:15:30.250Z"
        }"#;
        let update: LocationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.bus_id, Some(BusId(7)));
        assert_eq!(update.speed, Some(12.5));
        assert_eq!(update.heading, None);
        assert_eq!(update.sequence, None);
        assert_eq!(update.timestamp.timestamp_millis(), 1772352930250);
    }

    #[test]
    fn test_location_update_accepts_offset_timestamp() {
        let json = r#"{"latitude": 9.0, "longitude": 38.7, "timestamp": "2026-03-01T11:15:30+03:00"}"#;
        let update: LocationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.timestamp.to_rfc3339(), "2026-03-01T08:15:30+00:00");
    }

    #[test]
    fn test_order_key_compares_timestamp_then_sequence() {
        let t1: DateTime<Utc> = "2026-03-01T08:00:00Z".parse().unwrap();
        let t2: DateTime<Utc> = "2026-03-01T08:00:01Z".parse().unwrap();
        let a = OrderKey { timestamp: t1, sequence: 9 };
        let b = OrderKey { timestamp: t2, sequence: 0 };
        let c = OrderKey { timestamp: t1, sequence: 10 };
        assert!(b > a);
        assert!(c > a);
        assert!(b > c);
    }
}
