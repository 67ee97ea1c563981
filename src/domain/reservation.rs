//! Reservation model

use crate::domain::types::{BusId, ReservationId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Awaiting payment
    #[default]
    Pending,
    Confirmed,
    CheckedIn,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::CheckedIn => "CHECKED_IN",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Seat reservation, created by the booking collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    /// Opaque token printed on the ticket
    pub confirmation_code: String,
    pub passenger_id: UserId,
    pub bus_id: BusId,
    pub boarding_stop: String,
    pub alighting_stop: String,
    pub seat_number: u32,
    pub scheduled_departure: DateTime<Utc>,
    #[serde(default)]
    pub status: ReservationStatus,
    #[serde(default)]
    pub checked_in_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Counts against the bus: anything not cancelled
    #[inline]
    pub fn is_open(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }

    /// Service day of the reservation (UTC date of departure)
    #[inline]
    pub fn service_day(&self) -> NaiveDate {
        self.scheduled_departure.date_naive()
    }
}
