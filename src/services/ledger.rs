//! Reservation check-in ledger
//!
//! Reservations are keyed by confirmation code, each behind its own mutex.
//! Check-in holds the reservation lock across the CONFIRMED check and the
//! passenger increment on the bus, so concurrent scans of the same code
//! produce exactly one success.
//!
//! Lock order is reservation, then bus. Nothing takes a reservation lock
//! while holding a bus lock. Registering a reservation and retiring a bus
//! both hold the bus's `by_bus` entry, so a bus is never removed while an
//! open reservation references it.

use crate::domain::{
    BusId, BusSnapshot, FleetError, Notification, NotificationKind, Reservation, ReservationStatus,
    UserId,
};
use crate::infra::Metrics;
use crate::services::notifier::NotificationDispatcher;
use crate::services::state_store::BusStateStore;
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Successful check-in: the updated reservation and the bus after boarding
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInReceipt {
    pub reservation: Reservation,
    pub bus: BusSnapshot,
}

pub struct ReservationLedger {
    by_code: DashMap<String, Arc<Mutex<Reservation>>>,
    by_bus: DashMap<BusId, Vec<String>>,
    store: Arc<BusStateStore>,
    notifier: Arc<NotificationDispatcher>,
    metrics: Arc<Metrics>,
}

impl ReservationLedger {
    pub fn new(
        store: Arc<BusStateStore>,
        notifier: Arc<NotificationDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { by_code: DashMap::new(), by_bus: DashMap::new(), store, notifier, metrics }
    }

    /// Record a reservation created by the booking side
    pub fn register(&self, reservation: Reservation) -> Result<Reservation, FleetError> {
        let code = reservation.confirmation_code.trim().to_string();
        if code.is_empty() {
            return Err(FleetError::Validation("empty confirmation code".to_string()));
        }
        if reservation.status == ReservationStatus::CheckedIn {
            return Err(FleetError::Validation(format!(
                "reservation {code} cannot be registered as already checked in"
            )));
        }

        let bus_id = reservation.bus_id;
        // Held until the code is indexed; retire_bus takes the same entry
        let codes = self.by_bus.entry(bus_id);
        if !self.store.contains(bus_id) {
            return Err(FleetError::BusNotFound(bus_id));
        }

        let mut reservation = reservation;
        reservation.confirmation_code = code.clone();

        match self.by_code.entry(code.clone()) {
            Entry::Occupied(_) => return Err(FleetError::DuplicateConfirmationCode(code)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(reservation.clone())));
            }
        }
        codes.or_default().push(code.clone());

        info!(
            code = %code,
            bus_id = %bus_id,
            passenger_id = %reservation.passenger_id,
            status = %reservation.status.as_str(),
            "reservation_registered"
        );
        Ok(reservation)
    }

    pub fn get(&self, code: &str) -> Option<Reservation> {
        self.cell(code.trim()).ok().map(|cell| cell.lock().clone())
    }

    /// Board a passenger against a CONFIRMED reservation
    pub fn check_in(&self, code: &str) -> Result<CheckInReceipt, FleetError> {
        match self.try_check_in(code.trim()) {
            Ok(receipt) => {
                self.metrics.record_checkin(true);
                info!(
                    code = %receipt.reservation.confirmation_code,
                    bus_id = %receipt.bus.id,
                    passengers = %receipt.bus.current_passengers,
                    "passenger_checked_in"
                );
                let message = format!(
                    "Checked in on bus {}, seat {}. Boarding at {}.",
                    receipt.bus.number, receipt.reservation.seat_number, receipt.reservation.boarding_stop
                );
                self.notifier.notify(Notification::new(
                    receipt.reservation.passenger_id,
                    NotificationKind::CheckIn,
                    message,
                ));
                Ok(receipt)
            }
            Err(e) => {
                self.metrics.record_checkin(false);
                warn!(code = %code, error = %e, "check_in_rejected");
                Err(e)
            }
        }
    }

    fn try_check_in(&self, code: &str) -> Result<CheckInReceipt, FleetError> {
        let cell = self.cell(code)?;
        let mut reservation = cell.lock();

        match reservation.status {
            ReservationStatus::Confirmed => {}
            ReservationStatus::CheckedIn => return Err(FleetError::AlreadyCheckedIn(code.to_string())),
            ReservationStatus::Cancelled => return Err(FleetError::Cancelled(code.to_string())),
            ReservationStatus::Pending => return Err(FleetError::NotConfirmed(code.to_string())),
        }

        // Fails without touching the reservation when the bus is full
        let bus = self.store.record_boarding(reservation.bus_id)?;

        reservation.status = ReservationStatus::CheckedIn;
        reservation.checked_in_at = Some(Utc::now());
        Ok(CheckInReceipt { reservation: reservation.clone(), bus })
    }

    /// Payment collaborator signal: PENDING -> CONFIRMED. Idempotent.
    pub fn confirm(&self, code: &str) -> Result<Reservation, FleetError> {
        let code = code.trim();
        let cell = self.cell(code)?;
        let confirmed = {
            let mut reservation = cell.lock();
            match reservation.status {
                ReservationStatus::Confirmed => return Ok(reservation.clone()),
                ReservationStatus::CheckedIn => return Err(FleetError::AlreadyCheckedIn(code.to_string())),
                ReservationStatus::Cancelled => return Err(FleetError::Cancelled(code.to_string())),
                ReservationStatus::Pending => {}
            }
            reservation.status = ReservationStatus::Confirmed;
            reservation.clone()
        };

        info!(code = %code, bus_id = %confirmed.bus_id, "reservation_confirmed");
        let message = format!(
            "Your seat on bus {} from {} to {} is confirmed. Confirmation: {}",
            self.bus_number(confirmed.bus_id),
            confirmed.boarding_stop,
            confirmed.alighting_stop,
            confirmed.confirmation_code
        );
        self.notifier.notify(Notification::new(
            confirmed.passenger_id,
            NotificationKind::ReservationConfirmed,
            message,
        ));
        Ok(confirmed)
    }

    /// PENDING/CONFIRMED -> CANCELLED
    pub fn cancel(&self, code: &str, reason: Option<&str>) -> Result<Reservation, FleetError> {
        let code = code.trim();
        let cell = self.cell(code)?;
        let cancelled = {
            let mut reservation = cell.lock();
            match reservation.status {
                ReservationStatus::Pending | ReservationStatus::Confirmed => {}
                ReservationStatus::CheckedIn => return Err(FleetError::AlreadyCheckedIn(code.to_string())),
                ReservationStatus::Cancelled => return Err(FleetError::Cancelled(code.to_string())),
            }
            reservation.status = ReservationStatus::Cancelled;
            reservation.clone()
        };

        info!(code = %code, bus_id = %cancelled.bus_id, reason = ?reason, "reservation_cancelled");
        let message = match reason {
            Some(reason) => format!("Your reservation {code} has been cancelled: {reason}"),
            None => format!("Your reservation {code} has been cancelled."),
        };
        self.notifier.notify(Notification::new(
            cancelled.passenger_id,
            NotificationKind::ReservationCancelled,
            message,
        ));
        Ok(cancelled)
    }

    /// Reservations on a bus departing on `day` (UTC), by departure then seat
    pub fn reservations_for_bus_on(&self, bus: BusId, day: NaiveDate) -> Vec<Reservation> {
        let mut list: Vec<Reservation> =
            self.for_bus(bus).into_iter().filter(|r| r.service_day() == day).collect();
        list.sort_by(|a, b| {
            a.scheduled_departure.cmp(&b.scheduled_departure).then(a.seat_number.cmp(&b.seat_number))
        });
        list
    }

    /// Every non-cancelled reservation on a bus
    pub fn open_reservations_for_bus(&self, bus: BusId) -> Vec<Reservation> {
        self.for_bus(bus).into_iter().filter(Reservation::is_open).collect()
    }

    /// Distinct passengers holding an open reservation on a bus
    pub fn passengers_on(&self, bus: BusId) -> Vec<UserId> {
        let mut seen = FxHashSet::default();
        let mut passengers: Vec<UserId> = self
            .open_reservations_for_bus(bus)
            .into_iter()
            .map(|r| r.passenger_id)
            .filter(|id| seen.insert(*id))
            .collect();
        passengers.sort();
        passengers
    }

    /// Buses on which a passenger holds an open reservation
    pub fn buses_for_passenger(&self, passenger: UserId) -> Vec<BusId> {
        let cells: Vec<Arc<Mutex<Reservation>>> = self.by_code.iter().map(|c| c.value().clone()).collect();
        let mut buses: Vec<BusId> = cells
            .into_iter()
            .filter_map(|cell| {
                let reservation = cell.lock();
                (reservation.passenger_id == passenger && reservation.is_open()).then_some(reservation.bus_id)
            })
            .collect();
        buses.sort();
        buses.dedup();
        buses
    }

    pub fn has_open_reservations(&self, bus: BusId) -> bool {
        self.codes_for(bus).iter().any(|code| self.is_open(code))
    }

    /// Remove a bus from the state store unless an open reservation references it
    pub fn retire_bus(&self, bus: BusId) -> Result<(), FleetError> {
        let codes = self.by_bus.entry(bus);
        if !self.store.contains(bus) {
            return Err(FleetError::BusNotFound(bus));
        }
        if let Entry::Occupied(codes) = &codes {
            if codes.get().iter().any(|code| self.is_open(code)) {
                return Err(FleetError::BusInUse(bus));
            }
        }
        self.store.remove_bus(bus)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    fn cell(&self, code: &str) -> Result<Arc<Mutex<Reservation>>, FleetError> {
        self.by_code
            .get(code)
            .map(|c| c.value().clone())
            .ok_or_else(|| FleetError::ReservationNotFound(code.to_string()))
    }

    fn is_open(&self, code: &str) -> bool {
        self.by_code.get(code).map(|c| c.value().clone()).is_some_and(|cell| cell.lock().is_open())
    }

    fn codes_for(&self, bus: BusId) -> Vec<String> {
        self.by_bus.get(&bus).map(|codes| codes.clone()).unwrap_or_default()
    }

    fn for_bus(&self, bus: BusId) -> Vec<Reservation> {
        self.codes_for(bus)
            .iter()
            .filter_map(|code| self.by_code.get(code).map(|c| c.value().clone()))
            .map(|cell| cell.lock().clone())
            .collect()
    }

    fn bus_number(&self, bus: BusId) -> String {
        self.store.snapshot(bus).map(|s| s.number).unwrap_or_else(|| bus.to_string())
    }
}
