//! Error taxonomy for the fleet core

use crate::domain::status::BusStatus;
use crate::domain::types::{BusId, RouteId};
use thiserror::Error;

/// Errors surfaced by fleet operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    #[error("invalid update: {0}")]
    Validation(String),

    #[error("bus {0} not found")]
    BusNotFound(BusId),

    #[error("route {0} not found")]
    RouteNotFound(RouteId),

    #[error("no reservation for confirmation code {0}")]
    ReservationNotFound(String),

    #[error("transition {from} -> {to} not permitted")]
    InvalidTransition { from: BusStatus, to: BusStatus },

    #[error("bus is {0}, not in emergency")]
    NotInEmergency(BusStatus),

    #[error("reservation {0} already checked in")]
    AlreadyCheckedIn(String),

    #[error("reservation {0} is cancelled")]
    Cancelled(String),

    #[error("reservation {0} is not confirmed")]
    NotConfirmed(String),

    #[error("capacity {capacity} exceeded ({requested} passengers)")]
    CapacityExceeded { capacity: u32, requested: u32 },

    #[error("confirmation code {0} already registered")]
    DuplicateConfirmationCode(String),

    #[error("bus {0} already registered")]
    DuplicateBus(BusId),

    #[error("bus {0} is referenced by open reservations")]
    BusInUse(BusId),
}

/// Coarse error classes used by transport adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidTransition,
    Conflict,
    CapacityExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
        }
    }
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Validation(_) => ErrorKind::Validation,
            FleetError::BusNotFound(_)
            | FleetError::RouteNotFound(_)
            | FleetError::ReservationNotFound(_) => ErrorKind::NotFound,
            FleetError::InvalidTransition { .. } | FleetError::NotInEmergency(_) => {
                ErrorKind::InvalidTransition
            }
            FleetError::AlreadyCheckedIn(_)
            | FleetError::Cancelled(_)
            | FleetError::NotConfirmed(_)
            | FleetError::DuplicateConfirmationCode(_)
            | FleetError::DuplicateBus(_)
            | FleetError::BusInUse(_) => ErrorKind::Conflict,
            FleetError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FleetError::BusNotFound(BusId(1)).kind(), ErrorKind::NotFound);
        assert_eq!(
            FleetError::InvalidTransition { from: BusStatus::Maintenance, to: BusStatus::Active }
                .kind(),
            ErrorKind::InvalidTransition
        );
        assert_eq!(FleetError::AlreadyCheckedIn("X".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            FleetError::CapacityExceeded { capacity: 50, requested: 51 }.kind(),
            ErrorKind::CapacityExceeded
        );
    }

    #[test]
    fn test_error_display() {
        let err = FleetError::InvalidTransition { from: BusStatus::Maintenance, to: BusStatus::Active };
        assert_eq!(err.to_string(), "transition MAINTENANCE -> ACTIVE not permitted");
    }
}
