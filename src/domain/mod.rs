//! Domain models - fleet value types and the status state machine
//!
//! This module contains the canonical data types used throughout the system:
//! - `Bus` / `BusSnapshot` - live bus state and its outbound payload
//! - `BusStatus` / `StatusMachine` - status enum and transition table
//! - `Reservation` - seat reservations keyed by confirmation code
//! - `LocationUpdate` - inbound driver telemetry
//! - `Notification` - per-user messages
//! - `FleetError` - error taxonomy

pub mod bus;
pub mod error;
pub mod notification;
pub mod reservation;
pub mod status;
pub mod types;

// Re-export commonly used types at module level
pub use bus::{Bus, BusRecord, BusSnapshot, Route, RouteSummary};
pub use error::{ErrorKind, FleetError};
pub use notification::{Notification, NotificationKind};
pub use reservation::{Reservation, ReservationStatus};
pub use status::{BusStatus, StatusCommand, StatusMachine};
pub use types::{BusId, LocationUpdate, OrderKey, Position, ReservationId, RouteId, SpeedUnit, UserId};
