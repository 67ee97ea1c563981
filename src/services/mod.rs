//! Services - fleet state and delivery
//!
//! This module contains the core services:
//! - `state_store` - Authoritative per-bus live state, serialized per bus
//! - `ingestion` - Location ingestion gateway (validation, unit conversion, ordering)
//! - `registry` - Subscription registry with per-interest indexes
//! - `fanout` - Broadcast fan-out worker
//! - `ledger` - Reservation check-in ledger
//! - `notifier` - Per-user notification dispatcher
//! - `fleet` - Facade wiring the above together

pub mod fanout;
pub mod fleet;
pub mod ingestion;
pub mod ledger;
pub mod notifier;
pub mod registry;
pub mod state_store;

// Re-export commonly used types
pub use fanout::{create_fanout, DispatchReport, FanoutEngine, FanoutHandle};
pub use fleet::{Area, Fleet, FleetStatistics, SeedSummary};
pub use ingestion::{IngestOutcome, IngestionGateway};
pub use ledger::{CheckInReceipt, ReservationLedger};
pub use notifier::{DeliveryPolicy, NotificationDispatcher, NotifyOutcome};
pub use registry::{Interest, Outbound, SubscriberId, Subscription, SubscriptionRegistry};
pub use state_store::{BusStateStore, LocationOutcome, TransitionOutcome};
