//! Bus status state machine
//!
//! Every status change goes through [`StatusMachine::apply`], which consults
//! the transition table in [`BusStatus::permits`]. Nothing is terminal; a bus
//! keeps its machine for the life of the process.

use crate::domain::error::FleetError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusStatus {
    /// No driver currently tracking
    #[default]
    Inactive,
    /// Driver logged in, tracking paused or stopped at a stop
    Waiting,
    /// GPS tracking running, in service
    Active,
    /// Active but behind schedule (set by the scheduling collaborator)
    Delayed,
    /// Out of service
    Maintenance,
    /// Driver-triggered alert
    Emergency,
}

impl BusStatus {
    pub const ALL: [BusStatus; 6] = [
        BusStatus::Inactive,
        BusStatus::Waiting,
        BusStatus::Active,
        BusStatus::Delayed,
        BusStatus::Maintenance,
        BusStatus::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::Inactive => "INACTIVE",
            BusStatus::Waiting => "WAITING",
            BusStatus::Active => "ACTIVE",
            BusStatus::Delayed => "DELAYED",
            BusStatus::Maintenance => "MAINTENANCE",
            BusStatus::Emergency => "EMERGENCY",
        }
    }

    /// Dashboard ordering, higher sorts first
    pub fn display_priority(&self) -> u8 {
        match self {
            BusStatus::Emergency => 5,
            BusStatus::Delayed => 4,
            BusStatus::Active => 3,
            BusStatus::Waiting => 2,
            BusStatus::Maintenance => 1,
            BusStatus::Inactive => 0,
        }
    }

    /// Transition table for explicit `Set` commands.
    ///
    /// Leaving EMERGENCY is only possible through `ClearEmergency`.
    pub fn permits(self, to: BusStatus) -> bool {
        use BusStatus::*;
        match (self, to) {
            (from, to) if from == to => true,
            (_, Emergency) => true,
            (Emergency, _) => false,
            (_, Maintenance) => true,
            (Inactive, Waiting) => true,
            (Waiting, Active) | (Active, Waiting) => true,
            (Waiting, Inactive) => true,
            (Active, Delayed) | (Delayed, Active) | (Delayed, Waiting) => true,
            (Maintenance, Inactive) | (Maintenance, Waiting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BusStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        BusStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| FleetError::Validation(format!("unknown bus status '{trimmed}'")))
    }
}

/// Explicit status change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommand {
    Set(BusStatus),
    /// Leave EMERGENCY, restoring the state it pre-empted (or WAITING)
    ClearEmergency,
}

/// Per-bus status state
#[derive(Debug, Clone, Default)]
pub struct StatusMachine {
    current: BusStatus,
    before_emergency: Option<BusStatus>,
}

impl StatusMachine {
    pub fn new(initial: BusStatus) -> Self {
        Self { current: initial, before_emergency: None }
    }

    #[inline]
    pub fn current(&self) -> BusStatus {
        self.current
    }

    /// Apply a command. Returns `Ok(Some(previous))` when the status changed,
    /// `Ok(None)` for a same-state no-op.
    pub fn apply(&mut self, command: StatusCommand) -> Result<Option<BusStatus>, FleetError> {
        let from = self.current;
        let to = match command {
            StatusCommand::Set(to) => {
                if !from.permits(to) {
                    return Err(FleetError::InvalidTransition { from, to });
                }
                to
            }
            StatusCommand::ClearEmergency => {
                if from != BusStatus::Emergency {
                    return Err(FleetError::NotInEmergency(from));
                }
                self.before_emergency.take().unwrap_or(BusStatus::Waiting)
            }
        };

        if from == to {
            return Ok(None);
        }
        if to == BusStatus::Emergency {
            self.before_emergency = Some(from);
        }
        self.current = to;
        Ok(Some(from))
    }
}
