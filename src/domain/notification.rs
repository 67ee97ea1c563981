//! User-facing notification messages

use crate::domain::types::UserId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CheckIn,
    ReservationConfirmed,
    ReservationCancelled,
    DelayAlert,
    Emergency,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::CheckIn => "Checked In",
            NotificationKind::ReservationConfirmed => "Reservation Confirmed",
            NotificationKind::ReservationCancelled => "Reservation Cancelled",
            NotificationKind::DelayAlert => "Delay Alert",
            NotificationKind::Emergency => "Emergency Alert",
        }
    }
}

/// Outbound message for a single user's channel
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// UUIDv7, time-sortable
    pub id: String,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: UserId, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            user_id,
            kind,
            title: kind.title(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload() {
        let n = Notification::new(UserId(42), NotificationKind::CheckIn, "Welcome aboard");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "check_in");
        assert_eq!(json["title"], "Checked In");
        assert_eq!(json["message"], "Welcome aboard");
        assert_eq!(json["user_id"], 42);
        assert!(json["timestamp"].is_string());
    }
}
