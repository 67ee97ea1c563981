//! Notification dispatcher - per-user message delivery
//!
//! Notifications go to every channel the user has open. With no channel the
//! configured policy decides: `FireAndForget` drops the message, `Retain`
//! keeps a bounded FIFO per user (oldest evicted) that is flushed in order
//! the next time the user opens a channel through [`NotificationDispatcher::open_channel`].

use crate::domain::{Notification, UserId};
use crate::infra::{Metrics, NotificationPolicy};
use crate::services::registry::{Delivered, Outbound, Subscription, SubscriptionRegistry};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    FireAndForget,
    Retain { depth: usize },
}

impl DeliveryPolicy {
    pub fn from_config(policy: NotificationPolicy, depth: usize) -> Self {
        match policy {
            NotificationPolicy::FireAndForget => DeliveryPolicy::FireAndForget,
            NotificationPolicy::Retain if depth == 0 => DeliveryPolicy::FireAndForget,
            NotificationPolicy::Retain => DeliveryPolicy::Retain { depth },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Handed to this many channels
    Delivered(usize),
    /// Held for the user's next connection
    Retained,
    /// No live channel and nothing retained
    Dropped,
}

pub struct NotificationDispatcher {
    registry: Arc<SubscriptionRegistry>,
    policy: DeliveryPolicy,
    pending: DashMap<UserId, VecDeque<Notification>>,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, policy: DeliveryPolicy, metrics: Arc<Metrics>) -> Self {
        Self { registry, policy, pending: DashMap::new(), metrics }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Deliver to every open channel of the addressee
    pub fn notify(&self, notification: Notification) -> NotifyOutcome {
        let user = notification.user_id;
        let DeliveryPolicy::Retain { depth } = self.policy else {
            return match self.deliver(&notification) {
                0 => {
                    self.metrics.record_notification_dropped();
                    debug!(user_id = %user, kind = ?notification.kind, "notification_dropped: no channel");
                    NotifyOutcome::Dropped
                }
                delivered => NotifyOutcome::Delivered(delivered),
            };
        };

        // Held across the channel lookup so open_channel cannot register and
        // flush in between
        let mut queue = self.pending.entry(user).or_default();
        let outcome = match self.deliver(&notification) {
            0 => {
                if queue.len() >= depth {
                    queue.pop_front();
                    self.metrics.record_notification_dropped();
                }
                queue.push_back(notification);
                self.metrics.record_notification_retained();
                NotifyOutcome::Retained
            }
            delivered => NotifyOutcome::Delivered(delivered),
        };
        let empty = queue.is_empty();
        drop(queue);
        if empty {
            self.pending.remove_if(&user, |_, q| q.is_empty());
        }
        outcome
    }

    /// Hand a notification to the user's live channels. Returns how many took it.
    fn deliver(&self, notification: &Notification) -> usize {
        let user = notification.user_id;
        let mut delivered = 0;
        for target in &self.registry.user_targets(user) {
            match target.deliver(Outbound::Notification(notification.clone())) {
                Delivered::Ok => delivered += 1,
                Delivered::Full => {
                    self.metrics.record_delivery(false);
                    debug!(subscriber_id = %target.id, user_id = %user, "notification_dropped: subscriber slow");
                }
                Delivered::Closed => {
                    self.registry.unsubscribe(target.id);
                }
            }
        }
        if delivered > 0 {
            self.metrics.record_notification_delivered();
            debug!(user_id = %user, kind = ?notification.kind, channels = %delivered, "notification_delivered");
        }
        delivered
    }

    /// Register a user channel and push retained notifications to it, oldest first.
    ///
    /// Registration and flush happen under the user's pending entry, the same
    /// one `notify` holds, so every notification either reaches the new
    /// channel directly or is flushed into it. Anything that does not fit the
    /// channel stays queued for next time.
    pub fn open_channel<F>(&self, user: UserId, register: F) -> Subscription
    where
        F: FnOnce() -> Subscription,
    {
        if self.policy == DeliveryPolicy::FireAndForget {
            return register();
        }

        let mut queue = self.pending.entry(user).or_default();
        let subscription = register();
        let target = self.registry.user_targets(user).into_iter().find(|t| t.id == subscription.id);

        let mut flushed = 0;
        if let Some(target) = target {
            while let Some(notification) = queue.pop_front() {
                match target.deliver(Outbound::Notification(notification.clone())) {
                    Delivered::Ok => flushed += 1,
                    Delivered::Full | Delivered::Closed => {
                        queue.push_front(notification);
                        break;
                    }
                }
            }
        }
        let empty = queue.is_empty();
        drop(queue);
        if empty {
            self.pending.remove_if(&user, |_, q| q.is_empty());
        }

        if flushed > 0 {
            info!(user_id = %user, count = %flushed, "pending_notifications_flushed");
        }
        subscription
    }

    pub fn pending_len(&self, user: UserId) -> usize {
        self.pending.get(&user).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NotificationKind;
    use crate::services::registry::Interest;

    fn dispatcher(policy: DeliveryPolicy) -> (Arc<SubscriptionRegistry>, NotificationDispatcher) {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(8, metrics.clone()));
        let dispatcher = NotificationDispatcher::new(registry.clone(), policy, metrics);
        (registry, dispatcher)
    }

    fn note(user: u64, msg: &str) -> Notification {
        Notification::new(UserId(user), NotificationKind::DelayAlert, msg)
    }

    #[test]
    fn test_delivers_to_every_user_channel() {
        let (registry, dispatcher) = dispatcher(DeliveryPolicy::FireAndForget);
        let mut phone = registry.subscribe(Interest::User(UserId(1)));
        let mut tablet = registry.subscribe(Interest::User(UserId(1)));
        let mut stranger = registry.subscribe(Interest::User(UserId(2)));

        assert_eq!(dispatcher.notify(note(1, "late")), NotifyOutcome::Delivered(2));
        assert!(phone.rx.try_recv().is_ok());
        assert!(tablet.rx.try_recv().is_ok());
        assert!(stranger.rx.try_recv().is_err());
    }

    #[test]
    fn test_fire_and_forget_drops_without_channel() {
        let (_registry, dispatcher) = dispatcher(DeliveryPolicy::FireAndForget);
        assert_eq!(dispatcher.notify(note(1, "late")), NotifyOutcome::Dropped);
        assert_eq!(dispatcher.pending_len(UserId(1)), 0);
    }

    #[test]
    fn test_retain_is_bounded_and_flushes_in_order() {
        let (registry, dispatcher) = dispatcher(DeliveryPolicy::Retain { depth: 2 });
        for msg in ["a", "b", "c"] {
            assert_eq!(dispatcher.notify(note(1, msg)), NotifyOutcome::Retained);
        }
        assert_eq!(dispatcher.pending_len(UserId(1)), 2);

        let mut sub = dispatcher.open_channel(UserId(1), || registry.subscribe(Interest::User(UserId(1))));
        assert_eq!(dispatcher.pending_len(UserId(1)), 0);

        let messages: Vec<String> = std::iter::from_fn(|| sub.rx.try_recv().ok())
            .filter_map(|m| match m {
                Outbound::Notification(n) => Some(n.message),
                Outbound::BusUpdate(_) => None,
            })
            .collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_zero_depth_retain_falls_back() {
        assert_eq!(
            DeliveryPolicy::from_config(NotificationPolicy::Retain, 0),
            DeliveryPolicy::FireAndForget
        );
        assert_eq!(
            DeliveryPolicy::from_config(NotificationPolicy::Retain, 5),
            DeliveryPolicy::Retain { depth: 5 }
        );
    }

    #[test]
    fn test_closed_channel_is_pruned() {
        let (registry, dispatcher) = dispatcher(DeliveryPolicy::FireAndForget);
        let sub = registry.subscribe(Interest::User(UserId(1)));
        drop(sub);
        assert_eq!(dispatcher.notify(note(1, "x")), NotifyOutcome::Dropped);
        assert!(!registry.has_user_channel(UserId(1)));
    }

    #[test]
    fn test_notify_racing_open_channel_never_strands_a_message() {
        for round in 0..500 {
            let (registry, dispatcher) = dispatcher(DeliveryPolicy::Retain { depth: 8 });
            let barrier = std::sync::Barrier::new(2);

            let mut sub = std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    for i in 0..4 {
                        dispatcher.notify(note(1, &i.to_string()));
                    }
                });
                let open = s.spawn(|| {
                    barrier.wait();
                    dispatcher.open_channel(UserId(1), || registry.subscribe(Interest::User(UserId(1))))
                });
                open.join().unwrap()
            });

            let received = std::iter::from_fn(|| sub.rx.try_recv().ok()).count();
            assert_eq!(dispatcher.pending_len(UserId(1)), 0, "round {round}");
            assert_eq!(received, 4, "round {round}");
        }
    }
}
