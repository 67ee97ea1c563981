//! Subscription registry
//!
//! Tracks live consumers of bus deltas and notifications. Each subscriber
//! owns a bounded outbound channel; the registry keeps the sending half
//! plus per-interest indexes so fan-out can resolve targets without
//! scanning every subscriber.
//!
//! Lock discipline: a subscriber slot guard may be held while touching an
//! index map, never the other way round. Delivery targets are copied out
//! (`Vec<Target>`) before any message is sent, so no map guard is held
//! across a `try_send`.

use crate::domain::{BusId, BusSnapshot, Notification, RouteId, UserId};
use crate::infra::Metrics;
use dashmap::{DashMap, DashSet};
use rustc_hash::FxHashSet;
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// What a subscriber wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Public dashboard: every bus delta
    AllBuses,
    Bus(BusId),
    Route(RouteId),
    /// Per-user notification channel
    User(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message pushed to a subscriber channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    BusUpdate(BusSnapshot),
    Notification(Notification),
}

/// Receiving half handed to the transport that serves the subscriber
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Outbound>,
}

/// Result of a single non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Ok,
    /// Subscriber buffer full, message dropped for this subscriber only
    Full,
    /// Receiver dropped, subscriber is gone
    Closed,
}

/// Resolved delivery target, detached from the registry maps
#[derive(Debug, Clone)]
pub struct Target {
    pub id: SubscriberId,
    tx: mpsc::Sender<Outbound>,
}

impl Target {
    #[inline]
    pub fn deliver(&self, message: Outbound) -> Delivered {
        match self.tx.try_send(message) {
            Ok(()) => Delivered::Ok,
            Err(TrySendError::Full(_)) => Delivered::Full,
            Err(TrySendError::Closed(_)) => Delivered::Closed,
        }
    }
}

struct SubscriberSlot {
    interests: SmallVec<[Interest; 2]>,
    tx: mpsc::Sender<Outbound>,
}

pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    channel_capacity: usize,
    slots: DashMap<SubscriberId, SubscriberSlot>,
    all_buses: DashSet<SubscriberId>,
    by_bus: DashMap<BusId, FxHashSet<SubscriberId>>,
    by_route: DashMap<RouteId, FxHashSet<SubscriberId>>,
    by_user: DashMap<UserId, FxHashSet<SubscriberId>>,
    metrics: Arc<Metrics>,
}

impl SubscriptionRegistry {
    pub fn new(channel_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channel_capacity: channel_capacity.max(1),
            slots: DashMap::new(),
            all_buses: DashSet::new(),
            by_bus: DashMap::new(),
            by_route: DashMap::new(),
            by_user: DashMap::new(),
            metrics,
        }
    }

    /// Register a subscriber with an initial interest
    pub fn subscribe(&self, interest: Interest) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let mut interests = SmallVec::new();
        interests.push(interest);
        self.slots.insert(id, SubscriberSlot { interests, tx });
        self.index_insert(id, interest);

        self.metrics.record_subscriber_connected();
        debug!(subscriber_id = %id, interest = ?interest, "subscriber_registered");
        Subscription { id, rx }
    }

    /// Widen an existing subscription. Returns false if the subscriber is gone.
    pub fn add_interest(&self, id: SubscriberId, interest: Interest) -> bool {
        let Some(mut slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if !slot.interests.contains(&interest) {
            slot.interests.push(interest);
            self.index_insert(id, interest);
        }
        true
    }

    /// Remove a subscriber and every index entry pointing at it. Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        for interest in slot.interests {
            self.index_remove(id, interest);
        }
        self.metrics.record_subscriber_disconnected();
        debug!(subscriber_id = %id, "subscriber_removed");
        true
    }

    /// Subscribers interested in a delta for `bus`, deduplicated
    pub fn bus_targets(&self, bus: BusId, route: Option<RouteId>) -> Vec<Target> {
        let mut ids: FxHashSet<SubscriberId> = self.all_buses.iter().map(|id| *id).collect();
        if let Some(set) = self.by_bus.get(&bus) {
            ids.extend(set.iter().copied());
        }
        if let Some(route) = route {
            if let Some(set) = self.by_route.get(&route) {
                ids.extend(set.iter().copied());
            }
        }
        self.resolve(ids)
    }

    /// Every channel registered for a user's notifications
    pub fn user_targets(&self, user: UserId) -> Vec<Target> {
        let ids: FxHashSet<SubscriberId> = match self.by_user.get(&user) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };
        self.resolve(ids)
    }

    pub fn has_user_channel(&self, user: UserId) -> bool {
        self.by_user.get(&user).is_some_and(|set| !set.is_empty())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn resolve(&self, ids: FxHashSet<SubscriberId>) -> Vec<Target> {
        ids.into_iter()
            .filter_map(|id| self.slots.get(&id).map(|slot| Target { id, tx: slot.tx.clone() }))
            .collect()
    }

    fn index_insert(&self, id: SubscriberId, interest: Interest) {
        match interest {
            Interest::AllBuses => {
                self.all_buses.insert(id);
            }
            Interest::Bus(bus) => {
                self.by_bus.entry(bus).or_default().insert(id);
            }
            Interest::Route(route) => {
                self.by_route.entry(route).or_default().insert(id);
            }
            Interest::User(user) => {
                self.by_user.entry(user).or_default().insert(id);
            }
        }
    }

    fn index_remove(&self, id: SubscriberId, interest: Interest) {
        match interest {
            Interest::AllBuses => {
                self.all_buses.remove(&id);
            }
            Interest::Bus(bus) => {
                self.by_bus.remove_if_mut(&bus, |_, set| {
                    set.remove(&id);
                    set.is_empty()
                });
            }
            Interest::Route(route) => {
                self.by_route.remove_if_mut(&route, |_, set| {
                    set.remove(&id);
                    set.is_empty()
                });
            }
            Interest::User(user) => {
                self.by_user.remove_if_mut(&user, |_, set| {
                    set.remove(&id);
                    set.is_empty()
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(4, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_subscribe_assigns_unique_ids() {
        let reg = registry();
        let a = reg.subscribe(Interest::AllBuses);
        let b = reg.subscribe(Interest::AllBuses);
        assert_ne!(a.id, b.id);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_bus_targets_by_interest() {
        let reg = registry();
        let all = reg.subscribe(Interest::AllBuses);
        let bus7 = reg.subscribe(Interest::Bus(BusId(7)));
        let bus8 = reg.subscribe(Interest::Bus(BusId(8)));
        let route3 = reg.subscribe(Interest::Route(RouteId(3)));
        let user = reg.subscribe(Interest::User(UserId(1)));

        let mut ids: Vec<_> =
            reg.bus_targets(BusId(7), Some(RouteId(3))).into_iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![all.id, bus7.id, route3.id]);

        let ids: Vec<_> = reg.bus_targets(BusId(9), None).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![all.id]);

        assert!(!ids.contains(&bus8.id));
        assert!(!ids.contains(&user.id));
    }

    #[test]
    fn test_overlapping_interests_deduplicated() {
        let reg = registry();
        let sub = reg.subscribe(Interest::AllBuses);
        assert!(reg.add_interest(sub.id, Interest::Bus(BusId(7))));
        assert!(reg.add_interest(sub.id, Interest::Route(RouteId(3))));

        let targets = reg.bus_targets(BusId(7), Some(RouteId(3)));
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_cleans_indexes() {
        let reg = registry();
        let sub = reg.subscribe(Interest::Bus(BusId(7)));
        reg.add_interest(sub.id, Interest::User(UserId(5)));

        assert!(reg.unsubscribe(sub.id));
        assert!(!reg.unsubscribe(sub.id));
        assert!(reg.bus_targets(BusId(7), None).is_empty());
        assert!(!reg.has_user_channel(UserId(5)));
        assert!(reg.by_bus.is_empty());
        assert!(reg.is_empty());
        assert!(!reg.add_interest(sub.id, Interest::AllBuses));
    }

    #[test]
    fn test_target_reports_full_and_closed() {
        let reg = SubscriptionRegistry::new(1, Arc::new(Metrics::new()));
        let sub = reg.subscribe(Interest::User(UserId(1)));
        let target = reg.user_targets(UserId(1)).pop().unwrap();

        let msg = || {
            Outbound::Notification(Notification::new(
                UserId(1),
                crate::domain::NotificationKind::CheckIn,
                "hi",
            ))
        };
        assert_eq!(target.deliver(msg()), Delivered::Ok);
        assert_eq!(target.deliver(msg()), Delivered::Full);

        drop(sub);
        assert_eq!(target.deliver(msg()), Delivered::Closed);
    }

    #[test]
    fn test_outbound_is_tagged() {
        let n = Notification::new(UserId(1), crate::domain::NotificationKind::DelayAlert, "late");
        let json = serde_json::to_value(Outbound::Notification(n)).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["kind"], "delay_alert");
    }
}
