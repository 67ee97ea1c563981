//! Broadcast fan-out engine
//!
//! Decouples state mutation from delivery. The state store enqueues each
//! accepted bus delta through a [`FanoutHandle`]; a single [`FanoutEngine`]
//! task drains the queue and hands the snapshot to every interested
//! subscriber with a non-blocking send. Because the queue is FIFO and the
//! store publishes while it still holds the bus lock, subscribers observe
//! each bus's deltas in version order.
//!
//! A slow subscriber only loses its own copy (`Full`); a closed one is
//! removed from the registry. Neither affects any other subscriber.

use crate::domain::BusSnapshot;
use crate::infra::Metrics;
use crate::services::registry::{Delivered, Outbound, SubscriptionRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Enqueue side, cloned into the state store
#[derive(Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<BusSnapshot>,
    metrics: Arc<Metrics>,
    /// Rate-limit drop warnings to 1 per second
    last_drop_warn: Arc<Mutex<Instant>>,
}

impl FanoutHandle {
    /// Queue a delta for broadcast. Never blocks.
    pub fn publish(&self, snapshot: BusSnapshot) {
        match self.tx.try_send(snapshot) {
            Ok(()) => self.metrics.record_broadcast_published(),
            Err(TrySendError::Full(snapshot)) => {
                self.metrics.record_broadcast_queue_full();
                let mut last = self.last_drop_warn.lock();
                if last.elapsed() > Duration::from_secs(1) {
                    warn!(bus_id = %snapshot.id, version = %snapshot.version, "broadcast_dropped: fanout queue full");
                    *last = Instant::now();
                }
            }
            Err(TrySendError::Closed(snapshot)) => {
                debug!(bus_id = %snapshot.id, "broadcast_skipped: fanout engine stopped");
            }
        }
    }
}

/// Outcome counts of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Worker that drains the broadcast queue
pub struct FanoutEngine {
    registry: Arc<SubscriptionRegistry>,
    rx: mpsc::Receiver<BusSnapshot>,
    metrics: Arc<Metrics>,
}

impl FanoutEngine {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        rx: mpsc::Receiver<BusSnapshot>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { registry, rx, metrics }
    }

    /// Run until every handle is dropped
    pub async fn run(mut self) {
        info!("fanout_engine_started");
        while let Some(snapshot) = self.rx.recv().await {
            self.dispatch(snapshot);
        }
        info!("fanout_engine_stopped");
    }

    /// Deliver one delta to every interested subscriber
    pub fn dispatch(&self, snapshot: BusSnapshot) -> DispatchReport {
        let targets = self.registry.bus_targets(snapshot.id, snapshot.route_id());
        let mut report = DispatchReport::default();

        for target in targets {
            match target.deliver(Outbound::BusUpdate(snapshot.clone())) {
                Delivered::Ok => {
                    report.delivered += 1;
                    self.metrics.record_delivery(true);
                }
                Delivered::Full => {
                    report.dropped += 1;
                    self.metrics.record_delivery(false);
                    debug!(subscriber_id = %target.id, bus_id = %snapshot.id, "delivery_dropped: subscriber slow");
                }
                Delivered::Closed => {
                    report.closed += 1;
                    self.registry.unsubscribe(target.id);
                }
            }
        }

        debug!(
            bus_id = %snapshot.id,
            version = %snapshot.version,
            delivered = %report.delivered,
            dropped = %report.dropped,
            closed = %report.closed,
            "broadcast_dispatched"
        );
        report
    }

    /// Dispatch everything already queued, without waiting for more
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(snapshot) = self.rx.try_recv() {
            self.dispatch(snapshot);
            count += 1;
        }
        count
    }
}

/// Create the broadcast queue and its engine
///
/// Returns the handle (for the state store) and the engine (to be spawned)
pub fn create_fanout(
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (FanoutHandle, FanoutEngine) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let handle = FanoutHandle {
        tx,
        metrics: metrics.clone(),
        last_drop_warn: Arc::new(Mutex::new(Instant::now() - Duration::from_secs(2))),
    };
    (handle, FanoutEngine::new(registry, rx, metrics))
}
