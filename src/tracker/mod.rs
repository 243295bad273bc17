mod projection;
mod reducer;
mod subscriptions;

pub use projection::{live_count, project, SeatRow};
pub use reducer::{LiveSeatMap, Outcome};
pub use subscriptions::{channels_for, SubscriptionHandle};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::feed::ChangeFeed;
use crate::model::*;
use crate::observability;

use subscriptions::{Delivery, SubscriptionManager};

/// Live seat counts for one displayed trip list.
///
/// Owned by a single view and driven through `&mut self`: deliveries from
/// every channel queue up and are applied one at a time, so the map is
/// never shared and never locked. Calling `track` again tears the previous
/// list down, rebuilds the map from the new list, and reopens channels.
pub struct SeatTracker<F: ChangeFeed> {
    trips: Vec<Trip>,
    seats: LiveSeatMap,
    generation: u64,
    mounted: bool,
    /// Channels of the current generation not yet reported open or failed.
    pending_opens: usize,
    /// Trips with at least one channel that failed to open.
    degraded: HashSet<TripId>,
    subscriptions: SubscriptionManager<F>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl<F: ChangeFeed> SeatTracker<F> {
    pub fn new(feed: Arc<F>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            trips: Vec::new(),
            seats: LiveSeatMap::new(),
            generation: 0,
            mounted: false,
            pending_opens: 0,
            degraded: HashSet::new(),
            subscriptions: SubscriptionManager::new(feed, tx),
            rx,
        }
    }

    /// Start tracking `trips`. Old channels are closed first, then the map is
    /// seeded with every declared count, then new channels are opened.
    /// Must run inside a tokio runtime.
    pub fn track(&mut self, trips: Vec<Trip>) {
        let closed = self.subscriptions.close_all();
        self.generation += 1;
        self.mounted = true;
        self.seats = LiveSeatMap::seed(&trips);
        self.degraded.clear();
        self.trips = trips;
        self.pending_opens = self.subscriptions.open(self.generation, &self.trips);

        metrics::gauge!(observability::TRACKED_TRIPS).set(self.trips.len() as f64);
        info!(
            generation = self.generation,
            trips = self.trips.len(),
            channels = self.pending_opens,
            closed,
            "tracking trip list"
        );
    }

    /// Tear the view down. Later deliveries are dropped unapplied.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        let closed = self.subscriptions.close_all();
        self.mounted = false;
        self.pending_opens = 0;
        metrics::gauge!(observability::TRACKED_TRIPS).set(0.0);
        info!(generation = self.generation, closed, "seat tracker unmounted");
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn trips(&self) -> &[Trip] {
        &self.trips
    }

    pub fn seats(&self) -> &LiveSeatMap {
        &self.seats
    }

    /// Seat count for a tracked trip, or `None` if it is not in the list.
    pub fn live_count(&self, id: &TripId) -> Option<u32> {
        self.trips
            .iter()
            .find(|t| t.id == *id)
            .map(|t| live_count(&self.seats, t))
    }

    /// Read model of the whole list.
    pub fn rows(&self) -> Vec<SeatRow<'_>> {
        project(&self.trips, &self.seats)
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        self.subscriptions.handles()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// True if some channel for this trip never opened; its count only
    /// moves through the channels that did.
    pub fn is_degraded(&self, id: &TripId) -> bool {
        self.degraded.contains(id)
    }

    /// Wait until every channel of the current list has reported in.
    /// Changes that land meanwhile are applied and returned.
    pub async fn settle(&mut self) -> Vec<SeatNotice> {
        let mut notices = Vec::new();
        while self.mounted && self.pending_opens > 0 {
            let Some(delivery) = self.rx.recv().await else {
                break;
            };
            notices.extend(self.handle(delivery));
        }
        notices
    }

    /// Wait for the next reservation or seat count change and return its
    /// notice. An absolute count equal to the one shown is applied silently.
    /// `None` once unmounted.
    pub async fn next_notice(&mut self) -> Option<SeatNotice> {
        while self.mounted {
            let delivery = self.rx.recv().await?;
            if let Some(notice) = self.handle(delivery) {
                return Some(notice);
            }
        }
        None
    }

    /// Apply everything already queued without waiting.
    pub fn drain(&mut self) -> Vec<SeatNotice> {
        let mut notices = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            notices.extend(self.handle(delivery));
        }
        notices
    }

    fn route_of(&self, id: &TripId) -> String {
        self.trips
            .iter()
            .find(|t| t.id == *id)
            .map(Trip::route)
            .unwrap_or_else(|| id.to_string())
    }

    pub(crate) fn handle(&mut self, delivery: Delivery) -> Option<SeatNotice> {
        if !self.mounted || delivery.generation() != self.generation {
            debug!(
                generation = delivery.generation(),
                current = self.generation,
                "dropping delivery for a torn-down list"
            );
            metrics::counter!(observability::CHANGES_IGNORED_TOTAL, "reason" => "torn_down")
                .increment(1);
            return None;
        }

        match delivery {
            Delivery::Opened { trip_id, key, .. } => {
                self.pending_opens = self.pending_opens.saturating_sub(1);
                debug!(%trip_id, %key, "channel open");
                None
            }
            Delivery::Failed {
                trip_id,
                key,
                error,
                ..
            } => {
                self.pending_opens = self.pending_opens.saturating_sub(1);
                debug!(%trip_id, %key, "trip degraded: {error}");
                self.degraded.insert(trip_id);
                None
            }
            Delivery::Change {
                trip_id,
                fallback,
                table,
                reconcile,
                ..
            } => {
                let start = Instant::now();
                let outcome = self.seats.apply(&trip_id, fallback, &reconcile);
                metrics::histogram!(observability::RECONCILE_DURATION_SECONDS)
                    .record(start.elapsed().as_secs_f64());

                let (before, after) = match outcome {
                    Outcome::Applied { before, after } => (before, after),
                    Outcome::Duplicate | Outcome::Stale => {
                        let reason = if outcome == Outcome::Duplicate { "duplicate" } else { "stale" };
                        debug!(%trip_id, %table, change_id = %reconcile.change_id, reason, "change ignored");
                        metrics::counter!(observability::CHANGES_IGNORED_TOTAL, "reason" => reason)
                            .increment(1);
                        return None;
                    }
                };
                metrics::counter!(
                    observability::CHANGES_APPLIED_TOTAL,
                    "kind" => observability::event_label(&reconcile.event)
                )
                .increment(1);

                let notice = match reconcile.event {
                    SeatEvent::Delta { consumed } => SeatNotice::ReservationMade {
                        route: self.route_of(&trip_id),
                        trip_id,
                        reserved: consumed,
                        seats: after,
                    },
                    SeatEvent::Absolute { .. } if before == after => {
                        debug!(%trip_id, %table, seats = after, "count confirmed");
                        return None;
                    }
                    SeatEvent::Absolute { .. } => SeatNotice::SeatsUpdated {
                        trip_id,
                        seats: after,
                    },
                };
                info!(%table, before, after, "{notice}");
                Some(notice)
            }
        }
    }
}
