use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::feed::{ChangeFeed, FeedError, SubscriberId};
use crate::limits::MAX_TRACKED_TRIPS;
use crate::model::*;
use crate::observability;
use crate::parse::parse_change;

/// What a channel task hands back to its tracker.
#[derive(Debug)]
pub(crate) enum Delivery {
    Opened {
        generation: u64,
        trip_id: TripId,
        key: ChannelKey,
    },
    Failed {
        generation: u64,
        trip_id: TripId,
        key: ChannelKey,
        error: FeedError,
    },
    Change {
        generation: u64,
        trip_id: TripId,
        fallback: u32,
        table: Table,
        reconcile: Reconcile,
    },
}

impl Delivery {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            Delivery::Opened { generation, .. }
            | Delivery::Failed { generation, .. }
            | Delivery::Change { generation, .. } => *generation,
        }
    }
}

/// Channels a live trip listens on: its own row, its aggregate if it has
/// one, and both reservation tables.
pub fn channels_for(trip: &Trip) -> Vec<ChannelKey> {
    let id = trip.id.as_str();
    let mut keys = vec![ChannelKey::on(Table::Trips, id)];
    if let Some(agg) = &trip.availability_id {
        keys.push(ChannelKey::on(Table::SeatAvailability, agg));
    }
    keys.push(ChannelKey::on(Table::Reservations, id));
    keys.push(ChannelKey::on(Table::ReservationsTrajets, id));
    keys
}

#[derive(Debug, Default)]
struct Slot {
    closed: bool,
    subscriber: Option<SubscriberId>,
}

/// Link between a handle and its channel task. Whichever side comes second
/// detaches the subscriber from the feed, so closing never waits on the task.
struct Attachment {
    feed: Arc<dyn ChangeFeed>,
    key: ChannelKey,
    slot: Mutex<Slot>,
}

impl Attachment {
    fn new(feed: Arc<dyn ChangeFeed>, key: ChannelKey) -> Self {
        Self {
            feed,
            key,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Record the subscriber. False if the handle was closed meanwhile, in
    /// which case the subscriber is already detached again.
    fn attach(&self, id: SubscriberId) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            drop(slot);
            self.feed.unsubscribe(&self.key, id);
            return false;
        }
        slot.subscriber = Some(id);
        true
    }

    fn detach(&self) {
        let id = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.closed = true;
            slot.subscriber.take()
        };
        if let Some(id) = id {
            self.feed.unsubscribe(&self.key, id);
        }
    }
}

/// One open channel for one trip. Closing detaches it from the feed before
/// returning, is idempotent, and also happens on drop.
pub struct SubscriptionHandle {
    trip_id: TripId,
    key: ChannelKey,
    attachment: Arc<Attachment>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("trip_id", &self.trip_id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn trip_id(&self) -> &TripId {
        &self.trip_id
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn close(&mut self) {
        self.attachment.detach();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keeps the gauge honest however the channel task ends (including abort).
struct ActiveChannel;

impl ActiveChannel {
    fn open() -> Self {
        metrics::gauge!(observability::SUBSCRIPTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        metrics::gauge!(observability::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
    }
}

/// Owns every channel opened for one tracked trip list.
pub(crate) struct SubscriptionManager<F: ChangeFeed> {
    feed: Arc<F>,
    tx: mpsc::UnboundedSender<Delivery>,
    handles: Vec<SubscriptionHandle>,
}

impl<F: ChangeFeed> SubscriptionManager<F> {
    pub(crate) fn new(feed: Arc<F>, tx: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            feed,
            tx,
            handles: Vec::new(),
        }
    }

    pub(crate) fn handles(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Open channels for every live trip. Opening does not wait on the feed:
    /// each channel is its own task and reports back `Opened` or `Failed`.
    /// Returns the number of channels requested.
    pub(crate) fn open(&mut self, generation: u64, trips: &[Trip]) -> usize {
        let live: Vec<&Trip> = trips.iter().filter(|t| !t.id.is_fixture()).collect();
        if live.len() > MAX_TRACKED_TRIPS {
            warn!(
                trips = live.len(),
                limit = MAX_TRACKED_TRIPS,
                "too many live trips, extra trips keep their declared seats"
            );
        }

        let mut unique = HashSet::new();
        let mut opened = 0;
        for trip in live.into_iter().take(MAX_TRACKED_TRIPS) {
            for key in channels_for(trip) {
                if !unique.insert((trip.id.clone(), key.clone())) {
                    continue;
                }
                let feed: Arc<dyn ChangeFeed> = self.feed.clone();
                let attachment = Arc::new(Attachment::new(feed, key.clone()));
                let task = tokio::spawn(run_channel(
                    self.feed.clone(),
                    attachment.clone(),
                    key.clone(),
                    trip.id.clone(),
                    trip.declared_seats,
                    generation,
                    self.tx.clone(),
                ));
                self.handles.push(SubscriptionHandle {
                    trip_id: trip.id.clone(),
                    key,
                    attachment,
                    task: Some(task),
                });
                opened += 1;
            }
        }
        opened
    }

    /// Close every handle. Every subscriber is detached from the feed by the
    /// time this returns. Safe to call when nothing is open.
    pub(crate) fn close_all(&mut self) -> usize {
        let closed = self.handles.len();
        for handle in &mut self.handles {
            handle.close();
        }
        self.handles.clear();
        closed
    }
}

/// Channel task: subscribe, then parse and forward every change until the
/// handle is closed or the feed drops the channel.
async fn run_channel<F: ChangeFeed>(
    feed: Arc<F>,
    attachment: Arc<Attachment>,
    key: ChannelKey,
    trip_id: TripId,
    fallback: u32,
    generation: u64,
    tx: mpsc::UnboundedSender<Delivery>,
) {
    let mut rx = match feed.subscribe(&key).await {
        Ok(subscription) => {
            if !attachment.attach(subscription.id) {
                return;
            }
            subscription.rx
        }
        Err(error) => {
            warn!(%trip_id, %key, "subscription failed, seats stay at last known value: {error}");
            metrics::counter!(observability::SUBSCRIBE_FAILURES_TOTAL, "table" => key.table.name())
                .increment(1);
            let _ = tx.send(Delivery::Failed {
                generation,
                trip_id,
                key,
                error,
            });
            return;
        }
    };
    let opened = Delivery::Opened {
        generation,
        trip_id: trip_id.clone(),
        key: key.clone(),
    };
    if tx.send(opened).is_err() {
        return;
    }
    let _active = ActiveChannel::open();

    loop {
        match rx.recv().await {
            Ok(change) => match parse_change(key.table, &change) {
                Ok(reconcile) => {
                    let delivery = Delivery::Change {
                        generation,
                        trip_id: trip_id.clone(),
                        fallback,
                        table: key.table,
                        reconcile,
                    };
                    if tx.send(delivery).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%trip_id, %key, change_id = %change.id, "dropping change: {e}");
                    metrics::counter!(observability::PAYLOADS_REJECTED_TOTAL, "reason" => e.label())
                        .increment(1);
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(%trip_id, %key, skipped, "feed lagged, seat count may be stale");
                metrics::counter!(observability::FEED_LAGGED_TOTAL).increment(skipped);
            }
            Err(RecvError::Closed) => {
                debug!(%trip_id, %key, "channel closed by feed");
                break;
            }
        }
    }
}
