use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::limits::{DEFAULT_FEED_CAPACITY, MAX_ID_LEN};
use crate::model::{ChannelKey, RowChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    Unreachable(String),
    MalformedFilter(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Unreachable(e) => write!(f, "feed unreachable: {e}"),
            FeedError::MalformedFilter(e) => write!(f, "malformed filter: {e}"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Identifies one subscriber on one channel.
pub type SubscriberId = u64;

/// An open channel: the receiver plus the id to unsubscribe it with.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: broadcast::Receiver<RowChange>,
}

/// A realtime change feed.
///
/// `subscribe` opens one channel. `unsubscribe` detaches it at once; the
/// receiver then drains what was already buffered and sees `Closed`.
/// Unsubscribing twice, or after the feed dropped the channel, is a no-op.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, key: &ChannelKey) -> Result<Subscription, FeedError>;

    fn unsubscribe(&self, key: &ChannelKey, id: SubscriberId);
}

/// In-process change feed: one broadcast sender per subscriber, grouped by
/// `ChannelKey`.
pub struct MemoryFeed {
    channels: DashMap<ChannelKey, HashMap<SubscriberId, broadcast::Sender<RowChange>>>,
    next_id: AtomicU64,
    online: AtomicBool,
    capacity: usize,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
            capacity: capacity.max(1),
        }
    }

    /// While offline every `subscribe` fails. Open channels keep delivering.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Push a change to every subscriber whose table, kind and filter match.
    /// Returns how many receivers got it. Subscribers whose receiver is gone
    /// are dropped on the way.
    pub fn publish(&self, change: &RowChange) -> usize {
        self.channels.retain(|_, subs| {
            subs.retain(|_, tx| tx.receiver_count() > 0);
            !subs.is_empty()
        });
        let mut delivered = 0;
        for entry in self.channels.iter() {
            let key = entry.key();
            if key.table.name() != change.table
                || key.kind != change.kind
                || !key.filter.matches(&change.new)
            {
                continue;
            }
            for tx in entry.value().values() {
                delivered += tx.send(change.clone()).unwrap_or(0);
            }
        }
        delivered
    }

    /// Number of channels with at least one attached subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|e| e.value().values().any(|tx| tx.receiver_count() > 0))
            .count()
    }

    /// Subscribers still attached to `key`.
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.channels.get(key).map_or(0, |subs| {
            subs.values().filter(|tx| tx.receiver_count() > 0).count()
        })
    }

    /// Drop a channel outright; its receivers see `Closed`.
    pub fn remove(&self, key: &ChannelKey) {
        self.channels.remove(key);
    }
}

fn validate_filter(key: &ChannelKey) -> Result<(), FeedError> {
    let filter = &key.filter;
    if filter.column.is_empty() || filter.value.is_empty() {
        return Err(FeedError::MalformedFilter(format!("empty filter on {}", key.table)));
    }
    if filter.value.len() > MAX_ID_LEN {
        return Err(FeedError::MalformedFilter(format!(
            "filter value longer than {MAX_ID_LEN} bytes"
        )));
    }
    if filter.value.chars().any(|c| c.is_control() || c == ',' || c == ')') {
        return Err(FeedError::MalformedFilter(format!("bad filter value {:?}", filter.value)));
    }
    Ok(())
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, key: &ChannelKey) -> Result<Subscription, FeedError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(FeedError::Unreachable("memory feed is offline".into()));
        }
        validate_filter(key)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = broadcast::channel(self.capacity);
        self.channels.entry(key.clone()).or_default().insert(id, tx);
        Ok(Subscription { id, rx })
    }

    fn unsubscribe(&self, key: &ChannelKey, id: SubscriberId) {
        if let Some(mut subs) = self.channels.get_mut(key) {
            subs.remove(&id);
        }
        self.channels.remove_if(key, |_, subs| subs.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let feed = MemoryFeed::new();
        let key = ChannelKey::on(Table::Trips, "t1");
        let mut rx = feed.subscribe(&key).await.unwrap().rx;

        let change = RowChange::new(
            Table::Trips,
            ChangeKind::Update,
            json!({"id": "t1", "available_seats": 2}),
        );
        assert_eq!(feed.publish(&change), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, change);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let feed = MemoryFeed::new();
        let change = RowChange::new(
            Table::Reservations,
            ChangeKind::Insert,
            json!({"trip_id": "t1", "seats_reserved": 1}),
        );
        assert_eq!(feed.publish(&change), 0);
    }

    #[tokio::test]
    async fn filter_and_kind_must_match() {
        let feed = MemoryFeed::new();
        let mut rx = feed
            .subscribe(&ChannelKey::on(Table::Reservations, "t1"))
            .await
            .unwrap()
            .rx;

        let other_trip = RowChange::new(
            Table::Reservations,
            ChangeKind::Insert,
            json!({"trip_id": "t2", "seats_reserved": 1}),
        );
        let update = RowChange::new(
            Table::Reservations,
            ChangeKind::Update,
            json!({"trip_id": "t1", "seats_reserved": 1}),
        );
        let legacy = RowChange::new(
            Table::ReservationsTrajets,
            ChangeKind::Insert,
            json!({"trajet_id": "t1", "places_reservees": 1}),
        );
        assert_eq!(feed.publish(&other_trip), 0);
        assert_eq!(feed.publish(&update), 0);
        assert_eq!(feed.publish(&legacy), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let feed = MemoryFeed::new();
        let key = ChannelKey::on(Table::Trips, "t1");
        let sub = feed.subscribe(&key).await.unwrap();
        assert_eq!(feed.channel_count(), 1);
        drop(sub);
        assert_eq!(feed.channel_count(), 0);
        let change = RowChange::new(
            Table::Trips,
            ChangeKind::Update,
            json!({"id": "t1", "available_seats": 1}),
        );
        assert_eq!(feed.publish(&change), 0);
        assert!(feed.channels.is_empty());
    }

    #[tokio::test]
    async fn offline_feed_refuses_subscriptions() {
        let feed = MemoryFeed::new();
        feed.set_online(false);
        let err = feed
            .subscribe(&ChannelKey::on(Table::Trips, "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Unreachable(_)));
        feed.set_online(true);
        assert!(feed.subscribe(&ChannelKey::on(Table::Trips, "t1")).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_filters_rejected() {
        let feed = MemoryFeed::new();
        let long = "z".repeat(MAX_ID_LEN + 1);
        for value in ["", "a,b", "x)", long.as_str()] {
            let err = feed
                .subscribe(&ChannelKey::on(Table::Trips, value))
                .await
                .unwrap_err();
            assert!(matches!(err, FeedError::MalformedFilter(_)), "value {value:?}");
        }
    }

    #[tokio::test]
    async fn removed_channel_closes_receivers() {
        let feed = MemoryFeed::new();
        let key = ChannelKey::on(Table::SeatAvailability, "agg");
        let mut rx = feed.subscribe(&key).await.unwrap().rx;
        feed.remove(&key);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_detaches_immediately() {
        let feed = MemoryFeed::new();
        let key = ChannelKey::on(Table::Trips, "t1");
        let first = feed.subscribe(&key).await.unwrap();
        let mut second = feed.subscribe(&key).await.unwrap();
        assert_eq!(feed.subscriber_count(&key), 2);

        // The receiver is still alive, yet nothing reaches it any more.
        feed.unsubscribe(&key, first.id);
        assert_eq!(feed.subscriber_count(&key), 1);
        let change = RowChange::new(
            Table::Trips,
            ChangeKind::Update,
            json!({"id": "t1", "available_seats": 1}),
        );
        assert_eq!(feed.publish(&change), 1);
        assert_eq!(second.rx.recv().await.unwrap(), change);

        feed.unsubscribe(&key, first.id);
        feed.unsubscribe(&key, second.id);
        assert_eq!(feed.subscriber_count(&key), 0);
        assert_eq!(feed.channel_count(), 0);
        assert!(feed.channels.is_empty());
        assert!(matches!(
            second.rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        drop(first);
    }
}
