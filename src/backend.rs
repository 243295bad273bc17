use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;
use ulid::Ulid;

use crate::feed::MemoryFeed;
use crate::limits::MAX_SEATS;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    NotFound(String),
    AlreadyExists(TripId),
    InvalidSeats(u32),
    InsufficientSeats { requested: u32, available: u32 },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotFound(id) => write!(f, "not found: {id}"),
            BackendError::AlreadyExists(id) => write!(f, "trip already exists: {id}"),
            BackendError::InvalidSeats(n) => {
                write!(f, "invalid seat quantity {n} (1..={MAX_SEATS})")
            }
            BackendError::InsufficientSeats {
                requested,
                available,
            } => write!(f, "requested {requested} seats, only {available} left"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Which reservation table a booking is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ledger {
    Current,
    Legacy,
}

impl Ledger {
    fn table(self) -> Table {
        match self {
            Ledger::Current => Table::Reservations,
            Ledger::Legacy => Table::ReservationsTrajets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub trip_id: TripId,
    pub seats: u32,
    pub ledger: Ledger,
}

struct TripRow {
    trip: Trip,
    /// Sequence of the last commit that touched this trip.
    seq: Seq,
}

type SharedTripRow = Arc<RwLock<TripRow>>;

/// In-memory stand-in for the hosted database: trip rows, the seat
/// availability aggregate, and reservations in both schemas. Every commit
/// gets a sequence number and is published on the feed.
pub struct MemoryBackend {
    trips: DashMap<TripId, SharedTripRow>,
    reservations: DashMap<Ulid, Reservation>,
    seq: AtomicU64,
    feed: Arc<MemoryFeed>,
}

impl MemoryBackend {
    pub fn new(feed: Arc<MemoryFeed>) -> Self {
        Self {
            trips: DashMap::new(),
            reservations: DashMap::new(),
            seq: AtomicU64::new(0),
            feed,
        }
    }

    pub fn feed(&self) -> &Arc<MemoryFeed> {
        &self.feed
    }

    fn next_seq(&self) -> Seq {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn get_trip(&self, id: &TripId) -> Result<SharedTripRow, BackendError> {
        self.trips
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    /// Sequence and publish one change. Caller holds the trip's write lock.
    fn commit(&self, row: &mut TripRow, mut change: RowChange) {
        let seq = self.next_seq();
        change.seq = Some(seq);
        row.seq = seq;
        let reached = self.feed.publish(&change);
        debug!(table = %change.table, seq, reached, "committed change");
    }

    /// Publish the trip row and, if it has one, its aggregate.
    fn commit_seat_count(&self, row: &mut TripRow, previous: u32) {
        let trip = &row.trip;
        let mut change = RowChange::new(
            Table::Trips,
            ChangeKind::Update,
            json!({
                "id": trip.id.as_str(),
                "origin": trip.origin,
                "destination": trip.destination,
                "available_seats": trip.declared_seats,
            }),
        );
        change.old = Some(json!({ "id": trip.id.as_str(), "available_seats": previous }));
        let aggregate = trip.availability_id.as_ref().map(|agg| {
            RowChange::new(
                Table::SeatAvailability,
                ChangeKind::Update,
                json!({ "trip_id": agg, "remaining_seats": trip.declared_seats }),
            )
        });
        self.commit(row, change);
        if let Some(agg) = aggregate {
            self.commit(row, agg);
        }
    }

    pub async fn insert_trip(&self, trip: Trip) -> Result<(), BackendError> {
        if trip.declared_seats > MAX_SEATS {
            return Err(BackendError::InvalidSeats(trip.declared_seats));
        }
        if self.trips.contains_key(&trip.id) {
            return Err(BackendError::AlreadyExists(trip.id));
        }
        let seq = self.next_seq();
        self.trips
            .insert(trip.id.clone(), Arc::new(RwLock::new(TripRow { trip, seq })));
        Ok(())
    }

    /// Current trips, ordered by departure then id, each stamped with the
    /// sequence its seat count was read at.
    pub async fn fetch_trips(&self) -> Vec<Trip> {
        let rows: Vec<SharedTripRow> = self.trips.iter().map(|e| e.value().clone()).collect();
        let mut trips = Vec::with_capacity(rows.len());
        for row in rows {
            let guard = row.read().await;
            let mut trip = guard.trip.clone();
            trip.as_of = Some(guard.seq);
            trips.push(trip);
        }
        trips.sort_by(|a, b| a.departure.cmp(&b.departure).then_with(|| a.id.cmp(&b.id)));
        trips
    }

    pub async fn seats(&self, id: &TripId) -> Result<u32, BackendError> {
        let row = self.get_trip(id)?;
        let guard = row.read().await;
        Ok(guard.trip.declared_seats)
    }

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    /// Book `seats` on a trip. The reservation record is written first,
    /// then the trip row and aggregate are decremented.
    pub async fn reserve(
        &self,
        trip_id: &TripId,
        seats: u32,
        ledger: Ledger,
    ) -> Result<Ulid, BackendError> {
        if seats == 0 || seats > MAX_SEATS {
            return Err(BackendError::InvalidSeats(seats));
        }
        let row = self.get_trip(trip_id)?;
        let mut guard = row.write().await;
        let available = guard.trip.declared_seats;
        if seats > available {
            return Err(BackendError::InsufficientSeats {
                requested: seats,
                available,
            });
        }

        let id = Ulid::new();
        let table = ledger.table();
        let record = match ledger {
            Ledger::Current => json!({
                "id": id.to_string(),
                "trip_id": trip_id.as_str(),
                "seats_reserved": seats,
            }),
            Ledger::Legacy => json!({
                "id": id.to_string(),
                "trajet_id": trip_id.as_str(),
                "places_reservees": seats,
            }),
        };
        self.reservations.insert(
            id,
            Reservation {
                id,
                trip_id: trip_id.clone(),
                seats,
                ledger,
            },
        );
        self.commit(&mut guard, RowChange::new(table, ChangeKind::Insert, record));

        guard.trip.declared_seats = available - seats;
        self.commit_seat_count(&mut guard, available);
        Ok(id)
    }

    /// Cancel a reservation and give its seats back.
    pub async fn cancel(&self, reservation_id: &Ulid) -> Result<TripId, BackendError> {
        let (_, reservation) = self
            .reservations
            .remove(reservation_id)
            .ok_or_else(|| BackendError::NotFound(reservation_id.to_string()))?;
        let row = self.get_trip(&reservation.trip_id)?;
        let mut guard = row.write().await;
        let previous = guard.trip.declared_seats;
        guard.trip.declared_seats = (previous + reservation.seats).min(MAX_SEATS);
        self.commit_seat_count(&mut guard, previous);
        Ok(reservation.trip_id)
    }

    /// Driver edit: overwrite the seat count.
    pub async fn set_seats(&self, trip_id: &TripId, seats: u32) -> Result<(), BackendError> {
        if seats > MAX_SEATS {
            return Err(BackendError::InvalidSeats(seats));
        }
        let row = self.get_trip(trip_id)?;
        let mut guard = row.write().await;
        let previous = guard.trip.declared_seats;
        guard.trip.declared_seats = seats;
        self.commit_seat_count(&mut guard, previous);
        Ok(())
    }
}
