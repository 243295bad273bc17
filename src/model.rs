use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Backend commit sequence. Monotonic across every table of one backend.
pub type Seq = u64;

/// Identifier of a bookable trip.
///
/// Purely numeric ids are fixtures: static content that is rendered but never
/// live-tracked. Anything else is a persisted trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(String);

impl TripId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fixture(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TripId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The normalized trip every part of the crate works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub origin: String,
    pub destination: String,
    pub departure: String,
    pub price_cents: u32,
    /// Seat count as read by the fetch that produced this trip.
    pub declared_seats: u32,
    /// Join key into the `seat_availability` aggregate.
    pub availability_id: Option<String>,
    /// Commit sequence the declared seat count was read at, if known.
    pub as_of: Option<Seq>,
}

impl Trip {
    pub fn new(id: impl Into<String>, declared_seats: u32) -> Self {
        Self {
            id: TripId::new(id),
            origin: String::new(),
            destination: String::new(),
            departure: String::new(),
            price_cents: 0,
            declared_seats,
            availability_id: None,
            as_of: None,
        }
    }

    pub fn with_route(mut self, origin: &str, destination: &str) -> Self {
        self.origin = origin.to_string();
        self.destination = destination.to_string();
        self
    }

    pub fn with_availability(mut self, availability_id: &str) -> Self {
        self.availability_id = Some(availability_id.to_string());
        self
    }

    pub fn route(&self) -> String {
        format!("{} → {}", self.origin, self.destination)
    }
}

/// Tables the tracker listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// The trip row itself. Carries the authoritative seat count.
    Trips,
    /// Remaining-seats aggregate, keyed by the trip's availability id.
    SeatAvailability,
    /// Reservation records, current schema.
    Reservations,
    /// Reservation records, legacy French schema.
    ReservationsTrajets,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Trips,
        Table::SeatAvailability,
        Table::Reservations,
        Table::ReservationsTrajets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Trips => "trips",
            Table::SeatAvailability => "seat_availability",
            Table::Reservations => "reservations",
            Table::ReservationsTrajets => "reservations_trajets",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// The change kind the tracker subscribes to on this table.
    pub fn kind(self) -> ChangeKind {
        match self {
            Table::Trips | Table::SeatAvailability => ChangeKind::Update,
            Table::Reservations | Table::ReservationsTrajets => ChangeKind::Insert,
        }
    }

    /// Column holding the seat quantity.
    pub fn seat_column(self) -> &'static str {
        match self {
            Table::Trips => "available_seats",
            Table::SeatAvailability => "remaining_seats",
            Table::Reservations => "seats_reserved",
            Table::ReservationsTrajets => "places_reservees",
        }
    }

    /// Column the channel filter matches on.
    pub fn key_column(self) -> &'static str {
        match self {
            Table::Trips => "id",
            Table::SeatAvailability | Table::Reservations => "trip_id",
            Table::ReservationsTrajets => "trajet_id",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Equality filter on one column (`column=eq.value`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    /// Does the row's `column` equal `value`? Numbers compare by their
    /// decimal rendering.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Number(n)) => n.to_string() == self.value,
            _ => false,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// One change-feed channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub table: Table,
    pub kind: ChangeKind,
    pub filter: Filter,
}

impl ChannelKey {
    /// Channel on `table` filtered by its key column.
    pub fn on(table: Table, key: &str) -> Self {
        Self {
            table,
            kind: table.kind(),
            filter: Filter::eq(table.key_column(), key),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{}", self.table, self.kind, self.filter)
    }
}

/// Raw row-level change as pushed by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub id: Ulid,
    pub table: String,
    pub kind: ChangeKind,
    /// Commit sequence, when the backend attaches one.
    #[serde(default)]
    pub seq: Option<Seq>,
    pub new: serde_json::Value,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl RowChange {
    pub fn new(table: Table, kind: ChangeKind, new: serde_json::Value) -> Self {
        Self {
            id: Ulid::new(),
            table: table.name().to_string(),
            kind,
            seq: None,
            new,
            old: None,
        }
    }

    pub fn with_seq(mut self, seq: Seq) -> Self {
        self.seq = Some(seq);
        self
    }
}

// ── Reconciliation events ────────────────────────────────────────

/// What a validated change means for a seat count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatEvent {
    /// Overrides the count outright.
    Absolute { seats: u32 },
    /// Subtracts from the current count, floored at zero.
    Delta { consumed: u32 },
}

/// A parsed change, ready for the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconcile {
    pub change_id: Ulid,
    pub seq: Option<Seq>,
    pub event: SeatEvent,
}

/// UI-facing notification produced when a change lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatNotice {
    SeatsUpdated {
        trip_id: TripId,
        seats: u32,
    },
    ReservationMade {
        trip_id: TripId,
        route: String,
        reserved: u32,
        seats: u32,
    },
}

impl SeatNotice {
    pub fn trip_id(&self) -> &TripId {
        match self {
            SeatNotice::SeatsUpdated { trip_id, .. }
            | SeatNotice::ReservationMade { trip_id, .. } => trip_id,
        }
    }

    pub fn seats(&self) -> u32 {
        match self {
            SeatNotice::SeatsUpdated { seats, .. } | SeatNotice::ReservationMade { seats, .. } => {
                *seats
            }
        }
    }
}

impl fmt::Display for SeatNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeatNotice::SeatsUpdated { trip_id, seats } => {
                write!(f, "seats updated on {trip_id}: {seats} left")
            }
            SeatNotice::ReservationMade {
                route,
                reserved,
                seats,
                ..
            } => write!(
                f,
                "a reservation was made for {route}: {reserved} taken, {seats} left"
            ),
        }
    }
}
