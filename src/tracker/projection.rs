use crate::model::Trip;

use super::reducer::LiveSeatMap;

/// One rendered line of the trip list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatRow<'a> {
    pub trip: &'a Trip,
    pub seats: u32,
    /// False for fixtures, which never receive live updates.
    pub live: bool,
}

/// Seat count to display: the live value if there is one, else the declared one.
pub fn live_count(seats: &LiveSeatMap, trip: &Trip) -> u32 {
    seats.get(&trip.id).unwrap_or(trip.declared_seats)
}

/// Read model for the whole list, in list order.
pub fn project<'a>(trips: &'a [Trip], seats: &LiveSeatMap) -> Vec<SeatRow<'a>> {
    trips
        .iter()
        .map(|trip| SeatRow {
            trip,
            seats: live_count(seats, trip),
            live: !trip.id.is_fixture(),
        })
        .collect()
}
