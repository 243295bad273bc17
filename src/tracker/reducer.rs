use std::collections::{HashMap, VecDeque};

use ulid::Ulid;

use crate::limits::{MAX_PENDING_DELTAS, MAX_SEEN_CHANGES};
use crate::model::*;

// ── Live seat map ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct SeatEntry {
    seats: u32,
    /// Sequence of the absolute count `seats` was last derived from.
    absolute_seq: Option<Seq>,
    /// Versioned deltas newer than `absolute_seq`, in arrival order.
    pending: Vec<(Seq, u32)>,
    /// Change ids applied to this trip, oldest first.
    seen: VecDeque<Ulid>,
}

impl SeatEntry {
    fn new(seats: u32, absolute_seq: Option<Seq>) -> Self {
        Self {
            seats,
            absolute_seq,
            pending: Vec::new(),
            seen: VecDeque::new(),
        }
    }

    fn remember(&mut self, change_id: Ulid) {
        if self.seen.len() >= MAX_SEEN_CHANGES {
            self.seen.pop_front();
        }
        self.seen.push_back(change_id);
    }

    fn is_stale(&self, seq: Seq) -> bool {
        self.absolute_seq.is_some_and(|v| seq <= v)
    }
}

/// Result of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied { before: u32, after: u32 },
    /// Change id already applied.
    Duplicate,
    /// Older than the absolute count already in place.
    Stale,
}

/// Per-view map from trip id to the seat count on screen.
#[derive(Debug, Clone, Default)]
pub struct LiveSeatMap {
    entries: HashMap<TripId, SeatEntry>,
}

impl LiveSeatMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh map holding every trip's declared count.
    pub fn seed(trips: &[Trip]) -> Self {
        let mut map = Self::new();
        for trip in trips {
            map.entries.insert(
                trip.id.clone(),
                SeatEntry::new(trip.declared_seats, trip.as_of),
            );
        }
        map
    }

    pub fn get(&self, id: &TripId) -> Option<u32> {
        self.entries.get(id).map(|e| e.seats)
    }

    pub fn contains(&self, id: &TripId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TripId, u32)> {
        self.entries.iter().map(|(id, e)| (id, e.seats))
    }

    /// Apply one change to `trip_id`'s entry. No other entry is touched.
    ///
    /// Absolute counts overwrite, deltas subtract from the current value and
    /// floor at zero. With sequence numbers, an absolute count older than the
    /// one in place is ignored, a delta already covered by it is ignored, and
    /// a newer-than-absolute delta is re-applied on top of the next absolute.
    /// Without them, the last change applied wins. A change id is applied at
    /// most once per trip; the same change may still land on other trips.
    pub fn apply(&mut self, trip_id: &TripId, fallback: u32, change: &Reconcile) -> Outcome {
        let entry = self
            .entries
            .entry(trip_id.clone())
            .or_insert_with(|| SeatEntry::new(fallback, None));
        if entry.seen.contains(&change.change_id) {
            return Outcome::Duplicate;
        }
        let before = entry.seats;

        match (change.event, change.seq) {
            (SeatEvent::Absolute { seats }, None) => {
                entry.seats = seats;
                entry.pending.clear();
            }
            (SeatEvent::Absolute { seats }, Some(seq)) => {
                if entry.is_stale(seq) {
                    return Outcome::Stale;
                }
                entry.pending.retain(|(q, _)| *q > seq);
                let newer = entry
                    .pending
                    .iter()
                    .fold(0u32, |acc, (_, d)| acc.saturating_add(*d));
                entry.seats = seats.saturating_sub(newer);
                entry.absolute_seq = Some(seq);
            }
            (SeatEvent::Delta { consumed }, None) => {
                entry.seats = entry.seats.saturating_sub(consumed);
            }
            (SeatEvent::Delta { consumed }, Some(seq)) => {
                if entry.is_stale(seq) {
                    return Outcome::Stale;
                }
                entry.seats = entry.seats.saturating_sub(consumed);
                if entry.pending.len() >= MAX_PENDING_DELTAS {
                    entry.pending.remove(0);
                }
                entry.pending.push((seq, consumed));
            }
        }

        entry.remember(change.change_id);
        Outcome::Applied {
            before,
            after: entry.seats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TripId {
        TripId::from(s)
    }

    fn absolute(seats: u32) -> Reconcile {
        Reconcile {
            change_id: Ulid::new(),
            seq: None,
            event: SeatEvent::Absolute { seats },
        }
    }

    fn delta(consumed: u32) -> Reconcile {
        Reconcile {
            change_id: Ulid::new(),
            seq: None,
            event: SeatEvent::Delta { consumed },
        }
    }

    fn at(mut r: Reconcile, seq: Seq) -> Reconcile {
        r.seq = Some(seq);
        r
    }

    #[test]
    fn seed_holds_declared_counts() {
        let map = LiveSeatMap::seed(&[Trip::new("t1", 3), Trip::new("t2", 0)]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&id("t1")), Some(3));
        assert_eq!(map.get(&id("t2")), Some(0));
        assert_eq!(map.get(&id("t3")), None);
    }

    #[test]
    fn deltas_clamp_at_zero() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        assert_eq!(
            map.apply(&id("t1"), 3, &delta(2)),
            Outcome::Applied { before: 3, after: 1 }
        );
        assert_eq!(
            map.apply(&id("t1"), 3, &delta(5)),
            Outcome::Applied { before: 1, after: 0 }
        );
        assert_eq!(map.get(&id("t1")), Some(0));
    }

    #[test]
    fn absolute_overrides_clamped_value() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &delta(2));
        map.apply(&id("t1"), 3, &delta(5));
        map.apply(&id("t1"), 3, &absolute(3));
        assert_eq!(map.get(&id("t1")), Some(3));
    }

    #[test]
    fn never_negative_for_any_delta_sequence() {
        for start in 0..5u32 {
            let mut map = LiveSeatMap::seed(&[Trip::new("t1", start)]);
            for d in [0, 1, 7, 2, MAX_PENDING_DELTAS as u32, 1] {
                map.apply(&id("t1"), start, &delta(d));
                let seats = map.get(&id("t1")).unwrap();
                assert!(seats <= start);
            }
            assert_eq!(map.get(&id("t1")), Some(0));
        }
    }

    #[test]
    fn events_are_isolated_per_trip() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3), Trip::new("t2", 1)]);
        map.apply(&id("t2"), 1, &delta(1));
        assert_eq!(map.get(&id("t1")), Some(3));
        assert_eq!(map.get(&id("t2")), Some(0));
        map.apply(&id("t1"), 3, &absolute(2));
        assert_eq!(map.get(&id("t2")), Some(0));
    }

    #[test]
    fn unseeded_delta_falls_back_to_declared() {
        let mut map = LiveSeatMap::new();
        assert_eq!(
            map.apply(&id("t9"), 4, &delta(1)),
            Outcome::Applied { before: 4, after: 3 }
        );
    }

    #[test]
    fn redelivered_change_is_ignored() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        let change = delta(1);
        map.apply(&id("t1"), 3, &change);
        assert_eq!(map.apply(&id("t1"), 3, &change), Outcome::Duplicate);
        assert_eq!(map.get(&id("t1")), Some(2));
    }

    #[test]
    fn shared_change_applies_to_each_trip() {
        let mut map = LiveSeatMap::seed(&[Trip::new("ta", 4), Trip::new("tb", 4)]);
        let change = absolute(1);
        assert_eq!(
            map.apply(&id("ta"), 4, &change),
            Outcome::Applied { before: 4, after: 1 }
        );
        assert_eq!(
            map.apply(&id("tb"), 4, &change),
            Outcome::Applied { before: 4, after: 1 }
        );
        assert_eq!(map.apply(&id("tb"), 4, &change), Outcome::Duplicate);
    }

    #[test]
    fn remembered_change_ids_are_bounded() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        let first = absolute(3);
        map.apply(&id("t1"), 3, &first);
        for _ in 0..MAX_SEEN_CHANGES {
            map.apply(&id("t1"), 3, &absolute(3));
        }
        assert_eq!(map.entries[&id("t1")].seen.len(), MAX_SEEN_CHANGES);
        assert!(!map.entries[&id("t1")].seen.contains(&first.change_id));
    }

    #[test]
    fn unversioned_stale_delta_double_applies() {
        // Reservation insert arrives after the trip row already reflects it.
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &absolute(1));
        map.apply(&id("t1"), 3, &delta(2));
        assert_eq!(map.get(&id("t1")), Some(0));
    }

    #[test]
    fn versioned_delta_covered_by_absolute_is_stale() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &at(absolute(1), 11));
        assert_eq!(map.apply(&id("t1"), 3, &at(delta(2), 10)), Outcome::Stale);
        assert_eq!(map.get(&id("t1")), Some(1));
    }

    #[test]
    fn versioned_delta_then_absolute_agree() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &at(delta(2), 10));
        assert_eq!(map.get(&id("t1")), Some(1));
        map.apply(&id("t1"), 3, &at(absolute(1), 11));
        assert_eq!(map.get(&id("t1")), Some(1));
    }

    #[test]
    fn older_absolute_is_stale() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &at(absolute(0), 20));
        assert_eq!(map.apply(&id("t1"), 3, &at(absolute(2), 15)), Outcome::Stale);
        assert_eq!(map.get(&id("t1")), Some(0));
    }

    #[test]
    fn newer_deltas_survive_older_absolute() {
        // Deltas 12 and 14 land before the absolute count read at 11.
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 5)]);
        map.apply(&id("t1"), 5, &at(delta(1), 12));
        map.apply(&id("t1"), 5, &at(delta(2), 14));
        assert_eq!(map.get(&id("t1")), Some(2));
        map.apply(&id("t1"), 5, &at(absolute(4), 11));
        assert_eq!(map.get(&id("t1")), Some(1));
        // A later absolute covers both.
        map.apply(&id("t1"), 5, &at(absolute(1), 15));
        assert_eq!(map.get(&id("t1")), Some(1));
    }

    #[test]
    fn seeded_snapshot_rejects_older_changes() {
        let mut trip = Trip::new("t1", 2);
        trip.as_of = Some(30);
        let mut map = LiveSeatMap::seed(&[trip]);
        assert_eq!(map.apply(&id("t1"), 2, &at(delta(1), 29)), Outcome::Stale);
        assert_eq!(map.apply(&id("t1"), 2, &at(absolute(3), 30)), Outcome::Stale);
        assert_eq!(
            map.apply(&id("t1"), 2, &at(delta(1), 31)),
            Outcome::Applied { before: 2, after: 1 }
        );
    }

    #[test]
    fn unversioned_absolute_always_wins() {
        let mut map = LiveSeatMap::seed(&[Trip::new("t1", 3)]);
        map.apply(&id("t1"), 3, &at(absolute(0), 50));
        map.apply(&id("t1"), 3, &absolute(3));
        assert_eq!(map.get(&id("t1")), Some(3));
    }
}
