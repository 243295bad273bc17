use serde::Deserialize;

use crate::limits::MAX_SEATS;
use crate::model::{Trip, TripId};

#[derive(Debug)]
pub enum FetchError {
    Json(serde_json::Error),
    NegativePrice(TripId),
    TooManySeats { trip: TripId, seats: u32 },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Json(e) => write!(f, "malformed trip list: {e}"),
            FetchError::NegativePrice(id) => write!(f, "trip {id} has a negative price"),
            FetchError::TooManySeats { trip, seats } => {
                write!(f, "trip {trip} declares {seats} seats (max {MAX_SEATS})")
            }
        }
    }
}

impl std::error::Error for FetchError {}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Json(e)
    }
}

/// Ids arrive as either JSON numbers (fixtures) or strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnglishTrip {
    id: RawId,
    origin: String,
    destination: String,
    #[serde(default)]
    departure_time: String,
    #[serde(default)]
    price: f64,
    available_seats: u32,
    #[serde(default)]
    trip_id: Option<RawId>,
    #[serde(default)]
    seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrenchTrip {
    id: RawId,
    depart: String,
    arrivee: String,
    #[serde(default)]
    date_depart: String,
    #[serde(default)]
    prix: f64,
    places_disponibles: u32,
    #[serde(default)]
    trajet_id: Option<RawId>,
    #[serde(default)]
    seq: Option<u64>,
}

/// A trip row in either historical shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TripRecord {
    English(EnglishTrip),
    French(FrenchTrip),
}

fn price_cents(id: &TripId, euros: f64) -> Result<u32, FetchError> {
    if euros < 0.0 {
        return Err(FetchError::NegativePrice(id.clone()));
    }
    Ok((euros * 100.0).round() as u32)
}

/// The same bound the change parser puts on live counts.
fn seat_count(id: &TripId, seats: u32) -> Result<u32, FetchError> {
    if seats > MAX_SEATS {
        return Err(FetchError::TooManySeats {
            trip: id.clone(),
            seats,
        });
    }
    Ok(seats)
}

/// Map either shape onto the one `Trip` the tracker understands.
pub fn normalize(record: TripRecord) -> Result<Trip, FetchError> {
    match record {
        TripRecord::English(t) => {
            let id = TripId::new(t.id.into_string());
            Ok(Trip {
                price_cents: price_cents(&id, t.price)?,
                declared_seats: seat_count(&id, t.available_seats)?,
                id,
                origin: t.origin,
                destination: t.destination,
                departure: t.departure_time,
                availability_id: t.trip_id.map(RawId::into_string),
                as_of: t.seq,
            })
        }
        TripRecord::French(t) => {
            let id = TripId::new(t.id.into_string());
            Ok(Trip {
                price_cents: price_cents(&id, t.prix)?,
                declared_seats: seat_count(&id, t.places_disponibles)?,
                id,
                origin: t.depart,
                destination: t.arrivee,
                departure: t.date_depart,
                availability_id: t.trajet_id.map(RawId::into_string),
                as_of: t.seq,
            })
        }
    }
}

/// Parse a JSON array of trip rows, in order.
pub fn parse_trips(json: &str) -> Result<Vec<Trip>, FetchError> {
    let records: Vec<TripRecord> = serde_json::from_str(json)?;
    records.into_iter().map(normalize).collect()
}

/// Static trips shown when nothing else is available.
pub fn fixtures() -> Vec<Trip> {
    [
        ("1", "Paris", "Lyon", "08:00", 2500, 3),
        ("2", "Lyon", "Marseille", "10:30", 1800, 2),
        ("3", "Bordeaux", "Toulouse", "14:15", 1500, 4),
    ]
    .into_iter()
    .map(|(id, from, to, at, price, seats)| Trip {
        id: TripId::new(id),
        origin: from.to_string(),
        destination: to.to_string(),
        departure: at.to_string(),
        price_cents: price,
        declared_seats: seats,
        availability_id: None,
        as_of: None,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_rows_normalize() {
        let trips = parse_trips(
            r#"[{"id": "a1f3", "origin": "Nantes", "destination": "Rennes",
                 "departure_time": "2024-06-01T09:00", "price": 7.5,
                 "available_seats": 3, "trip_id": "agg-1", "seq": 12}]"#,
        )
        .unwrap();
        assert_eq!(trips.len(), 1);
        let t = &trips[0];
        assert_eq!(t.id.as_str(), "a1f3");
        assert_eq!(t.route(), "Nantes → Rennes");
        assert_eq!(t.price_cents, 750);
        assert_eq!(t.declared_seats, 3);
        assert_eq!(t.availability_id.as_deref(), Some("agg-1"));
        assert_eq!(t.as_of, Some(12));
    }

    #[test]
    fn french_rows_normalize() {
        let trips = parse_trips(
            r#"[{"id": "b7c9", "depart": "Lille", "arrivee": "Amiens",
                 "date_depart": "2024-06-02", "prix": 9,
                 "places_disponibles": 2, "trajet_id": 77}]"#,
        )
        .unwrap();
        let t = &trips[0];
        assert_eq!(t.origin, "Lille");
        assert_eq!(t.destination, "Amiens");
        assert_eq!(t.price_cents, 900);
        assert_eq!(t.declared_seats, 2);
        assert_eq!(t.availability_id.as_deref(), Some("77"));
        assert_eq!(t.as_of, None);
    }

    #[test]
    fn mixed_shapes_keep_order() {
        let trips = parse_trips(
            r#"[{"id": 5, "origin": "A", "destination": "B", "available_seats": 1},
                {"id": "x", "depart": "C", "arrivee": "D", "places_disponibles": 4}]"#,
        )
        .unwrap();
        assert_eq!(trips[0].id.as_str(), "5");
        assert!(trips[0].id.is_fixture());
        assert_eq!(trips[1].id.as_str(), "x");
        assert_eq!(trips[1].declared_seats, 4);
    }

    #[test]
    fn unknown_shape_rejected() {
        let err = parse_trips(r#"[{"id": "x", "seats": 2}]"#).unwrap_err();
        assert!(matches!(err, FetchError::Json(_)));
    }

    #[test]
    fn negative_seats_rejected() {
        assert!(parse_trips(
            r#"[{"id": "x", "origin": "A", "destination": "B", "available_seats": -1}]"#
        )
        .is_err());
    }

    #[test]
    fn seat_count_above_feed_bound_rejected() {
        let at_bound = format!(
            r#"[{{"id": "x", "depart": "A", "arrivee": "B", "places_disponibles": {MAX_SEATS}}}]"#
        );
        assert_eq!(parse_trips(&at_bound).unwrap()[0].declared_seats, MAX_SEATS);

        let over = format!(
            r#"[{{"id": "x", "origin": "A", "destination": "B", "available_seats": {}}}]"#,
            MAX_SEATS + 1
        );
        let err = parse_trips(&over).unwrap_err();
        assert!(matches!(err, FetchError::TooManySeats { seats, .. } if seats == MAX_SEATS + 1));
    }

    #[test]
    fn negative_price_rejected() {
        let err = parse_trips(
            r#"[{"id": "x", "origin": "A", "destination": "B", "price": -2, "available_seats": 1}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("negative price"));
    }

    #[test]
    fn fixtures_are_never_live() {
        assert!(fixtures().iter().all(|t| t.id.is_fixture()));
    }
}
