use serde_json::Value;

use crate::limits::MAX_SEATS;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    WrongTable { expected: Table, got: String },
    WrongKind { table: Table, got: ChangeKind },
    NotAnObject(Table),
    MissingField { table: Table, field: &'static str },
    InvalidValue { table: Table, field: &'static str, value: String },
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::WrongTable { expected, got } => {
                write!(f, "change for table {got} on a {expected} channel")
            }
            PayloadError::WrongKind { table, got } => {
                write!(f, "unexpected {got:?} on {table}")
            }
            PayloadError::NotAnObject(table) => write!(f, "{table} row is not an object"),
            PayloadError::MissingField { table, field } => {
                write!(f, "{table} row has no {field}")
            }
            PayloadError::InvalidValue { table, field, value } => {
                write!(f, "{table}.{field} is not a seat count: {value}")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

impl PayloadError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PayloadError::WrongTable { .. } => "wrong_table",
            PayloadError::WrongKind { .. } => "wrong_kind",
            PayloadError::NotAnObject(_) => "not_an_object",
            PayloadError::MissingField { .. } => "missing_field",
            PayloadError::InvalidValue { .. } => "invalid_value",
        }
    }
}

/// Validate a raw change that arrived on a `table` channel and turn it into
/// a seat event. Update tables carry absolute counts, insert tables carry
/// the number of seats a reservation consumed.
pub fn parse_change(table: Table, change: &RowChange) -> Result<Reconcile, PayloadError> {
    if change.table != table.name() {
        return Err(PayloadError::WrongTable {
            expected: table,
            got: change.table.clone(),
        });
    }
    if change.kind != table.kind() {
        return Err(PayloadError::WrongKind {
            table,
            got: change.kind,
        });
    }
    let row = change
        .new
        .as_object()
        .ok_or(PayloadError::NotAnObject(table))?;
    let field = table.seat_column();
    let raw = row
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or(PayloadError::MissingField { table, field })?;
    let seats = seat_count(raw).ok_or_else(|| PayloadError::InvalidValue {
        table,
        field,
        value: raw.to_string(),
    })?;

    let event = match table.kind() {
        ChangeKind::Update => SeatEvent::Absolute { seats },
        ChangeKind::Insert => SeatEvent::Delta { consumed: seats },
    };
    Ok(Reconcile {
        change_id: change.id,
        seq: change.seq,
        event,
    })
}

/// Accepts non-negative integers, or strings holding one.
fn seat_count(v: &Value) -> Option<u32> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n <= MAX_SEATS)
}
