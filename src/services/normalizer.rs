//! Raw tracker record normalization
//!
//! Tracker platforms push loosely typed JSON: numbers arrive as numbers or
//! strings, keys differ between the platform's native export (`Ident`,
//! `PositionLatitude`) and the nested form used by replayed logs
//! (`position.latitude`). Everything is folded into a `VehicleEvent` here so
//! the rest of the engine only sees one shape.

use crate::domain::types::{
    DispatchContext, DispatchLogId, DispatchStatus, Position, TrackerIdent, VehicleEvent,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

const IDENT_KEYS: [&str; 3] = ["Ident", "ident", "tracker_ident"];
const VEHICLE_KEYS: [&str; 2] = ["vehicle_id", "VehicleId"];
const LATITUDE_KEYS: [&str; 3] = ["PositionLatitude", "position.latitude", "latitude"];
const LONGITUDE_KEYS: [&str; 3] = ["PositionLongitude", "position.longitude", "longitude"];
const SPEED_KEYS: [&str; 3] = ["PositionSpeed", "position.speed", "speed"];
const TIMESTAMP_KEYS: [&str; 2] = ["Timestamp", "timestamp"];
const DISPATCH_KEYS: [&str; 2] = ["dispatch", "dispatch_context"];

/// Look up a key, following one level of nesting for dotted keys
fn lookup<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let value = match key.split_once('.') {
        Some((outer, inner)) => record.get(outer)?.as_object()?.get(inner),
        None => record.get(key),
    };
    value.filter(|v| !v.is_null())
}

fn first<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| lookup(record, k))
}

/// Numbers may be JSON numbers or numeric strings
fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn as_id_string(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

fn as_log_id(value: &Value) -> Option<DispatchLogId> {
    let id = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    id.map(DispatchLogId)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Value::String(s) = value {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s.trim()) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    let secs = as_f64(value)?;
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// (0, 0) and out-of-range pairs mean the tracker has no fix
fn parse_position(record: &Map<String, Value>) -> Option<Position> {
    let latitude = first(record, &LATITUDE_KEYS).and_then(as_f64)?;
    let longitude = first(record, &LONGITUDE_KEYS).and_then(as_f64)?;

    if latitude == 0.0 && longitude == 0.0 {
        return None;
    }
    if latitude.abs() > 90.0 || longitude.abs() > 180.0 {
        return None;
    }

    let speed_kmh = first(record, &SPEED_KEYS).and_then(as_f64).filter(|s| *s >= 0.0);
    Some(Position { latitude, longitude, speed_kmh })
}

fn parse_dispatch(record: &Map<String, Value>) -> Option<DispatchContext> {
    let ctx = first(record, &DISPATCH_KEYS)?.as_object()?;
    let dispatch_log_id = ctx.get("dispatch_logs_id").and_then(as_log_id)?;
    let status = ctx.get("status").and_then(Value::as_str).and_then(DispatchStatus::from_wire)?;
    match status {
        DispatchStatus::Idle => None,
        status => Some(DispatchContext { dispatch_log_id, status }),
    }
}

/// Normalize one raw record
///
/// Returns `None` when the record is not an object or has no tracker ident.
/// Missing coordinates produce a no-position event rather than a rejection.
pub fn normalize(raw: &Value, received_at: DateTime<Utc>) -> Option<VehicleEvent> {
    let record = raw.as_object()?;
    let ident = first(record, &IDENT_KEYS).and_then(as_id_string)?;
    let vehicle_id =
        first(record, &VEHICLE_KEYS).and_then(as_id_string).unwrap_or_else(|| ident.clone());

    Some(VehicleEvent {
        tracker_ident: TrackerIdent(ident),
        vehicle_id,
        position: parse_position(record),
        timestamp_utc: first(record, &TIMESTAMP_KEYS)
            .and_then(parse_timestamp)
            .unwrap_or(received_at),
        dispatch_context: parse_dispatch(record),
    })
}
