//! Per-device state cache and the delta engine.
//!
//! Every field present in an inbound message counts as changed, so the delta is the parsed
//! incoming field set. The full state is that delta merged over the cached state; fields the
//! message did not carry are kept as they were.

use crate::db::models::LatestValueRow;
use crate::models::telemetry::{DataType, DeviceId, FieldMap, FieldValue, StateEntry};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const TIMESTAMP_FIELDS: [&str; 3] = ["timestamp", "ts", "time"];

/// Identifiers and reading time; never stored as measurements.
pub const METADATA_FIELDS: [&str; 11] = [
    "timestamp",
    "ts",
    "time",
    "deviceId",
    "device_id",
    "serial",
    "serialNumber",
    "serial_number",
    "assetTag",
    "asset_tag",
    "assetId",
];

pub fn is_metadata_field(name: &str) -> bool {
    METADATA_FIELDS.contains(&name)
}

/// Reading time carried by the payload: RFC 3339, epoch seconds or epoch milliseconds.
pub fn reading_timestamp(payload: &Map<String, Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(parse_timestamp)
        .unwrap_or(fallback)
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    // anything past ~2286 in seconds is treated as milliseconds
    if n.abs() >= 10_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

/// Parse `raw` against an already-recorded type. `None` when the value does not fit it.
pub fn parse_as(raw: &Value, data_type: DataType) -> Option<FieldValue> {
    match (data_type, raw) {
        (_, Value::Null) => None,
        (DataType::Numeric, Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).map(FieldValue::Number),
        (DataType::Numeric, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Number),
        (DataType::Numeric, _) => None,
        (DataType::Boolean, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
        (DataType::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(f) if f == 0.0 => Some(FieldValue::Bool(false)),
            Some(f) if f == 1.0 => Some(FieldValue::Bool(true)),
            _ => None,
        },
        (DataType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Some(FieldValue::Bool(true)),
            "false" | "off" | "no" | "0" => Some(FieldValue::Bool(false)),
            _ => None,
        },
        (DataType::Boolean, _) => None,
        (DataType::Text, Value::String(s)) => Some(FieldValue::Text(s.clone())),
        (DataType::Text, Value::Number(_) | Value::Bool(_)) => Some(FieldValue::Text(raw.to_string())),
        (DataType::Text, _) => None,
        (DataType::Json, other) => Some(FieldValue::Json(other.clone())),
    }
}

/// Type inference for fields with no recorded type. Strings stay text, even "12.5".
pub fn infer_value(raw: &Value) -> Option<FieldValue> {
    match raw {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(FieldValue::Number),
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Some(FieldValue::Json(raw.clone())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub fields: FieldMap,
    pub timestamp: DateTime<Utc>,
    /// Fields whose value did not fit their recorded type and were inferred instead.
    pub type_conflicts: Vec<String>,
}

/// Turn a raw payload into a typed delta. `known_type` reports the recorded type of a field.
pub fn build_delta<F>(payload: &Map<String, Value>, known_type: F, received_at: DateTime<Utc>) -> Delta
where
    F: Fn(&str) -> Option<DataType>,
{
    let timestamp = reading_timestamp(payload, received_at);
    let mut fields = FieldMap::new();
    let mut type_conflicts = Vec::new();

    for (name, raw) in payload {
        if is_metadata_field(name) || name.trim().is_empty() {
            continue;
        }
        let parsed = match known_type(name) {
            Some(data_type) => match parse_as(raw, data_type) {
                Some(v) => Some(v),
                None if raw.is_null() => None,
                None => {
                    type_conflicts.push(name.clone());
                    infer_value(raw)
                }
            },
            None => infer_value(raw),
        };
        match parsed {
            Some(value) => {
                fields.insert(name.clone(), StateEntry::new(value, timestamp));
            }
            None => debug!("Skipping field {:?}: no storable value", name),
        }
    }

    Delta {
        fields,
        timestamp,
        type_conflicts,
    }
}

/// Delta over previous: incoming fields replace, untouched fields survive.
pub fn merge(previous: Option<&FieldMap>, delta: &FieldMap) -> FieldMap {
    let mut full = previous.cloned().unwrap_or_default();
    for (name, entry) in delta {
        full.insert(name.clone(), entry.clone());
    }
    full
}

struct CachedState {
    fields: FieldMap,
    last_seen: Instant,
}

/// Authoritative last-known full state per device.
pub struct StateCache {
    idle: Duration,
    devices: HashMap<DeviceId, CachedState>,
}

impl StateCache {
    pub fn new(idle: Duration) -> Self {
        StateCache {
            idle,
            devices: HashMap::new(),
        }
    }

    /// Seed from the latest-value table. Returns the number of devices loaded.
    pub fn hydrate(&mut self, rows: Vec<LatestValueRow>, now: Instant) -> usize {
        for row in rows {
            let data_type = row.data_type.parse::<DataType>().unwrap_or(DataType::Numeric);
            let value = match data_type {
                DataType::Boolean => FieldValue::Bool(row.value != 0.0),
                _ => FieldValue::Number(row.value),
            };
            let cached = self
                .devices
                .entry(DeviceId(row.device_id))
                .or_insert_with(|| CachedState {
                    fields: FieldMap::new(),
                    last_seen: now,
                });
            cached
                .fields
                .insert(row.measurement_name, StateEntry::new(value, row.timestamp));
        }
        self.devices.len()
    }

    pub fn get(&self, device_id: DeviceId) -> Option<&FieldMap> {
        self.devices.get(&device_id).map(|c| &c.fields)
    }

    pub fn data_type(&self, device_id: DeviceId, field: &str) -> Option<DataType> {
        self.get(device_id)
            .and_then(|fields| fields.get(field))
            .map(|e| e.data_type)
    }

    /// Full state that would result from applying `delta`; the cache is not touched.
    pub fn merged(&self, device_id: DeviceId, delta: &FieldMap) -> FieldMap {
        merge(self.get(device_id), delta)
    }

    /// Record `delta` merged over the cached state and return the new full state.
    pub fn apply(&mut self, device_id: DeviceId, delta: &FieldMap, now: Instant) -> FieldMap {
        let full = self.merged(device_id, delta);
        self.devices.insert(
            device_id,
            CachedState {
                fields: full.clone(),
                last_seen: now,
            },
        );
        full
    }

    /// Drop devices not updated within the idle window.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.devices.len();
        let idle = self.idle;
        self.devices
            .retain(|_, c| now.saturating_duration_since(c.last_seen) < idle);
        before - self.devices.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object literal")
    }

    fn values(fields: &FieldMap) -> Vec<(String, Value)> {
        fields.iter().map(|(k, e)| (k.clone(), e.value.to_json())).collect()
    }

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut cache = StateCache::new(Duration::from_secs(3600));
        let now = Instant::now();
        let dev = DeviceId(7);
        let ts = Utc::now();

        let d1 = build_delta(&obj(json!({"a": 1})), |_| None, ts);
        cache.apply(dev, &d1.fields, now);
        let d2 = build_delta(&obj(json!({"b": 2})), |_| None, ts);
        let full = cache.apply(dev, &d2.fields, now);
        assert_eq!(values(&full), vec![("a".into(), json!(1.0)), ("b".into(), json!(2.0))]);

        let d3 = build_delta(&obj(json!({"a": 3})), |_| None, ts);
        let full = cache.apply(dev, &d3.fields, now);
        assert_eq!(values(&full), vec![("a".into(), json!(3.0)), ("b".into(), json!(2.0))]);
    }

    #[test]
    fn merged_view_does_not_mutate() {
        let mut cache = StateCache::new(Duration::from_secs(3600));
        let dev = DeviceId(1);
        let d = build_delta(&obj(json!({"a": 1})), |_| None, Utc::now());
        cache.apply(dev, &d.fields, Instant::now());

        let d2 = build_delta(&obj(json!({"b": true})), |_| None, Utc::now());
        let preview = cache.merged(dev, &d2.fields);
        assert_eq!(preview.len(), 2);
        assert_eq!(cache.get(dev).map(|f| f.len()), Some(1));
    }

    #[test]
    fn metadata_fields_are_excluded_and_timestamp_used() {
        let payload = obj(json!({
            "timestamp": "2024-05-01T10:00:00Z",
            "deviceId": "abc",
            "serial_number": "SN-1",
            "voltage": 229.8
        }));
        let delta = build_delta(&payload, |_| None, Utc::now());
        assert_eq!(delta.fields.keys().collect::<Vec<_>>(), vec!["voltage"]);
        assert_eq!(delta.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn epoch_timestamps_in_seconds_and_millis() {
        let secs = reading_timestamp(&obj(json!({"ts": 1_700_000_000})), Utc::now());
        let millis = reading_timestamp(&obj(json!({"ts": 1_700_000_000_000i64})), Utc::now());
        assert_eq!(secs, millis);
        let fallback = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(reading_timestamp(&obj(json!({"ts": "yesterday"})), fallback), fallback);
    }

    #[test]
    fn unknown_strings_are_never_numbers() {
        let delta = build_delta(
            &obj(json!({"firmware": "1.20", "reading_at": "2024-01-01 10:00", "temp": 21.5})),
            |_| None,
            Utc::now(),
        );
        assert_eq!(delta.fields["firmware"].value, FieldValue::Text("1.20".into()));
        assert_eq!(delta.fields["reading_at"].data_type, DataType::Text);
        assert_eq!(delta.fields["temp"].value, FieldValue::Number(21.5));
    }

    #[test]
    fn known_types_drive_parsing() {
        let known = |name: &str| match name {
            "voltage" => Some(DataType::Numeric),
            "relay" => Some(DataType::Boolean),
            "mode" => Some(DataType::Boolean),
            _ => None,
        };
        let delta = build_delta(
            &obj(json!({"voltage": "230.5", "relay": "on", "mode": "auto", "empty": null})),
            known,
            Utc::now(),
        );
        assert_eq!(delta.fields["voltage"].value, FieldValue::Number(230.5));
        assert_eq!(delta.fields["relay"].value, FieldValue::Bool(true));
        // does not fit the recorded type: kept as inferred text and reported
        assert_eq!(delta.fields["mode"].value, FieldValue::Text("auto".into()));
        assert_eq!(delta.type_conflicts, vec!["mode".to_string()]);
        assert!(!delta.fields.contains_key("empty"));
    }

    #[test]
    fn hydrate_and_evict() {
        let mut cache = StateCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let rows = vec![
            LatestValueRow {
                device_id: 1,
                measurement_name: "voltage".into(),
                data_type: "numeric".into(),
                value: 230.0,
                timestamp: Utc::now(),
            },
            LatestValueRow {
                device_id: 1,
                measurement_name: "relay".into(),
                data_type: "boolean".into(),
                value: 1.0,
                timestamp: Utc::now(),
            },
        ];
        assert_eq!(cache.hydrate(rows, t0), 1);
        assert_eq!(cache.data_type(DeviceId(1), "relay"), Some(DataType::Boolean));

        let d = build_delta(&obj(json!({"x": 1})), |_| None, Utc::now());
        cache.apply(DeviceId(2), &d.fields, t0 + Duration::from_secs(50));

        assert_eq!(cache.evict_idle(t0 + Duration::from_secs(70)), 1);
        assert!(cache.get(DeviceId(1)).is_none());
        assert!(cache.get(DeviceId(2)).is_some());
    }
}
