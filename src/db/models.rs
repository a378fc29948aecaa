//! Diesel model structs for the device registry, the measurement catalog and the fact tables.
//!
//! Important: migrations set up TimescaleDB hypertables for `device_data` and `device_raw_logs`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

pub mod data_source {
    pub const MQTT: &str = "mqtt";
    pub const RETRY_QUEUE: &str = "retry_queue";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct Device {
    pub id: i64,
    pub serial_number: String,
    pub name: Option<String>,
    pub organization_id: i64,
    pub department_id: Option<i64>,
    pub broker_host: String,
    pub broker_port: i32,
    pub broker_tls: bool,
    pub mqtt_topic: String,
    pub is_active: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::measurements)]
pub struct Measurement {
    pub id: i64,
    pub name: String,
    pub data_type: String,
    pub unit: Option<String>,
    pub validation: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::measurements)]
pub struct NewMeasurement {
    pub name: String,
    pub data_type: String,
    pub unit: Option<String>,
    pub validation: Option<serde_json::Value>,
}

// Hypertable: device_data
#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_data)]
pub struct NewDeviceData {
    pub device_id: i64,
    pub measurement_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
    pub numeric_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_latest_data)]
pub struct NewDeviceLatestData {
    pub device_id: i64,
    pub measurement_id: i64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Latest-value row joined with its measurement, used to hydrate the state cache.
#[derive(Debug, Clone, Queryable)]
pub struct LatestValueRow {
    pub device_id: i64,
    pub measurement_name: String,
    pub data_type: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

// Hypertable: device_raw_logs
#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_raw_logs)]
pub struct NewRawLog {
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: serde_json::Value,
}
