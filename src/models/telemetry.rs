//! Domain types shared by the ingestion pipeline and the realtime broadcaster.
//!
//! Notes
//! - Device payloads are schema-less: every reading is a field name plus a typed value.
//! - The data type of a field is decided once (when its measurement row is created) and is
//!   global by name across devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepartmentId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementId(pub i64);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Numeric,
    Boolean,
    Text,
    Json,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Numeric => "numeric",
            DataType::Boolean => "boolean",
            DataType::Text => "text",
            DataType::Json => "json",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "numeric" | "number" | "float" | "integer" => Ok(DataType::Numeric),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "text" | "string" => Ok(DataType::Text),
            "json" | "object" => Ok(DataType::Json),
            other => Err(format!("unknown data type: {}", other)),
        }
    }
}

/// A single parsed reading.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Json(Value),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Number(_) => DataType::Numeric,
            FieldValue::Bool(_) => DataType::Boolean,
            FieldValue::Text(_) => DataType::Text,
            FieldValue::Json(_) => DataType::Json,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
        }
    }

    /// Value for the numeric-only latest-value table.
    ///
    /// Booleans map to 1/0. Text is never coerced, even when it looks numeric.
    pub fn as_finite_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub value: FieldValue,
    pub updated_at: DateTime<Utc>,
    pub data_type: DataType,
}

impl StateEntry {
    pub fn new(value: FieldValue, updated_at: DateTime<Utc>) -> Self {
        let data_type = value.data_type();
        StateEntry {
            value,
            updated_at,
            data_type,
        }
    }
}

/// fieldName -> entry. Used both for a delta and for a full device state.
pub type FieldMap = BTreeMap<String, StateEntry>;

/// Plain field -> JSON value view, as sent to realtime clients and collaborators.
pub fn field_values(fields: &FieldMap) -> BTreeMap<String, Value> {
    fields.iter().map(|(k, e)| (k.clone(), e.value.to_json())).collect()
}

/// Identity of a device as known to the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub id: DeviceId,
    pub serial_number: String,
    pub name: Option<String>,
}

impl DeviceRef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial_number)
    }
}

/// Placement of a device in the organization -> department -> device tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHierarchy {
    pub organization_id: Option<OrganizationId>,
    pub department_id: Option<DepartmentId>,
    pub display_name: String,
}

/// Catalog row for a named field.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementInfo {
    pub id: MeasurementId,
    pub name: String,
    pub data_type: DataType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_accepts_aliases() {
        assert_eq!("number".parse::<DataType>().unwrap(), DataType::Numeric);
        assert_eq!("bool".parse::<DataType>().unwrap(), DataType::Boolean);
        assert_eq!("json".parse::<DataType>().unwrap(), DataType::Json);
        assert!("blob".parse::<DataType>().is_err());
    }

    #[test]
    fn latest_value_coercion_never_parses_text() {
        assert_eq!(FieldValue::Number(3.5).as_finite_f64(), Some(3.5));
        assert_eq!(FieldValue::Bool(true).as_finite_f64(), Some(1.0));
        assert_eq!(FieldValue::Number(f64::NAN).as_finite_f64(), None);
        assert_eq!(FieldValue::Text("12".into()).as_finite_f64(), None);
        assert_eq!(FieldValue::Json(serde_json::json!({"a": 1})).as_finite_f64(), None);
    }
}
