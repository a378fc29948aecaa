//! Measurement (dimension row) catalog: process-wide name -> id cache plus the in-transaction
//! resolver that guarantees every fact row references an existing measurement.

use crate::db::models::{Measurement, NewMeasurement};
use crate::db::store::{StoreError, StoreTx};
use crate::models::telemetry::{DataType, MeasurementId, MeasurementInfo};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Units for common field names, applied when a measurement is first created.
const KNOWN_UNITS: [(&str, &str); 12] = [
    ("voltage", "V"),
    ("current", "A"),
    ("power", "W"),
    ("active_power", "W"),
    ("reactive_power", "var"),
    ("apparent_power", "VA"),
    ("energy", "kWh"),
    ("temperature", "°C"),
    ("humidity", "%"),
    ("frequency", "Hz"),
    ("pressure", "hPa"),
    ("power_factor", ""),
];

pub fn default_unit(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    KNOWN_UNITS
        .iter()
        .find(|(n, _)| *n == lower)
        .map(|(_, unit)| *unit)
        .filter(|unit| !unit.is_empty())
}

fn to_info(row: Measurement) -> Result<MeasurementInfo, StoreError> {
    let data_type = row
        .data_type
        .parse::<DataType>()
        .map_err(|e| StoreError::Fatal(format!("measurement {:?}: {}", row.name, e)))?;
    Ok(MeasurementInfo {
        id: MeasurementId(row.id),
        name: row.name,
        data_type,
    })
}

#[derive(Default)]
pub struct MeasurementCache {
    by_name: RwLock<HashMap<String, MeasurementInfo>>,
}

impl MeasurementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with the catalog rows; rows with an unknown type are skipped.
    pub fn load(&self, rows: Vec<Measurement>) -> usize {
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            match to_info(row) {
                Ok(info) => {
                    map.insert(info.name.clone(), info);
                }
                Err(e) => info!("Measurements: skipping catalog row: {}", e),
            }
        }
        let count = map.len();
        *self.by_name.write() = map;
        count
    }

    pub fn get(&self, name: &str) -> Option<MeasurementInfo> {
        self.by_name.read().get(name).cloned()
    }

    pub fn data_type(&self, name: &str) -> Option<DataType> {
        self.by_name.read().get(name).map(|m| m.data_type)
    }

    /// Only call with rows from a committed transaction.
    pub fn remember<'a>(&self, infos: impl IntoIterator<Item = &'a MeasurementInfo>) {
        let mut map = self.by_name.write();
        for info in infos {
            map.insert(info.name.clone(), info.clone());
        }
    }

    pub fn invalidate<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut map = self.by_name.write();
        for name in names {
            map.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }
}

/// Resolve every wanted field name to a measurement inside `tx`, creating missing rows.
///
/// Cache hits are trusted; misses go to the table and then to an idempotent insert. Nothing is
/// written back to `cache` here, the caller does that once the transaction has committed.
pub fn ensure_measurements(
    tx: &mut dyn StoreTx,
    cache: &MeasurementCache,
    wanted: &BTreeMap<String, DataType>,
) -> Result<BTreeMap<String, MeasurementInfo>, StoreError> {
    let mut resolved = BTreeMap::new();
    for (name, data_type) in wanted {
        if let Some(hit) = cache.get(name) {
            resolved.insert(name.clone(), hit);
            continue;
        }

        let row = match tx.find_measurement(name)? {
            Some(row) => row,
            None => {
                debug!("Measurements: creating {:?} as {}", name, data_type.as_str());
                tx.create_measurement(&NewMeasurement {
                    name: name.clone(),
                    data_type: data_type.as_str().to_string(),
                    unit: default_unit(name).map(str::to_string),
                    validation: None,
                })?
            }
        };
        if row.name != *name {
            return Err(StoreError::Fatal(format!(
                "measurement lookup for {:?} returned {:?}",
                name, row.name
            )));
        }
        resolved.insert(name.clone(), to_info(row)?);
    }

    // fail closed: never hand back a partial map
    if let Some(missing) = wanted.keys().find(|n| !resolved.contains_key(*n)) {
        return Err(StoreError::Fatal(format!("measurement {:?} could not be resolved", missing)));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::store::{TelemetryStore, WriteOutcome};

    #[test]
    fn units_for_well_known_names() {
        assert_eq!(default_unit("Voltage"), Some("V"));
        assert_eq!(default_unit("power_factor"), None);
        assert_eq!(default_unit("mode"), None);
    }

    #[test]
    fn ensure_creates_missing_and_reuses_existing() {
        let store = MemoryStore::new();
        let existing = store.add_measurement("voltage", "numeric");
        let cache = MeasurementCache::new();
        let wanted = BTreeMap::from([
            ("voltage".to_string(), DataType::Numeric),
            ("relay".to_string(), DataType::Boolean),
        ]);

        let outcome = store
            .run_transaction(&mut |tx| {
                let measurements = ensure_measurements(tx, &cache, &wanted)?;
                Ok(WriteOutcome {
                    measurements,
                    ..Default::default()
                })
            })
            .unwrap();

        assert_eq!(outcome.measurements["voltage"].id, MeasurementId(existing));
        assert_eq!(outcome.measurements["relay"].data_type, DataType::Boolean);
        assert_eq!(store.measurements().len(), 2);
        // not committed to the cache by the resolver itself
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn load_remember_invalidate() {
        let store = MemoryStore::new();
        store.add_measurement("voltage", "numeric");
        store.add_measurement("broken", "blob");
        let cache = MeasurementCache::new();
        assert_eq!(cache.load(store.measurements()), 1);
        assert_eq!(cache.data_type("voltage"), Some(DataType::Numeric));

        cache.invalidate(["voltage"]);
        assert!(cache.get("voltage").is_none());

        let info = MeasurementInfo {
            id: MeasurementId(9),
            name: "mode".into(),
            data_type: DataType::Text,
        };
        cache.remember([&info]);
        assert_eq!(cache.get("mode"), Some(info));
    }
}
