//! In-memory store used by unit tests: transactional staging, failure injection and call counters.

use crate::db::models::{
    Device, LatestValueRow, Measurement, NewDeviceData, NewDeviceLatestData, NewMeasurement, NewRawLog,
};
use crate::db::store::{HierarchySource, StoreError, StoreTx, TelemetryStore, TxBody, WriteOutcome};
use crate::models::telemetry::{DepartmentId, DeviceHierarchy, DeviceId, OrganizationId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Tables {
    devices: Vec<Device>,
    measurements: Vec<Measurement>,
    history: Vec<(i64, NewDeviceData)>,
    latest: BTreeMap<(i64, i64), NewDeviceLatestData>,
    raw_logs: Vec<NewRawLog>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_transactions: AtomicUsize,
    fatal_transactions: AtomicUsize,
    fail_device_loads: AtomicUsize,
    fail_history_inserts: AtomicUsize,
    fail_raw_logs: AtomicUsize,
    pub transaction_calls: AtomicUsize,
    pub hierarchy_fetches: AtomicUsize,
    hierarchy_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, id: i64, serial: &str, org: i64, dept: Option<i64>, host: &str, topic: &str) {
        let now = Utc::now();
        self.tables.lock().devices.push(Device {
            id,
            serial_number: serial.to_string(),
            name: Some(format!("Device {}", serial)),
            organization_id: org,
            department_id: dept,
            broker_host: host.to_string(),
            broker_port: 1883,
            broker_tls: false,
            mqtt_topic: topic.to_string(),
            is_active: true,
            last_connected: None,
            created_at: now,
            updated_at: now,
        });
    }

    pub fn add_measurement(&self, name: &str, data_type: &str) -> i64 {
        let mut t = self.tables.lock();
        let id = t.next_id();
        t.measurements.push(Measurement {
            id,
            name: name.to_string(),
            data_type: data_type.to_string(),
            unit: None,
            validation: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn put_latest(&self, device_id: i64, measurement_id: i64, value: f64) {
        self.tables.lock().latest.insert(
            (device_id, measurement_id),
            NewDeviceLatestData {
                device_id,
                measurement_id,
                value,
                timestamp: Utc::now(),
            },
        );
    }

    /// The next `n` transactions fail with a transient error before running.
    pub fn fail_next_transactions(&self, n: usize) {
        self.fail_transactions.store(n, Ordering::SeqCst);
    }

    /// The next `n` transactions are rejected with a non-retryable error.
    pub fn fail_next_transactions_fatally(&self, n: usize) {
        self.fatal_transactions.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_device_loads(&self, n: usize) {
        self.fail_device_loads.store(n, Ordering::SeqCst);
    }

    pub fn set_broker(&self, device_id: i64, host: &str, port: i32) {
        let mut t = self.tables.lock();
        if let Some(d) = t.devices.iter_mut().find(|d| d.id == device_id) {
            d.broker_host = host.to_string();
            d.broker_port = port;
        }
    }

    /// The next `n` history inserts fail transiently, after measurements were staged.
    pub fn fail_next_history_inserts(&self, n: usize) {
        self.fail_history_inserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_raw_logs(&self, n: usize) {
        self.fail_raw_logs.store(n, Ordering::SeqCst);
    }

    pub fn set_hierarchy_delay(&self, delay: Duration) {
        *self.hierarchy_delay.lock() = delay;
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.tables.lock().measurements.clone()
    }

    pub fn history(&self) -> Vec<NewDeviceData> {
        self.tables.lock().history.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn latest(&self) -> Vec<NewDeviceLatestData> {
        self.tables.lock().latest.values().cloned().collect()
    }

    pub fn raw_log_count(&self) -> usize {
        self.tables.lock().raw_logs.len()
    }

    pub fn last_connected(&self, device_id: i64) -> Option<DateTime<Utc>> {
        self.tables
            .lock()
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .and_then(|d| d.last_connected)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct MemTx<'a> {
    tables: &'a mut Tables,
    fail_history: bool,
}

impl StoreTx for MemTx<'_> {
    fn find_measurement(&mut self, name: &str) -> Result<Option<Measurement>, StoreError> {
        Ok(self.tables.measurements.iter().find(|m| m.name == name).cloned())
    }

    fn create_measurement(&mut self, new: &NewMeasurement) -> Result<Measurement, StoreError> {
        if let Some(existing) = self.find_measurement(&new.name)? {
            return Ok(existing);
        }
        let row = Measurement {
            id: self.tables.next_id(),
            name: new.name.clone(),
            data_type: new.data_type.clone(),
            unit: new.unit.clone(),
            validation: new.validation.clone(),
            created_at: Utc::now(),
        };
        self.tables.measurements.push(row.clone());
        Ok(row)
    }

    fn insert_history(&mut self, rows: &[NewDeviceData]) -> Result<Vec<i64>, StoreError> {
        if self.fail_history {
            return Err(StoreError::Transient("injected history failure".into()));
        }
        let mut ids = Vec::new();
        for row in rows {
            if !self.tables.measurements.iter().any(|m| m.id == row.measurement_id) {
                return Err(StoreError::StaleReference(format!(
                    "unknown measurement id {}",
                    row.measurement_id
                )));
            }
            let id = self.tables.next_id();
            self.tables.history.push((id, row.clone()));
            ids.push(id);
        }
        Ok(ids)
    }

    fn upsert_latest(&mut self, rows: &[NewDeviceLatestData]) -> Result<usize, StoreError> {
        let mut written = 0;
        for row in rows {
            let key = (row.device_id, row.measurement_id);
            if self.tables.latest.get(&key).is_some_and(|l| l.timestamp > row.timestamp) {
                continue;
            }
            self.tables.latest.insert(key, row.clone());
            written += 1;
        }
        Ok(written)
    }
}

impl TelemetryStore for MemoryStore {
    fn load_active_devices(&self) -> Result<Vec<Device>, StoreError> {
        if take_one(&self.fail_device_loads) {
            return Err(StoreError::Transient("injected registry failure".into()));
        }
        Ok(self.tables.lock().devices.iter().filter(|d| d.is_active).cloned().collect())
    }

    fn load_measurements(&self) -> Result<Vec<Measurement>, StoreError> {
        Ok(self.measurements())
    }

    fn load_latest_values(&self) -> Result<Vec<LatestValueRow>, StoreError> {
        let t = self.tables.lock();
        Ok(t.latest
            .values()
            .filter_map(|l| {
                let m = t.measurements.iter().find(|m| m.id == l.measurement_id)?;
                Some(LatestValueRow {
                    device_id: l.device_id,
                    measurement_name: m.name.clone(),
                    data_type: m.data_type.clone(),
                    value: l.value,
                    timestamp: l.timestamp,
                })
            })
            .collect())
    }

    fn append_raw_log(&self, row: &NewRawLog) -> Result<i64, StoreError> {
        if take_one(&self.fail_raw_logs) {
            return Err(StoreError::Transient("injected raw log failure".into()));
        }
        let mut t = self.tables.lock();
        let id = t.next_id();
        t.raw_logs.push(row.clone());
        Ok(id)
    }

    fn touch_last_connected(&self, device_id: DeviceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if let Some(d) = t.devices.iter_mut().find(|d| d.id == device_id.0) {
            d.last_connected = Some(at);
        }
        Ok(())
    }

    fn run_transaction(&self, body: TxBody<'_>) -> Result<WriteOutcome, StoreError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_transactions) {
            return Err(StoreError::Transient("injected connection reset".into()));
        }
        if take_one(&self.fatal_transactions) {
            return Err(StoreError::Fatal("injected check violation".into()));
        }
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();
        let mut tx = MemTx {
            tables: &mut staged,
            fail_history: take_one(&self.fail_history_inserts),
        };
        let outcome = body(&mut tx)?;
        *tables = staged;
        Ok(outcome)
    }
}

impl HierarchySource for MemoryStore {
    fn fetch_hierarchy(&self, device_id: DeviceId) -> Result<Option<DeviceHierarchy>, StoreError> {
        self.hierarchy_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.hierarchy_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let t = self.tables.lock();
        Ok(t.devices
            .iter()
            .find(|d| d.id == device_id.0 && d.is_active)
            .map(|d| DeviceHierarchy {
                organization_id: Some(OrganizationId(d.organization_id)),
                department_id: d.department_id.map(DepartmentId),
                display_name: d.name.clone().unwrap_or_else(|| d.serial_number.clone()),
            }))
    }
}
