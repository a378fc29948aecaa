//! Persistence of one device update: best-effort raw log, then a single transaction that ensures
//! measurements, appends history and upserts latest values.
//!
//! Notes
//! - Transient failures are retried in-process with a linearly growing delay, then handed to the
//!   retry queue. Fatal failures are surfaced and never queued.
//! - Measurement ids enter the process cache only after their transaction committed; any failed
//!   attempt evicts the names it touched. A write rejected for a cached id that no longer exists
//!   is tried once more with fresh lookups.
//! - Broadcast and warning checks run only after a commit and cannot fail the save.

use crate::db::models::{NewDeviceData, NewDeviceLatestData, NewRawLog, data_source};
use crate::db::store::{StoreError, StoreTx, TelemetryStore, WriteOutcome};
use crate::models::telemetry::{DataType, DeviceRef, FieldMap, field_values};
use crate::services::broadcast::Broadcaster;
use crate::services::measurements::{MeasurementCache, ensure_measurements};
use crate::services::retry::{RetryItem, RetryQueue};
use crate::services::warnings::WarningChecker;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct PersistSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// What a single save writes: the changed fields and the merged snapshot they produce.
#[derive(Debug, Clone)]
pub struct StateWrite {
    pub device: DeviceRef,
    pub delta: FieldMap,
    pub full_state: FieldMap,
    pub timestamp: DateTime<Utc>,
}

impl StateWrite {
    /// Every field name the transaction references, with the type it would be created as.
    fn wanted_measurements(&self) -> BTreeMap<String, DataType> {
        let mut wanted = BTreeMap::new();
        for (name, entry) in self.full_state.iter().chain(self.delta.iter()) {
            wanted.insert(name.clone(), entry.data_type);
        }
        wanted
    }
}

#[derive(Debug)]
pub enum PersistError {
    Fatal(StoreError),
    /// Attempts exhausted; the write now waits in the retry queue.
    Queued { attempts: u32, cause: StoreError },
}

impl core::fmt::Display for PersistError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PersistError::Fatal(e) => write!(f, "write rejected: {}", e),
            PersistError::Queued { attempts, cause } => {
                write!(f, "queued for retry after {} attempt(s): {}", attempts, cause)
            }
        }
    }
}

impl std::error::Error for PersistError {}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub history_rows: usize,
    pub latest_rows: usize,
    pub attempts: u32,
    pub record_id: Option<i64>,
}

/// Transaction body: measurements, then history for the delta, then latest values for the
/// numeric part of the full state.
pub fn write_state(tx: &mut dyn StoreTx, cache: &MeasurementCache, write: &StateWrite) -> Result<WriteOutcome, StoreError> {
    let measurements = ensure_measurements(tx, cache, &write.wanted_measurements())?;
    let resolve = |name: &str| {
        measurements
            .get(name)
            .map(|m| m.id.0)
            .ok_or_else(|| StoreError::Fatal(format!("measurement {:?} missing from resolved set", name)))
    };

    let history = write
        .delta
        .iter()
        .map(|(name, entry)| {
            Ok(NewDeviceData {
                device_id: write.device.id.0,
                measurement_id: resolve(name)?,
                timestamp: write.timestamp,
                value: entry.value.to_json(),
                numeric_value: entry.value.as_finite_f64(),
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    let mut latest = Vec::new();
    for (name, entry) in &write.full_state {
        let Some(value) = entry.value.as_finite_f64() else { continue };
        latest.push(NewDeviceLatestData {
            device_id: write.device.id.0,
            measurement_id: resolve(name)?,
            value,
            timestamp: entry.updated_at,
        });
    }

    let history_ids = tx.insert_history(&history)?;
    let latest_rows = tx.upsert_latest(&latest)?;
    Ok(WriteOutcome {
        measurements,
        history_ids,
        latest_rows,
    })
}

/// Linear back-off after failed attempt number `attempt`.
pub fn retry_backoff(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt)
}

pub struct PersistenceCoordinator {
    store: Arc<dyn TelemetryStore>,
    measurements: Arc<MeasurementCache>,
    retry_queue: Arc<RetryQueue>,
    broadcaster: Arc<Broadcaster>,
    warnings: Arc<dyn WarningChecker>,
    settings: PersistSettings,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        measurements: Arc<MeasurementCache>,
        retry_queue: Arc<RetryQueue>,
        broadcaster: Arc<Broadcaster>,
        warnings: Arc<dyn WarningChecker>,
        settings: PersistSettings,
    ) -> Self {
        PersistenceCoordinator {
            store,
            measurements,
            retry_queue,
            broadcaster,
            warnings,
            settings,
        }
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub async fn save(&self, write: &StateWrite, topic: &str, raw: &Value) -> Result<SaveReport, PersistError> {
        self.append_raw_log(write, topic, raw).await;

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        let cause = loop {
            attempt += 1;
            match self.transact_fresh(write).await {
                Ok(outcome) => {
                    self.measurements.remember(outcome.measurements.values());
                    self.after_commit(write, &outcome, data_source::MQTT).await;
                    return Ok(SaveReport {
                        history_rows: outcome.history_ids.len(),
                        latest_rows: outcome.latest_rows,
                        attempts: attempt,
                        record_id: outcome.history_ids.first().copied(),
                    });
                }
                Err(e) => {
                    self.invalidate_touched(write);
                    if !e.is_transient() {
                        error!("Persist: device {} write failed: {}", write.device.id, e);
                        return Err(PersistError::Fatal(e));
                    }
                    if attempt >= max_attempts {
                        break e;
                    }
                    let delay = retry_backoff(self.settings.retry_delay, attempt);
                    warn!(
                        "Persist: device {} attempt {}/{} failed, retrying in {}ms: {}",
                        write.device.id,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let item = RetryItem {
            write: write.clone(),
            topic: topic.to_string(),
            raw: raw.clone(),
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        if let Some(dropped) = self.retry_queue.push(item) {
            warn!(
                "Persist: retry queue full, dropped oldest write for device {}",
                dropped.write.device.id
            );
        }
        warn!(
            "Persist: device {} queued for retry after {} attempt(s): {}",
            write.device.id, attempt, cause
        );
        Err(PersistError::Queued {
            attempts: attempt,
            cause,
        })
    }

    /// Single attempt for a queued write.
    pub async fn replay(&self, item: &RetryItem) -> Result<SaveReport, StoreError> {
        match self.transact_fresh(&item.write).await {
            Ok(outcome) => {
                self.measurements.remember(outcome.measurements.values());
                self.after_commit(&item.write, &outcome, data_source::RETRY_QUEUE).await;
                Ok(SaveReport {
                    history_rows: outcome.history_ids.len(),
                    latest_rows: outcome.latest_rows,
                    attempts: item.retry_count + 1,
                    record_id: outcome.history_ids.first().copied(),
                })
            }
            Err(e) => {
                self.invalidate_touched(&item.write);
                Err(e)
            }
        }
    }

    async fn append_raw_log(&self, write: &StateWrite, topic: &str, raw: &Value) {
        let store = self.store.clone();
        let row = NewRawLog {
            device_id: write.device.id.0,
            timestamp: write.timestamp,
            topic: topic.to_string(),
            payload: raw.clone(),
        };
        match tokio::task::spawn_blocking(move || store.append_raw_log(&row)).await {
            Ok(Ok(id)) => debug!("Persist: raw log {} for device {}", id, write.device.id),
            Ok(Err(e)) => warn!("Persist: raw log for device {} failed: {}", write.device.id, e),
            Err(e) => warn!("Persist: raw log task for device {} failed: {}", write.device.id, e),
        }
    }

    async fn transact(&self, write: &StateWrite) -> Result<WriteOutcome, StoreError> {
        let store = self.store.clone();
        let cache = self.measurements.clone();
        let write = write.clone();
        tokio::task::spawn_blocking(move || store.run_transaction(&mut |tx| write_state(tx, &cache, &write)))
            .await
            .map_err(|e| StoreError::Fatal(format!("persistence task failed: {}", e)))?
    }

    /// `transact`, plus one retry when a cached measurement id turned out to be stale.
    async fn transact_fresh(&self, write: &StateWrite) -> Result<WriteOutcome, StoreError> {
        let used_cache = write
            .delta
            .keys()
            .chain(write.full_state.keys())
            .any(|name| self.measurements.get(name).is_some());
        match self.transact(write).await {
            Err(StoreError::StaleReference(reason)) if used_cache => {
                warn!(
                    "Persist: device {} hit a stale measurement id, retrying with fresh lookups: {}",
                    write.device.id, reason
                );
                self.invalidate_touched(write);
                self.transact(write).await
            }
            other => other,
        }
    }

    fn invalidate_touched(&self, write: &StateWrite) {
        self.measurements
            .invalidate(write.delta.keys().chain(write.full_state.keys()).map(String::as_str));
    }

    async fn after_commit(&self, write: &StateWrite, outcome: &WriteOutcome, source: &'static str) {
        self.broadcaster
            .broadcast(&write.device, &write.full_state, write.timestamp, source)
            .await;

        let warnings = self.warnings.clone();
        let device = write.device.clone();
        let values = field_values(&write.delta);
        let record_id = outcome.history_ids.first().copied();
        match tokio::task::spawn_blocking(move || warnings.check_device_warnings(&device, &values, record_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Persist: warning check for device {} failed: {}", write.device.id, e),
            Err(e) => warn!("Persist: warning check task for device {} failed: {}", write.device.id, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::telemetry::{DeviceId, FieldValue, MeasurementId, MeasurementInfo, StateEntry};
    use crate::services::hierarchy::HierarchyCache;
    use crate::services::retry::drain_once;
    use crate::services::rooms::RoomHub;
    use crate::services::warnings::WarningError;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    pub(crate) struct RecordingWarnings {
        pub calls: Mutex<Vec<(i64, BTreeMap<String, Value>, Option<i64>)>>,
        pub fail: bool,
    }

    impl WarningChecker for RecordingWarnings {
        fn check_device_warnings(
            &self,
            device: &DeviceRef,
            values: &BTreeMap<String, Value>,
            record_id: Option<i64>,
        ) -> Result<(), WarningError> {
            self.calls.lock().push((device.id.0, values.clone(), record_id));
            if self.fail {
                return Err(WarningError::Transport("unreachable".into()));
            }
            Ok(())
        }
    }

    pub(crate) fn coordinator(
        store: Arc<MemoryStore>,
        warnings: Arc<RecordingWarnings>,
    ) -> (PersistenceCoordinator, Arc<MeasurementCache>, Arc<RetryQueue>) {
        let hub = Arc::new(RoomHub::new());
        let broadcaster = Arc::new(Broadcaster::new(
            hub,
            HierarchyCache::new(store.clone(), Duration::from_secs(60)),
        ));
        let cache = Arc::new(MeasurementCache::new());
        let queue = Arc::new(RetryQueue::new(10));
        let coordinator = PersistenceCoordinator::new(
            store,
            cache.clone(),
            queue.clone(),
            broadcaster,
            warnings,
            PersistSettings {
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
            },
        );
        (coordinator, cache, queue)
    }

    fn write_at(device: i64, delta: &[(&str, FieldValue)], ts: DateTime<Utc>) -> StateWrite {
        let mut w = write(device, delta, &[]);
        for entry in w.delta.values_mut().chain(w.full_state.values_mut()) {
            entry.updated_at = ts;
        }
        w.timestamp = ts;
        w
    }

    fn write(device: i64, delta: &[(&str, FieldValue)], rest: &[(&str, FieldValue)]) -> StateWrite {
        let ts = Utc::now();
        let delta = delta
            .iter()
            .map(|(k, v)| (k.to_string(), StateEntry::new(v.clone(), ts)))
            .collect::<FieldMap>();
        let mut full_state = rest
            .iter()
            .map(|(k, v)| (k.to_string(), StateEntry::new(v.clone(), ts)))
            .collect::<FieldMap>();
        full_state.extend(delta.clone());
        StateWrite {
            device: DeviceRef {
                id: DeviceId(device),
                serial_number: format!("SN-{}", device),
                name: None,
            },
            delta,
            full_state,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn writes_history_for_delta_and_latest_for_numeric_state() {
        let store = Arc::new(MemoryStore::new());
        let warnings = Arc::new(RecordingWarnings::default());
        let (coordinator, cache, _) = coordinator(store.clone(), warnings.clone());

        let w = write(
            1,
            &[("voltage", FieldValue::Number(230.0)), ("mode", FieldValue::Text("eco".into()))],
            &[("relay", FieldValue::Bool(true))],
        );
        let report = coordinator.save(&w, "t/1", &json!({"voltage": 230})).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.history_rows, 2);
        // mode is text and stays out of latest values
        assert_eq!(report.latest_rows, 2);
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.raw_log_count(), 1);
        assert_eq!(cache.len(), 3);

        let calls = warnings.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.keys().collect::<Vec<_>>(), vec!["mode", "voltage"]);
        assert_eq!(calls[0].2, report.record_id);
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_is_not_queued() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, queue) = coordinator(store.clone(), Arc::default());
        store.fail_next_transactions(2);

        let report = coordinator
            .save(&write(1, &[("voltage", FieldValue::Number(1.0))], &[]), "t/1", &json!({}))
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert!(queue.is_empty());
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_enqueue_once() {
        let store = Arc::new(MemoryStore::new());
        let warnings = Arc::new(RecordingWarnings::default());
        let (coordinator, _, queue) = coordinator(store.clone(), warnings.clone());
        store.fail_next_transactions(4);

        let err = coordinator
            .save(&write(1, &[("voltage", FieldValue::Number(1.0))], &[]), "t/1", &json!({"voltage": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Queued { attempts: 3, .. }), "{err}");
        assert_eq!(store.transaction_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(queue.len(), 1);
        assert!(warnings.calls.lock().is_empty());

        let items = queue.take_batch(10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 0);
        assert_eq!(items[0].raw, json!({"voltage": 1}));
        // the raw log was written before any attempt
        assert_eq!(store.raw_log_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_new_field_creates_one_measurement() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, _) = coordinator(store.clone(), Arc::default());

        let a = write(1, &[("x", FieldValue::Number(1.0))], &[]);
        let b = write(2, &[("x", FieldValue::Number(2.0))], &[]);
        let raw_a = json!({"x": 1});
        let raw_b = json!({"x": 2});
        let (ra, rb) = tokio::join!(coordinator.save(&a, "t/1", &raw_a), coordinator.save(&b, "t/2", &raw_b));
        ra.unwrap();
        rb.unwrap();

        let rows = store.measurements();
        let xs = rows.iter().filter(|m| m.name == "x").collect::<Vec<_>>();
        assert_eq!(xs.len(), 1);
        let history = store.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.measurement_id == xs[0].id));
    }

    #[tokio::test]
    async fn raw_log_failure_does_not_abort() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, _) = coordinator(store.clone(), Arc::default());
        store.fail_next_raw_logs(1);

        coordinator
            .save(&write(1, &[("voltage", FieldValue::Number(1.0))], &[]), "t/1", &json!({}))
            .await
            .unwrap();
        assert_eq!(store.raw_log_count(), 0);
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn failed_history_rolls_back_new_measurements() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, cache, queue) = coordinator(store.clone(), Arc::default());
        store.fail_next_history_inserts(3);

        let err = coordinator
            .save(&write(1, &[("y", FieldValue::Number(1.0))], &[]), "t/1", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Queued { .. }));
        assert!(store.measurements().is_empty());
        assert!(cache.get("y").is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn stale_cached_id_is_refreshed_and_saved() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, cache, queue) = coordinator(store.clone(), Arc::default());
        cache.remember([&MeasurementInfo {
            id: MeasurementId(999),
            name: "voltage".into(),
            data_type: DataType::Numeric,
        }]);

        let w = write(1, &[("voltage", FieldValue::Number(1.0))], &[]);
        let report = coordinator.save(&w, "t/1", &json!({})).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.history_rows, 1);
        assert_eq!(store.transaction_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(queue.is_empty());

        let fresh = cache.get("voltage").map(|m| m.id);
        assert!(fresh.is_some());
        assert_ne!(fresh, Some(MeasurementId(999)));
        assert_eq!(store.history()[0].measurement_id, fresh.map(|id| id.0).unwrap_or_default());
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried_or_queued() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, queue) = coordinator(store.clone(), Arc::default());
        store.fail_next_transactions_fatally(1);

        let err = coordinator
            .save(&write(1, &[("voltage", FieldValue::Number(1.0))], &[]), "t/1", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Fatal(StoreError::Fatal(_))), "{err}");
        assert_eq!(store.transaction_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn replayed_older_reading_keeps_newer_latest_value() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, queue) = coordinator(store.clone(), Arc::default());
        let t1 = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t2 = t1 + chrono::Duration::seconds(10);

        store.fail_next_transactions(3);
        let older = write_at(1, &[("voltage", FieldValue::Number(1.0))], t1);
        assert!(matches!(
            coordinator.save(&older, "t/1", &json!({"voltage": 1})).await,
            Err(PersistError::Queued { .. })
        ));
        let newer = write_at(1, &[("voltage", FieldValue::Number(2.0))], t2);
        coordinator.save(&newer, "t/1", &json!({"voltage": 2})).await.unwrap();

        let report = drain_once(&coordinator, &queue, 10, 5).await;
        assert_eq!(report.replayed, 1);

        let latest = store.latest();
        assert_eq!(latest.len(), 1);
        assert_eq!((latest[0].value, latest[0].timestamp), (2.0, t2));
        // both readings are in history
        assert_eq!(store.history().len(), 2);
    }

    #[tokio::test]
    async fn final_drain_replays_every_pending_write() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, queue) = coordinator(store.clone(), Arc::default());
        store.fail_next_transactions(9);
        for device in 1..=3 {
            let w = write(device, &[("voltage", FieldValue::Number(1.0))], &[]);
            assert!(coordinator.save(&w, "t", &json!({})).await.is_err());
        }
        assert_eq!(queue.len(), 3);

        let report = crate::services::retry::drain_remaining(&coordinator, &queue, 5).await;
        assert_eq!(report.replayed, 3);
        assert!(queue.is_empty());
        assert_eq!(store.history().len(), 3);
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let step = Duration::from_millis(500);
        assert_eq!(retry_backoff(step, 1), Duration::from_millis(500));
        assert_eq!(retry_backoff(step, 3), Duration::from_millis(1500));
        assert_eq!(retry_backoff(Duration::from_millis(u64::MAX), 3), Duration::MAX);
    }

    #[tokio::test]
    async fn warning_failures_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let warnings = Arc::new(RecordingWarnings {
            fail: true,
            ..Default::default()
        });
        let (coordinator, _, _) = coordinator(store, warnings.clone());
        let report = coordinator
            .save(&write(1, &[("voltage", FieldValue::Number(1.0))], &[]), "t/1", &json!({}))
            .await;
        assert!(report.is_ok());
        assert_eq!(warnings.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn drain_replays_requeues_and_gives_up() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, _, queue) = coordinator(store.clone(), Arc::default());
        store.fail_next_transactions(3);
        let w = write(1, &[("voltage", FieldValue::Number(1.0))], &[]);
        assert!(coordinator.save(&w, "t/1", &json!({})).await.is_err());
        assert_eq!(queue.len(), 1);

        store.fail_next_transactions(1);
        let report = drain_once(&coordinator, &queue, 10, 2).await;
        assert_eq!(report, crate::services::retry::DrainReport { replayed: 0, requeued: 1, dropped: 0 });
        assert_eq!(queue.take_batch(1)[0].retry_count, 1);

        // put it back with one failed drain behind it and fail again: max reached
        let mut item = RetryItem {
            write: w.clone(),
            topic: "t/1".into(),
            raw: json!({}),
            enqueued_at: Utc::now(),
            retry_count: 1,
        };
        queue.push(item.clone());
        store.fail_next_transactions(1);
        let report = drain_once(&coordinator, &queue, 10, 2).await;
        assert_eq!(report.dropped, 1);
        assert!(queue.is_empty());

        item.retry_count = 0;
        queue.push(item);
        let report = drain_once(&coordinator, &queue, 10, 2).await;
        assert_eq!(report.replayed, 1);
        assert_eq!(store.history().len(), 1);
    }
}
