//! Inbound message pipeline: parse, dedup, delta against cached state, persist, then commit the
//! new state. Messages for one device run strictly in arrival order on a per-device worker.

use crate::db::store::{StoreError, TelemetryStore};
use crate::models::telemetry::{DeviceId, DeviceRef, FieldMap};
use crate::services::dedup::Deduplicator;
use crate::services::hierarchy::HierarchyCache;
use crate::services::measurements::MeasurementCache;
use crate::services::persist::{PersistError, PersistenceCoordinator, SaveReport, StateWrite};
use crate::services::rooms::{Room, RoomHub, frame};
use crate::services::state::{StateCache, build_delta};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const STATS_EVENT: &str = "ingest_stats";

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub device: DeviceRef,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum IngestError {
    Parse(serde_json::Error),
    NotAnObject,
    UnknownTopic(String),
    Persist(PersistError),
}

impl core::fmt::Display for IngestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IngestError::Parse(e) => write!(f, "malformed payload: {}", e),
            IngestError::NotAnObject => write!(f, "payload is not a JSON object"),
            IngestError::UnknownTopic(t) => write!(f, "no active device for topic {:?}", t),
            IngestError::Persist(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    Saved(SaveReport),
    Duplicate,
    /// Nothing storable left after dropping metadata and nulls.
    Empty,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    parse_errors: AtomicU64,
    duplicates: AtomicU64,
    unknown_topics: AtomicU64,
    saved: AtomicU64,
    queued: AtomicU64,
    failed: AtomicU64,
    type_conflicts: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub received: u64,
    pub parse_errors: u64,
    pub duplicates: u64,
    pub unknown_topics: u64,
    pub saved: u64,
    pub queued: u64,
    pub failed: u64,
    pub type_conflicts: u64,
    pub pending_retries: usize,
    pub cached_devices: usize,
    pub dedup_entries: usize,
    pub active_workers: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
    pub state_idle: Duration,
}

impl From<&crate::config::IngestSettings> for PipelineSettings {
    fn from(value: &crate::config::IngestSettings) -> Self {
        PipelineSettings {
            dedup_window: value.dedup_window,
            dedup_max_entries: value.dedup_max_entries,
            state_idle: value.state_idle,
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn TelemetryStore>,
    measurements: Arc<MeasurementCache>,
    coordinator: Arc<PersistenceCoordinator>,
    dedup: Mutex<Deduplicator>,
    state: Mutex<StateCache>,
    counters: Counters,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        measurements: Arc<MeasurementCache>,
        coordinator: Arc<PersistenceCoordinator>,
        settings: PipelineSettings,
    ) -> Self {
        Ingestor {
            store,
            measurements,
            coordinator,
            dedup: Mutex::new(Deduplicator::new(settings.dedup_window, settings.dedup_max_entries)),
            state: Mutex::new(StateCache::new(settings.state_idle)),
            counters: Counters::default(),
        }
    }

    /// Seed device state from the latest-value table.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let store = self.store.clone();
        let rows = tokio::task::spawn_blocking(move || store.load_latest_values())
            .await
            .map_err(|e| StoreError::Fatal(format!("hydrate task failed: {}", e)))??;
        let rows_len = rows.len();
        let devices = self.state.lock().hydrate(rows, Instant::now());
        info!("Ingest: hydrated {} latest value(s) for {} device(s)", rows_len, devices);
        Ok(devices)
    }

    pub async fn process(&self, msg: InboundMessage) -> Result<IngestOutcome, IngestError> {
        bump(&self.counters.received, 1);
        let device_id = msg.device.id;

        let parsed = serde_json::from_slice::<Value>(&msg.payload).map_err(|e| {
            bump(&self.counters.parse_errors, 1);
            IngestError::Parse(e)
        })?;
        let Value::Object(payload) = parsed else {
            bump(&self.counters.parse_errors, 1);
            return Err(IngestError::NotAnObject);
        };

        if !self.dedup.lock().check(device_id, &payload, Instant::now()) {
            bump(&self.counters.duplicates, 1);
            debug!("Ingest: duplicate from device {} on {}", device_id, msg.topic);
            return Ok(IngestOutcome::Duplicate);
        }

        let (delta, full_state) = {
            let state = self.state.lock();
            let delta = build_delta(
                &payload,
                |name| {
                    self.measurements
                        .data_type(name)
                        .or_else(|| state.data_type(device_id, name))
                },
                msg.received_at,
            );
            let full_state = state.merged(device_id, &delta.fields);
            (delta, full_state)
        };

        if !delta.type_conflicts.is_empty() {
            bump(&self.counters.type_conflicts, delta.type_conflicts.len() as u64);
            warn!(
                "Ingest: device {} sent values not matching their recorded type: {}",
                device_id,
                delta.type_conflicts.join(", ")
            );
        }
        if delta.fields.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let write = StateWrite {
            device: msg.device.clone(),
            delta: delta.fields,
            full_state,
            timestamp: delta.timestamp,
        };
        let raw = Value::Object(payload);
        match self.coordinator.save(&write, &msg.topic, &raw).await {
            Ok(report) => {
                self.state.lock().apply(device_id, &write.delta, Instant::now());
                bump(&self.counters.saved, 1);
                self.touch_last_connected(device_id).await;
                Ok(IngestOutcome::Saved(report))
            }
            Err(e @ PersistError::Queued { .. }) => {
                // the queued write will land eventually; keep state in step with it
                self.state.lock().apply(device_id, &write.delta, Instant::now());
                bump(&self.counters.queued, 1);
                Err(IngestError::Persist(e))
            }
            Err(e) => {
                // rejected writes leave no trace in dedup, so a resend gets a fresh attempt
                if let Value::Object(payload) = &raw {
                    self.dedup.lock().forget(device_id, payload);
                }
                bump(&self.counters.failed, 1);
                Err(IngestError::Persist(e))
            }
        }
    }

    async fn touch_last_connected(&self, device_id: DeviceId) {
        let store = self.store.clone();
        let now = Utc::now();
        match tokio::task::spawn_blocking(move || store.touch_last_connected(device_id, now)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Ingest: last_connected update for device {} failed: {}", device_id, e),
            Err(e) => warn!("Ingest: last_connected task for device {} failed: {}", device_id, e),
        }
    }

    pub fn note_unknown_topic(&self, topic: &str) {
        bump(&self.counters.unknown_topics, 1);
        debug!("Ingest: {}", IngestError::UnknownTopic(topic.to_string()));
    }

    pub fn state_of(&self, device_id: DeviceId) -> Option<FieldMap> {
        self.state.lock().get(device_id).cloned()
    }

    /// Evict idle device state; returns the number of devices dropped.
    pub fn housekeeping(&self) -> usize {
        self.state.lock().evict_idle(Instant::now())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            received: c.received.load(Ordering::Relaxed),
            parse_errors: c.parse_errors.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            unknown_topics: c.unknown_topics.load(Ordering::Relaxed),
            saved: c.saved.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            type_conflicts: c.type_conflicts.load(Ordering::Relaxed),
            pending_retries: self.coordinator.retry_queue().len(),
            cached_devices: self.state.lock().len(),
            dedup_entries: self.dedup.lock().len(),
            active_workers: 0,
        }
    }
}

async fn handle(ingestor: &Ingestor, msg: InboundMessage) {
    let device_id = msg.device.id;
    match ingestor.process(msg).await {
        Ok(IngestOutcome::Saved(report)) => debug!(
            "Ingest: device {} saved {} history row(s), {} latest row(s) in {} attempt(s)",
            device_id, report.history_rows, report.latest_rows, report.attempts
        ),
        Ok(IngestOutcome::Duplicate) => {}
        Ok(IngestOutcome::Empty) => debug!("Ingest: device {} sent nothing storable", device_id),
        // already reported by the coordinator
        Err(IngestError::Persist(_)) => {}
        Err(e) => warn!("Ingest: dropping message from device {}: {}", device_id, e),
    }
}

/// One sequential worker per device, created on demand and retired after idling.
///
/// A retiring worker closes its channel and drains what was already queued while holding the
/// device's lock; a replacement waits on that lock, so arrival order survives the hand-over.
pub struct DeviceWorkers {
    ingestor: Arc<Ingestor>,
    queue_depth: usize,
    idle: Duration,
    senders: Mutex<HashMap<DeviceId, mpsc::Sender<InboundMessage>>>,
    locks: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceWorkers {
    pub fn new(ingestor: Arc<Ingestor>, queue_depth: usize, idle: Duration) -> Self {
        DeviceWorkers {
            ingestor,
            queue_depth: queue_depth.max(1),
            idle,
            senders: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Queue `msg` on its device's worker; waits when that worker is backed up.
    pub async fn dispatch(&self, mut msg: InboundMessage) {
        let device_id = msg.device.id;
        loop {
            let sender = {
                let mut senders = self.senders.lock();
                match senders.get(&device_id) {
                    Some(s) if !s.is_closed() => s.clone(),
                    _ => {
                        let s = self.spawn_worker(device_id);
                        senders.insert(device_id, s.clone());
                        s
                    }
                }
            };
            match sender.send(msg).await {
                Ok(()) => return,
                // worker retired between lookup and send
                Err(mpsc::error::SendError(back)) => msg = back,
            }
        }
    }

    fn spawn_worker(&self, device_id: DeviceId) -> mpsc::Sender<InboundMessage> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(self.queue_depth);
        let lock = self.locks.lock().entry(device_id).or_default().clone();
        let ingestor = self.ingestor.clone();
        let idle = self.idle;

        let task = tokio::spawn(async move {
            let _turn = lock.lock_owned().await;
            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(msg)) => handle(&ingestor, msg).await,
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        while let Ok(msg) = rx.try_recv() {
                            handle(&ingestor, msg).await;
                        }
                        debug!("Ingest: worker for device {} retired", device_id);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        tx
    }

    /// Forget retired workers and their unused locks.
    pub fn reap(&self) -> usize {
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|_, s| !s.is_closed());
        let mut locks = self.locks.lock();
        locks.retain(|id, lock| senders.contains_key(id) || Arc::strong_count(lock) > 1);
        self.tasks.lock().retain(|t| !t.is_finished());
        before - senders.len()
    }

    pub fn active(&self) -> usize {
        self.senders.lock().values().filter(|s| !s.is_closed()).count()
    }

    /// Drop every sender; workers finish their queues and exit.
    pub fn close_all(&self) {
        self.senders.lock().clear();
    }

    /// Close every worker and wait up to `grace` for queued messages to be written. Workers still
    /// running at the deadline are aborted. Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.close_all();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!("Ingest: {} worker(s) still busy after {}s, aborted", aborted, grace.as_secs());
        } else {
            info!("Ingest: all device workers drained");
        }
        aborted
    }
}

/// Periodic stats log and `monitoring` room update, plus cache housekeeping.
pub async fn run_stats_loop(
    workers: Arc<DeviceWorkers>,
    hub: Arc<RoomHub>,
    hierarchy: HierarchyCache,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let evicted = workers.ingestor().housekeeping();
        let retired = workers.reap();
        let expired = hierarchy.purge_expired();
        if evicted + retired + expired > 0 {
            debug!(
                "Ingest: housekeeping evicted {} device state(s), {} worker(s), {} hierarchy entry(ies)",
                evicted, retired, expired
            );
        }

        let mut stats = workers.ingestor().snapshot();
        stats.active_workers = workers.active();
        info!(
            "Ingest stats: received={} saved={} duplicates={} queued={} failed={} parse_errors={} unknown_topics={} pending_retries={} workers={}",
            stats.received,
            stats.saved,
            stats.duplicates,
            stats.queued,
            stats.failed,
            stats.parse_errors,
            stats.unknown_topics,
            stats.pending_retries,
            stats.active_workers
        );
        match frame(STATS_EVENT, &stats) {
            Ok(f) => {
                hub.emit(&Room::Monitoring, &f);
            }
            Err(e) => warn!("Ingest: failed to encode stats: {}", e),
        }
    }
}
