//! Bounded in-memory queue of writes that exhausted their in-process attempts, drained by a
//! single periodic processor so an outage never turns into unbounded retry load.

use crate::services::persist::{PersistenceCoordinator, StateWrite};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub write: StateWrite,
    pub topic: String,
    pub raw: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

pub struct RetryQueue {
    capacity: usize,
    items: Mutex<VecDeque<RetryItem>>,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        RetryQueue {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append `item`; returns the oldest item if it had to be dropped to make room.
    pub fn push(&self, item: RetryItem) -> Option<RetryItem> {
        let mut items = self.items.lock();
        let dropped = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        dropped
    }

    pub fn take_batch(&self, max: usize) -> Vec<RetryItem> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// One drain pass: a single transaction attempt per item.
pub async fn drain_once(
    coordinator: &PersistenceCoordinator,
    queue: &RetryQueue,
    batch: usize,
    max_retries: u32,
) -> DrainReport {
    let mut report = DrainReport::default();
    for mut item in queue.take_batch(batch) {
        let device = item.write.device.id;
        match coordinator.replay(&item).await {
            Ok(_) => report.replayed += 1,
            Err(e) if !e.is_transient() => {
                error!("Retry queue: dropping write for device {}: {}", device, e);
                report.dropped += 1;
            }
            Err(e) => {
                item.retry_count += 1;
                if item.retry_count >= max_retries {
                    error!(
                        "Retry queue: giving up on device {} after {} replay(s), enqueued at {}: {}",
                        device, item.retry_count, item.enqueued_at, e
                    );
                    report.dropped += 1;
                } else {
                    if let Some(old) = queue.push(item) {
                        warn!("Retry queue: full, dropped oldest write for device {}", old.write.device.id);
                    }
                    report.requeued += 1;
                }
            }
        }
    }
    report
}

pub async fn run_processor(
    coordinator: Arc<PersistenceCoordinator>,
    queue: Arc<RetryQueue>,
    interval: Duration,
    batch: usize,
    max_retries: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if queue.is_empty() {
            continue;
        }
        let report = drain_once(&coordinator, &queue, batch, max_retries).await;
        info!(
            "Retry queue: replayed {}, requeued {}, dropped {}, {} pending",
            report.replayed,
            report.requeued,
            report.dropped,
            queue.len()
        );
    }
    if !queue.is_empty() {
        debug!("Retry queue: processor stopping with {} pending write(s)", queue.len());
    }
}

/// Last pass before exit, after ingestion has stopped: every pending write gets one more attempt.
pub async fn drain_remaining(coordinator: &PersistenceCoordinator, queue: &RetryQueue, max_retries: u32) -> DrainReport {
    let pending = queue.len();
    if pending == 0 {
        return DrainReport::default();
    }
    let report = drain_once(coordinator, queue, pending, max_retries).await;
    info!(
        "Retry queue: final drain replayed {} of {} pending write(s)",
        report.replayed, pending
    );
    if !queue.is_empty() {
        error!(
            "Retry queue: {} write(s) still failing at shutdown, payloads remain only in the raw log",
            queue.len()
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::{DeviceId, DeviceRef, FieldMap};
    use serde_json::json;

    fn item(device: i64) -> RetryItem {
        RetryItem {
            write: StateWrite {
                device: DeviceRef {
                    id: DeviceId(device),
                    serial_number: format!("SN-{}", device),
                    name: None,
                },
                delta: FieldMap::new(),
                full_state: FieldMap::new(),
                timestamp: Utc::now(),
            },
            topic: "t".into(),
            raw: json!({}),
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    #[test]
    fn oldest_is_dropped_on_overflow() {
        let queue = RetryQueue::new(2);
        assert!(queue.push(item(1)).is_none());
        assert!(queue.push(item(2)).is_none());
        let dropped = queue.push(item(3)).unwrap();
        assert_eq!(dropped.write.device.id, DeviceId(1));
        assert_eq!(queue.len(), 2);

        let batch = queue.take_batch(10);
        assert_eq!(
            batch.iter().map(|i| i.write.device.id.0).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(queue.is_empty());
    }
}
