//! Short-window duplicate suppression for QoS 1 redeliveries and device resends.

use crate::models::telemetry::DeviceId;
use crate::services::state::TIMESTAMP_FIELDS;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct Deduplicator {
    window: Duration,
    max_entries: usize,
    /// fingerprint -> first seen
    seen: HashMap<String, Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Deduplicator {
            window,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
        }
    }

    /// Stable hash of the reading; timestamp fields are left out so a re-stamped
    /// redelivery still matches the original.
    pub fn fingerprint(device_id: DeviceId, payload: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_id.0.to_be_bytes());
        let mut keys = payload
            .keys()
            .filter(|k| !TIMESTAMP_FIELDS.contains(&k.as_str()))
            .collect::<Vec<_>>();
        keys.sort_unstable();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            feed_canonical(&mut hasher, &payload[key.as_str()]);
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Returns `true` when the message should be processed, `false` for a duplicate.
    pub fn check(&mut self, device_id: DeviceId, payload: &Map<String, Value>, now: Instant) -> bool {
        let key = Self::fingerprint(device_id, payload);
        if let Some(first_seen) = self.seen.get(&key)
            && now.saturating_duration_since(*first_seen) < self.window
        {
            return false;
        }

        self.seen.insert(key, now);
        if self.seen.len() > self.max_entries {
            self.purge(now);
        }
        true
    }

    fn purge(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);

        // everything is still fresh: drop the oldest until back under the cap
        if self.seen.len() > self.max_entries {
            let mut by_age = self.seen.iter().map(|(k, t)| (*t, k.clone())).collect::<Vec<_>>();
            by_age.sort_unstable();
            let excess = self.seen.len() - self.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Drop the entry for a message whose write was rejected, so a resend is processed again.
    pub fn forget(&mut self, device_id: DeviceId, payload: &Map<String, Value>) -> bool {
        self.seen.remove(&Self::fingerprint(device_id, payload)).is_some()
    }
}

fn feed_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort_unstable();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                feed_canonical(hasher, &map[key.as_str()]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}
