//! Device -> organization/department lookups with a TTL cache.
//!
//! Concurrent misses for the same device share a single in-flight lookup; "not found" is cached
//! like any other answer, errors are not.

use crate::db::store::HierarchySource;
use crate::models::telemetry::{DeviceHierarchy, DeviceId};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyError(pub String);

impl Display for HierarchyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "hierarchy lookup failed: {}", self.0)
    }
}

impl Error for HierarchyError {}

type LookupResult = Result<Option<DeviceHierarchy>, HierarchyError>;
type Lookup = Shared<BoxFuture<'static, LookupResult>>;

struct CachedHierarchy {
    hierarchy: Option<DeviceHierarchy>,
    fetched_at: Instant,
}

struct Inner {
    source: Arc<dyn HierarchySource>,
    ttl: Duration,
    entries: Mutex<HashMap<DeviceId, CachedHierarchy>>,
    in_flight: Mutex<HashMap<DeviceId, Lookup>>,
}

#[derive(Clone)]
pub struct HierarchyCache {
    inner: Arc<Inner>,
}

impl HierarchyCache {
    pub fn new(source: Arc<dyn HierarchySource>, ttl: Duration) -> Self {
        HierarchyCache {
            inner: Arc::new(Inner {
                source,
                ttl,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn cached(&self, device_id: DeviceId) -> Option<Option<DeviceHierarchy>> {
        let entries = self.inner.entries.lock();
        entries
            .get(&device_id)
            .filter(|e| e.fetched_at.elapsed() < self.inner.ttl)
            .map(|e| e.hierarchy.clone())
    }

    /// `Ok(None)` means the device does not exist or is inactive.
    pub async fn get(&self, device_id: DeviceId) -> LookupResult {
        if let Some(hit) = self.cached(device_id) {
            return Ok(hit);
        }

        let lookup = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&device_id) {
                Some(existing) => existing.clone(),
                None => {
                    // a lookup may have completed between the cache check and this lock
                    if let Some(hit) = self.cached(device_id) {
                        return Ok(hit);
                    }
                    let lookup = fetch(self.inner.clone(), device_id).boxed().shared();
                    in_flight.insert(device_id, lookup.clone());
                    lookup
                }
            }
        };
        lookup.await
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.inner.ttl;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.fetched_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

async fn fetch(inner: Arc<Inner>, device_id: DeviceId) -> LookupResult {
    debug!("Hierarchy: fetching device {}", device_id);
    let source = inner.source.clone();
    let result = match tokio::task::spawn_blocking(move || source.fetch_hierarchy(device_id)).await {
        Ok(Ok(hierarchy)) => Ok(hierarchy),
        Ok(Err(e)) => Err(HierarchyError(e.to_string())),
        Err(e) => Err(HierarchyError(format!("lookup task failed: {}", e))),
    };

    if let Ok(hierarchy) = &result {
        inner.entries.lock().insert(
            device_id,
            CachedHierarchy {
                hierarchy: hierarchy.clone(),
                fetched_at: Instant::now(),
            },
        );
    }
    inner.in_flight.lock().remove(&device_id);
    result
}
