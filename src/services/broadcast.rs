//! Fan-out of saved device state to the device, department, organization and admin rooms.

use crate::models::telemetry::{DeviceHierarchy, DeviceId, DeviceRef, FieldMap, field_values};
use crate::services::hierarchy::HierarchyCache;
use crate::services::rooms::{Room, RoomHub, frame};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEVICE_EVENT: &str = "mqtt_data";
pub const DEPARTMENT_EVENT: &str = "dept_device_data";
pub const ORGANIZATION_EVENT: &str = "org_device_data";
pub const ADMIN_EVENT: &str = "admin_device_data";

/// Rooms and event names for one update.
pub fn emission_plan(device_id: DeviceId, hierarchy: Option<&DeviceHierarchy>) -> Vec<(Room, &'static str)> {
    let mut plan = vec![(Room::Device(device_id), DEVICE_EVENT)];
    if let Some(h) = hierarchy {
        if let Some(dept) = h.department_id {
            plan.push((Room::Department(dept), DEPARTMENT_EVENT));
        }
        if let Some(org) = h.organization_id {
            plan.push((Room::Organization(org), ORGANIZATION_EVENT));
        }
    }
    plan.push((Room::Admin, ADMIN_EVENT));
    plan
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasePayload {
    pub device_id: DeviceId,
    pub device_name: String,
    pub data: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub source: &'static str,
}

#[derive(Serialize)]
struct RoomPayload<'a> {
    #[serde(flatten)]
    base: &'a BasePayload,
    room: String,
    hierarchy: Option<&'a DeviceHierarchy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Default, PartialEq)]
pub struct BroadcastReport {
    pub rooms: usize,
    pub deliveries: usize,
    pub degraded: bool,
}

pub struct Broadcaster {
    hub: Arc<RoomHub>,
    hierarchy: HierarchyCache,
}

impl Broadcaster {
    pub fn new(hub: Arc<RoomHub>, hierarchy: HierarchyCache) -> Self {
        Broadcaster { hub, hierarchy }
    }

    /// Emit `state` to every room entitled to it. A failed hierarchy lookup narrows the
    /// emission to the device room, flagged with the error.
    pub async fn broadcast(
        &self,
        device: &DeviceRef,
        state: &FieldMap,
        timestamp: DateTime<Utc>,
        source: &'static str,
    ) -> BroadcastReport {
        let (hierarchy, error) = match self.hierarchy.get(device.id).await {
            Ok(h) => (h, None),
            Err(e) => {
                warn!("Broadcast: device {} falls back to its own room: {}", device.id, e);
                (None, Some(e.to_string()))
            }
        };

        let base = BasePayload {
            device_id: device.id,
            device_name: hierarchy
                .as_ref()
                .map(|h| h.display_name.clone())
                .unwrap_or_else(|| device.display_name().to_string()),
            data: field_values(state),
            timestamp,
            source,
        };

        let plan = match error {
            Some(_) => vec![(Room::Device(device.id), DEVICE_EVENT)],
            None => emission_plan(device.id, hierarchy.as_ref()),
        };

        let mut report = BroadcastReport {
            rooms: plan.len(),
            deliveries: 0,
            degraded: error.is_some(),
        };
        for (room, event) in plan {
            let payload = RoomPayload {
                base: &base,
                room: room.to_string(),
                hierarchy: hierarchy.as_ref(),
                error: error.as_deref(),
            };
            match frame(event, &payload) {
                Ok(f) => report.deliveries += self.hub.emit(&room, &f),
                Err(e) => warn!("Broadcast: failed to encode {} for {}: {}", event, room, e),
            }
        }
        debug!(
            "Broadcast: device {} -> {} room(s), {} delivery(ies)",
            device.id, report.rooms, report.deliveries
        );
        report
    }
}
