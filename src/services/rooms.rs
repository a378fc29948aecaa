//! Realtime rooms: naming, membership and join authorization.
//!
//! Room names
//! - `device:<id>`, `dept:<id>`, `org:<id>`: hierarchy scopes
//! - `admin`: every device update, admins only
//! - `monitoring`: public, carries ingestion statistics and nothing device-specific

use crate::auth::Principal;
use crate::models::telemetry::{DepartmentId, DeviceHierarchy, DeviceId, OrganizationId};
use crate::services::hierarchy::HierarchyCache;
use futures::future::join_all;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ADMIN_ROOM: &str = "admin";
pub const MONITORING_ROOM: &str = "monitoring";

pub type ConnectionId = u64;

/// Frames are serialized once and shared by every recipient.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Device(DeviceId),
    Department(DepartmentId),
    Organization(OrganizationId),
    Admin,
    Monitoring,
}

impl Room {
    pub fn parse(name: &str) -> Option<Room> {
        let name = name.trim();
        match name {
            ADMIN_ROOM => return Some(Room::Admin),
            MONITORING_ROOM => return Some(Room::Monitoring),
            _ => {}
        }
        let (scope, id) = name.split_once(':')?;
        let id = id.trim().parse::<i64>().ok()?;
        match scope {
            "device" => Some(Room::Device(DeviceId(id))),
            "dept" | "department" => Some(Room::Department(DepartmentId(id))),
            "org" | "organization" => Some(Room::Organization(OrganizationId(id))),
            _ => None,
        }
    }
}

impl Display for Room {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Room::Device(id) => write!(f, "device:{}", id.0),
            Room::Department(id) => write!(f, "dept:{}", id.0),
            Room::Organization(id) => write!(f, "org:{}", id.0),
            Room::Admin => f.write_str(ADMIN_ROOM),
            Room::Monitoring => f.write_str(MONITORING_ROOM),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

/// `{"event": ..., "data": ...}` as sent on the wire.
pub fn frame<T: Serialize>(event: &str, data: T) -> Result<Frame, serde_json::Error> {
    serde_json::to_string(&Envelope { event, data }).map(Frame::from)
}

struct Member {
    outbox: mpsc::Sender<Frame>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<ConnectionId, Member>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

/// Connected clients and the rooms they are in.
#[derive(Default)]
pub struct RoomHub {
    state: Mutex<HubState>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, outbox: mpsc::Sender<Frame>) {
        self.state.lock().members.insert(
            id,
            Member {
                outbox,
                rooms: HashSet::new(),
            },
        );
    }

    pub fn unregister(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let Some(member) = state.members.remove(&id) else {
            return;
        };
        for room in member.rooms {
            if let Some(set) = state.rooms.get_mut(&room) {
                set.remove(&id);
                if set.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
    }

    /// `false` if the connection is unknown.
    pub fn join(&self, id: ConnectionId, room: &Room) -> bool {
        let mut state = self.state.lock();
        let Some(member) = state.members.get_mut(&id) else {
            return false;
        };
        member.rooms.insert(room.clone());
        state.rooms.entry(room.clone()).or_default().insert(id);
        true
    }

    /// `false` if the connection was not in the room.
    pub fn leave(&self, id: ConnectionId, room: &Room) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .members
            .get_mut(&id)
            .map(|m| m.rooms.remove(room))
            .unwrap_or(false);
        if removed && let Some(set) = state.rooms.get_mut(room) {
            set.remove(&id);
            if set.is_empty() {
                state.rooms.remove(room);
            }
        }
        removed
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<Room> {
        let state = self.state.lock();
        let mut rooms = state
            .members
            .get(&id)
            .map(|m| m.rooms.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        rooms.sort_by_key(|r| r.to_string());
        rooms
    }

    pub fn member_count(&self, room: &Room) -> usize {
        self.state.lock().rooms.get(room).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Queue `frame` for every member of `room`; slow clients with a full outbox miss it.
    pub fn emit(&self, room: &Room, frame: &Frame) -> usize {
        let state = self.state.lock();
        let Some(ids) = state.rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            let Some(member) = state.members.get(id) else { continue };
            match member.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Rooms: dropping frame for connection {} in {}: {}", id, room, e),
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Granted,
    Denied(&'static str, String),
    /// Needs the device's hierarchy before deciding.
    CheckDevice(DeviceId),
}

/// Synchronous part of the join check; only device rooms need a lookup.
pub fn authorize(principal: &Principal, room: &Room) -> Access {
    if let Room::Monitoring = room {
        return Access::Granted;
    }
    if principal.is_anonymous() {
        return Access::Denied("unauthorized", "authentication required for this room".to_string());
    }
    if principal.is_admin {
        return Access::Granted;
    }
    match room {
        Room::Monitoring => Access::Granted,
        Room::Admin => Access::Denied("forbidden", "admin room requires admin privileges".to_string()),
        Room::Organization(org) => {
            if principal.organization_id == Some(*org) {
                Access::Granted
            } else {
                Access::Denied("forbidden", format!("not a member of organization {}", org.0))
            }
        }
        Room::Department(dept) => {
            if principal.department_ids.contains(dept) {
                Access::Granted
            } else {
                Access::Denied("forbidden", format!("not a member of department {}", dept.0))
            }
        }
        Room::Device(id) => Access::CheckDevice(*id),
    }
}

/// Device-room decision once the hierarchy is known.
pub fn authorize_device(principal: &Principal, device_id: DeviceId, hierarchy: Option<&DeviceHierarchy>) -> Access {
    let Some(hierarchy) = hierarchy else {
        return Access::Denied("not_found", format!("device {} not found or inactive", device_id.0));
    };
    match (principal.organization_id, hierarchy.organization_id) {
        (Some(mine), Some(theirs)) if mine == theirs => Access::Granted,
        _ => Access::Denied(
            "forbidden",
            format!("device {} belongs to another organization", device_id.0),
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomError {
    pub room: String,
    pub error: &'static str,
    pub reason: String,
}

impl RoomError {
    fn new(room: &str, error: &'static str, reason: impl Into<String>) -> Self {
        RoomError {
            room: room.to_string(),
            error,
            reason: reason.into(),
        }
    }
}

/// Join/leave requests coming from a connection, checked against its principal.
pub struct RoomService {
    hub: Arc<RoomHub>,
    hierarchy: HierarchyCache,
}

impl RoomService {
    pub fn new(hub: Arc<RoomHub>, hierarchy: HierarchyCache) -> Self {
        RoomService { hub, hierarchy }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub async fn join(&self, conn: ConnectionId, principal: &Principal, name: &str) -> Result<Room, RoomError> {
        let room = Room::parse(name).ok_or_else(|| RoomError::new(name, "invalid_room", "unknown room name"))?;

        let mut access = authorize(principal, &room);
        if let Access::CheckDevice(device_id) = access {
            access = match self.hierarchy.get(device_id).await {
                Ok(h) => authorize_device(principal, device_id, h.as_ref()),
                Err(e) => Access::Denied("unavailable", format!("device lookup failed: {}", e)),
            };
        }

        match access {
            Access::Granted => {
                if self.hub.join(conn, &room) {
                    Ok(room)
                } else {
                    Err(RoomError::new(name, "not_connected", "connection is closed"))
                }
            }
            Access::Denied(error, reason) => Err(RoomError::new(name, error, reason)),
            Access::CheckDevice(_) => Err(RoomError::new(name, "forbidden", "device check incomplete")),
        }
    }

    pub fn leave(&self, conn: ConnectionId, name: &str) -> Result<Room, RoomError> {
        let room = Room::parse(name).ok_or_else(|| RoomError::new(name, "invalid_room", "unknown room name"))?;
        if self.hub.leave(conn, &room) {
            Ok(room)
        } else {
            Err(RoomError::new(name, "not_member", "not in this room"))
        }
    }

    /// All joins run concurrently; device lookups for the same id share one fetch.
    pub async fn join_many(
        &self,
        conn: ConnectionId,
        principal: &Principal,
        names: &[String],
    ) -> (Vec<String>, Vec<RoomError>) {
        let results = join_all(names.iter().map(|n| self.join(conn, principal, n))).await;
        let mut joined = Vec::new();
        let mut failed = Vec::new();
        for result in results {
            match result {
                Ok(room) => joined.push(room.to_string()),
                Err(e) => failed.push(e),
            }
        }
        (joined, failed)
    }

    pub fn leave_many(&self, conn: ConnectionId, names: &[String]) -> (Vec<String>, Vec<RoomError>) {
        let mut left = Vec::new();
        let mut failed = Vec::new();
        for name in names {
            match self.leave(conn, name) {
                Ok(room) => left.push(room.to_string()),
                Err(e) => failed.push(e),
            }
        }
        (left, failed)
    }

    pub fn room_info(&self, conn: ConnectionId) -> Vec<String> {
        self.hub.rooms_of(conn).iter().map(Room::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::store::HierarchySource;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn member(org: i64, depts: &[i64]) -> Principal {
        Principal {
            user_id: Some("u-1".into()),
            organization_id: Some(OrganizationId(org)),
            department_ids: depts.iter().copied().map(DepartmentId).collect(),
            is_admin: false,
            authenticated: true,
        }
    }

    fn service(store: Arc<MemoryStore>) -> (RoomService, Arc<RoomHub>, mpsc::Receiver<Frame>) {
        let hub = Arc::new(RoomHub::new());
        let (tx, rx) = mpsc::channel(16);
        hub.register(1, tx);
        let source: Arc<dyn HierarchySource> = store;
        let cache = HierarchyCache::new(source, Duration::from_secs(300));
        (RoomService::new(hub.clone(), cache), hub, rx)
    }

    #[test]
    fn room_names_round_trip() {
        for name in ["device:12", "dept:3", "org:9", "admin", "monitoring"] {
            assert_eq!(Room::parse(name).map(|r| r.to_string()).as_deref(), Some(name));
        }
        assert_eq!(Room::parse("organization:4"), Some(Room::Organization(OrganizationId(4))));
        assert_eq!(Room::parse("device:abc"), None);
        assert_eq!(Room::parse("zone:1"), None);
    }

    #[test]
    fn static_authorization_rules() {
        let p = member(3, &[7]);
        assert_eq!(authorize(&p, &Room::Organization(OrganizationId(3))), Access::Granted);
        assert!(matches!(authorize(&p, &Room::Organization(OrganizationId(4))), Access::Denied("forbidden", _)));
        assert_eq!(authorize(&p, &Room::Department(DepartmentId(7))), Access::Granted);
        assert!(matches!(authorize(&p, &Room::Department(DepartmentId(8))), Access::Denied(..)));
        assert!(matches!(authorize(&p, &Room::Admin), Access::Denied(..)));
        assert_eq!(authorize(&p, &Room::Device(DeviceId(5))), Access::CheckDevice(DeviceId(5)));

        let anon = Principal::anonymous();
        assert_eq!(authorize(&anon, &Room::Monitoring), Access::Granted);
        assert!(matches!(authorize(&anon, &Room::Organization(OrganizationId(3))), Access::Denied("unauthorized", _)));
        assert!(matches!(authorize(&anon, &Room::Device(DeviceId(5))), Access::Denied("unauthorized", _)));

        let admin = Principal {
            is_admin: true,
            ..member(1, &[])
        };
        assert_eq!(authorize(&admin, &Room::Admin), Access::Granted);
        assert_eq!(authorize(&admin, &Room::Device(DeviceId(5))), Access::Granted);
    }

    #[tokio::test]
    async fn org_room_join_needs_no_lookup() {
        let store = Arc::new(MemoryStore::new());
        let (rooms, hub, _rx) = service(store.clone());

        let room = rooms.join(1, &member(3, &[]), "org:3").await.unwrap();
        assert_eq!(room, Room::Organization(OrganizationId(3)));
        assert_eq!(hub.member_count(&room), 1);
        assert_eq!(store.hierarchy_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn device_room_requires_matching_organization() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(5, "SN-5", 2, None, "broker", "t/5");
        let (rooms, _hub, _rx) = service(store.clone());

        let err = rooms.join(1, &member(1, &[]), "device:5").await.unwrap_err();
        assert_eq!(err.error, "forbidden");
        assert_eq!(err.room, "device:5");

        let admin = Principal {
            is_admin: true,
            ..member(1, &[])
        };
        assert_eq!(rooms.join(1, &admin, "device:5").await.unwrap(), Room::Device(DeviceId(5)));

        assert!(rooms.join(1, &member(2, &[]), "device:5").await.is_ok());
        assert_eq!(rooms.join(1, &member(2, &[]), "device:404").await.unwrap_err().error, "not_found");
    }

    #[tokio::test]
    async fn concurrent_device_joins_share_one_lookup() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(5, "SN-5", 2, None, "broker", "t/5");
        store.set_hierarchy_delay(Duration::from_millis(50));
        let (rooms, _hub, _rx) = service(store.clone());

        let names = vec!["device:5".to_string(); 5];
        let (joined, failed) = rooms.join_many(1, &member(2, &[]), &names).await;
        assert_eq!(joined.len(), 5);
        assert!(failed.is_empty());
        assert_eq!(store.hierarchy_fetches.load(Ordering::SeqCst), 1);

        let (joined, failed) = rooms.join_many(1, &member(9, &[]), &names).await;
        assert!(joined.is_empty());
        assert_eq!(failed.len(), 5);
        assert!(failed.iter().all(|f| f.error == "forbidden"));
        // second batch served from cache
        assert_eq!(store.hierarchy_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leave_and_room_info() {
        let store = Arc::new(MemoryStore::new());
        let (rooms, hub, _rx) = service(store);
        let p = member(3, &[7]);

        rooms.join(1, &p, "org:3").await.unwrap();
        rooms.join(1, &p, "dept:7").await.unwrap();
        assert_eq!(rooms.room_info(1), vec!["dept:7".to_string(), "org:3".to_string()]);

        assert!(rooms.leave(1, "org:3").is_ok());
        assert_eq!(rooms.leave(1, "org:3").unwrap_err().error, "not_member");
        assert_eq!(rooms.leave(1, "bogus").unwrap_err().error, "invalid_room");

        hub.unregister(1);
        assert_eq!(hub.member_count(&Room::Department(DepartmentId(7))), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn emit_reaches_members_only() {
        let hub = RoomHub::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.register(1, tx1);
        hub.register(2, tx2);
        let room = Room::Organization(OrganizationId(1));
        hub.join(1, &room);

        let f = frame("org_device_data", serde_json::json!({"x": 1})).unwrap();
        assert_eq!(hub.emit(&room, &f), 1);
        assert_eq!(&*rx1.recv().await.unwrap(), r#"{"event":"org_device_data","data":{"x":1}}"#);
        assert!(rx2.try_recv().is_err());
    }
}
