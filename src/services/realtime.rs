//! Websocket endpoint for realtime subscribers.
//!
//! Clients authenticate with a bearer token (`?token=` or `Authorization: Bearer`), then send
//! JSON control messages such as `{"type": "join_device", "deviceId": 7}`. Every server frame is
//! `{"event": ..., "data": ...}`.

use crate::auth::{Authenticator, Principal};
use crate::services::rooms::{ConnectionId, Frame, RoomError, RoomService, frame};
use futures::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

/// Frames buffered per client before broadcasts to it are dropped.
const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinDevice { device_id: i64 },
    LeaveDevice { device_id: i64 },
    JoinOrganization { organization_id: i64 },
    LeaveOrganization { organization_id: i64 },
    JoinDepartment { department_id: i64 },
    LeaveDepartment { department_id: i64 },
    JoinRoom { room: String },
    LeaveRoom { room: String },
    JoinRooms { rooms: Vec<String> },
    LeaveRooms { rooms: Vec<String> },
    RoomInfo,
}

#[derive(Serialize)]
struct RoomRef<'a> {
    room: &'a str,
}

#[derive(Serialize)]
struct Bulk<'a> {
    joined: &'a [String],
    failed: &'a [RoomError],
}

#[derive(Serialize)]
struct BulkLeave<'a> {
    left: &'a [String],
    failed: &'a [RoomError],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfo<'a> {
    connection_id: ConnectionId,
    rooms: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Welcome<'a> {
    connection_id: ConnectionId,
    authenticated: bool,
    is_admin: bool,
    user_id: Option<&'a str>,
}

#[derive(Serialize)]
struct Problem<'a> {
    error: &'a str,
    reason: String,
}

fn encode<T: Serialize>(event: &str, data: T) -> Option<Frame> {
    frame(event, data)
        .map_err(|e| warn!("Realtime: failed to encode {}: {}", event, e))
        .ok()
}

/// Token from the `token` query parameter, else from a bearer `Authorization` header.
pub fn extract_token<B>(req: &http::Request<B>) -> Option<String> {
    let from_query = req.uri().query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v.to_string())
    });
    from_query
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|v| v.trim().to_string())
        })
        .filter(|t| !t.is_empty())
}

pub struct RealtimeServer {
    rooms: Arc<RoomService>,
    auth: Arc<dyn Authenticator>,
    next_id: AtomicU64,
}

impl RealtimeServer {
    pub fn new(rooms: Arc<RoomService>, auth: Arc<dyn Authenticator>) -> Self {
        RealtimeServer {
            rooms,
            auth,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("Realtime: listening on ws://{}", addr);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(self.clone().handle_connection(stream, peer));
                    }
                    Err(e) => warn!("Realtime: accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Realtime: listener closed");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut token = None;
        let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            token = extract_token(req);
            Ok(resp)
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Realtime: handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let principal = self.auth.authenticate(token.as_deref());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, mut inbox) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
        let hub = self.rooms.hub().clone();
        hub.register(id, outbox);
        info!(
            "Realtime: connection {} from {} ({})",
            id,
            peer,
            principal.user_id.as_deref().unwrap_or("anonymous")
        );

        let (mut sink, mut stream) = ws.split();
        let welcome = encode(
            "connected",
            Welcome {
                connection_id: id,
                authenticated: !principal.is_anonymous(),
                is_admin: principal.is_admin,
                user_id: principal.user_id.as_deref(),
            },
        );
        if let Some(f) = welcome
            && sink.send(Message::text(f.to_string())).await.is_err()
        {
            hub.unregister(id);
            return;
        }

        loop {
            tokio::select! {
                Some(f) = inbox.recv() => {
                    if sink.send(Message::text(f.to_string())).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_text(id, &principal, text.as_str()).await
                            && sink.send(Message::text(reply.to_string())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Realtime: connection {} read error: {}", id, e);
                        break;
                    }
                },
            }
        }

        hub.unregister(id);
        info!("Realtime: connection {} closed", id);
    }

    /// Apply one control message and build the reply frame.
    pub async fn handle_text(&self, conn: ConnectionId, principal: &Principal, text: &str) -> Option<Frame> {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                return encode(
                    "error",
                    Problem {
                        error: "invalid_message",
                        reason: e.to_string(),
                    },
                );
            }
        };
        debug!("Realtime: connection {} sent {:?}", conn, msg);

        let join = |name: String| async move {
            match self.rooms.join(conn, principal, &name).await {
                Ok(room) => encode("room_joined", RoomRef { room: &room.to_string() }),
                Err(e) => encode("room_error", e),
            }
        };
        let leave = |name: String| match self.rooms.leave(conn, &name) {
            Ok(room) => encode("room_left", RoomRef { room: &room.to_string() }),
            Err(e) => encode("room_error", e),
        };

        match msg {
            ClientMessage::JoinDevice { device_id } => join(format!("device:{}", device_id)).await,
            ClientMessage::LeaveDevice { device_id } => leave(format!("device:{}", device_id)),
            ClientMessage::JoinOrganization { organization_id } => join(format!("org:{}", organization_id)).await,
            ClientMessage::LeaveOrganization { organization_id } => leave(format!("org:{}", organization_id)),
            ClientMessage::JoinDepartment { department_id } => join(format!("dept:{}", department_id)).await,
            ClientMessage::LeaveDepartment { department_id } => leave(format!("dept:{}", department_id)),
            ClientMessage::JoinRoom { room } => join(room).await,
            ClientMessage::LeaveRoom { room } => leave(room),
            ClientMessage::JoinRooms { rooms } => {
                let (joined, failed) = self.rooms.join_many(conn, principal, &rooms).await;
                encode(
                    "rooms_joined",
                    Bulk {
                        joined: &joined,
                        failed: &failed,
                    },
                )
            }
            ClientMessage::LeaveRooms { rooms } => {
                let (left, failed) = self.rooms.leave_many(conn, &rooms);
                encode(
                    "rooms_left",
                    BulkLeave {
                        left: &left,
                        failed: &failed,
                    },
                )
            }
            ClientMessage::RoomInfo => {
                let rooms = self.rooms.room_info(conn);
                encode(
                    "room_info",
                    RoomInfo {
                        connection_id: conn,
                        rooms: &rooms,
                    },
                )
            }
        }
    }
}
