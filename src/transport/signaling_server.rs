//! Room signaling relay
//!
//! Tracks which participant speaks through which WebSocket connection, keeps the
//! room roster and forwards peer-addressed negotiation messages by their `to` field.
//!
//! Membership flow:
//! 1. `join-room` adds the user to the room and broadcasts the pre-join roster
//!    to every member, newcomer included
//! 2. `leave-room` or a closed socket removes the user and notifies who is left
//! 3. Any change to the set of rooms is pushed to every connection as `get-rooms`

use crate::config::ServerConfig;
use crate::rooms::registry::LeaveOutcome;
use crate::rooms::{ParticipantId, RoomId, RoomRegistry};
use crate::webrtc::signaling::{
    ClientMessage, JoinRequest, LeaveRequest, MemberLeft, RoomUpdate, ServerMessage,
};
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Relay-assigned id of one WebSocket connection
pub type ConnectionId = u64;

struct Connection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    users: HashSet<ParticipantId>,
}

#[derive(Default)]
struct RelayState {
    registry: RoomRegistry,
    connections: HashMap<ConnectionId, Connection>,
    users: HashMap<ParticipantId, ConnectionId>,
}

impl RelayState {
    fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) {
        if let Some(connection) = self.connections.get(&connection_id) {
            if connection.tx.send(message).is_err() {
                debug!("Connection {} already closed", connection_id);
            }
        }
    }

    fn send_to_user(&self, user_id: &ParticipantId, message: ServerMessage) {
        match self.users.get(user_id) {
            Some(connection_id) => self.send_to(*connection_id, message),
            None => debug!("No connection for {}, dropping {}", user_id, message.event()),
        }
    }

    fn send_to_members(&self, members: &[ParticipantId], message: &ServerMessage) {
        for member in members {
            self.send_to_user(member, message.clone());
        }
    }

    fn push_room_list(&self) {
        let rooms = self.registry.room_ids();
        for connection_id in self.connections.keys() {
            self.send_to(*connection_id, ServerMessage::GetRooms(rooms.clone()));
        }
    }

    fn bind_user(&mut self, connection_id: ConnectionId, user_id: &ParticipantId) {
        if let Some(previous) = self.users.insert(user_id.clone(), connection_id) {
            if previous != connection_id {
                if let Some(connection) = self.connections.get_mut(&previous) {
                    connection.users.remove(user_id);
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.users.insert(user_id.clone());
        }
    }

    fn owns(&self, connection_id: ConnectionId, user_id: &ParticipantId) -> bool {
        self.users.get(user_id) == Some(&connection_id)
    }

    fn join(&mut self, connection_id: ConnectionId, request: JoinRequest) {
        if request.room_id.is_blank() {
            debug!("Ignoring join-room without a room id from {}", request.user_id);
            return;
        }
        self.bind_user(connection_id, &request.user_id);

        let outcome = self.registry.join(&request.room_id, &request.user_id);
        info!(
            "{} joined room {} ({} member(s) before)",
            request.user_id,
            request.room_id,
            outcome.existing.len()
        );

        let members = self.registry.members(&request.room_id).to_vec();
        let broadcast = ServerMessage::JoinRoom(RoomUpdate {
            room_id: request.room_id,
            new_member: request.user_id,
            room_members: outcome.existing,
        });
        self.send_to_members(&members, &broadcast);

        if outcome.room_created {
            self.push_room_list();
        }
    }

    fn leave(&mut self, connection_id: ConnectionId, request: LeaveRequest) {
        if !self.owns(connection_id, &request.user_id) {
            debug!("Ignoring leave-room for {} from foreign connection", request.user_id);
            return;
        }
        let left = match request.room_id {
            Some(room_id) => self
                .registry
                .leave(&room_id, &request.user_id)
                .map(|outcome| vec![(room_id, outcome)])
                .unwrap_or_default(),
            None => self.registry.leave_all(&request.user_id),
        };
        self.announce_departures(&request.user_id, left);
    }

    fn announce_departures(
        &mut self,
        user_id: &ParticipantId,
        left: Vec<(RoomId, LeaveOutcome)>,
    ) {
        let mut rooms_changed = false;
        for (room_id, outcome) in left {
            info!("{} left room {}", user_id, room_id);
            let departure = ServerMessage::MemberLeft(MemberLeft {
                room_id,
                user_id: user_id.clone(),
            });
            self.send_to_members(&outcome.remaining, &departure);
            rooms_changed |= outcome.room_removed;
        }
        if rooms_changed {
            self.push_room_list();
        }
    }

    /// Forward a peer-addressed message when both ends are members of the room
    fn route(
        &self,
        connection_id: ConnectionId,
        room_id: &RoomId,
        from: &ParticipantId,
        to: &ParticipantId,
        message: ServerMessage,
    ) {
        if !self.owns(connection_id, from) {
            warn!("Connection {} sent {} on behalf of {}", connection_id, message.event(), from);
            return;
        }
        if !self.registry.is_member(room_id, from) || !self.registry.is_member(room_id, to) {
            debug!(
                "Dropping {} from {} to {}: not both in room {}",
                message.event(),
                from,
                to,
                room_id
            );
            return;
        }
        self.send_to_user(to, message);
    }
}

/// In-memory relay shared by every connection
pub struct Relay {
    state: Mutex<RelayState>,
    next_connection: AtomicU64,
    started_at: Instant,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            next_connection: AtomicU64::new(1),
            started_at: Instant::now(),
        }
    }

    /// Register a connection. Messages for it arrive on the returned receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().connections.insert(
            connection_id,
            Connection {
                tx,
                users: HashSet::new(),
            },
        );
        (connection_id, rx)
    }

    pub fn handle(&self, connection_id: ConnectionId, message: ClientMessage) {
        let mut state = self.state.lock();
        match message {
            ClientMessage::GetRooms => {
                let rooms = state.registry.room_ids();
                state.send_to(connection_id, ServerMessage::GetRooms(rooms));
            }
            ClientMessage::JoinRoom(request) => state.join(connection_id, request),
            ClientMessage::LeaveRoom(request) => state.leave(connection_id, request),
            ClientMessage::Offer(offer) => {
                let (room_id, from, to) = (offer.room_id.clone(), offer.from.clone(), offer.to.clone());
                state.route(connection_id, &room_id, &from, &to, ServerMessage::Offer(offer));
            }
            ClientMessage::Answer(answer) => {
                let (room_id, from, to) =
                    (answer.room_id.clone(), answer.from.clone(), answer.to.clone());
                state.route(connection_id, &room_id, &from, &to, ServerMessage::Answer(answer));
            }
            ClientMessage::IceCandidate(signal) => {
                let (room_id, from, to) =
                    (signal.room_id.clone(), signal.from.clone(), signal.to.clone());
                state.route(
                    connection_id,
                    &room_id,
                    &from,
                    &to,
                    ServerMessage::IceCandidate(signal),
                );
            }
        }
    }

    /// Drop a connection, removing its users from every room
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.remove(&connection_id) else {
            return;
        };
        for user_id in connection.users {
            if state.users.get(&user_id) == Some(&connection_id) {
                state.users.remove(&user_id);
                let left = state.registry.leave_all(&user_id);
                state.announce_departures(&user_id, left);
            }
        }
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.state.lock().registry.room_ids()
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.state.lock().registry.members(room_id).to_vec()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

/// Serve one relay WebSocket until it closes
pub async fn handle_relay_connection(socket: WebSocket, relay: Arc<Relay>) {
    let (connection_id, mut rx) = relay.register();
    info!("Relay connection {} opened", connection_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {}: {}", message.event(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                match ClientMessage::from_json(text_str) {
                    Ok(message) => relay.handle(connection_id, message),
                    Err(e) => warn!("Invalid frame on connection {}: {}", connection_id, e),
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame on connection {}", connection_id);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    relay.disconnect(connection_id);
    send_task.abort();
    info!("Relay connection {} closed", connection_id);
}

/// Router exposing the relay socket at `/ws` plus `/health` and `/rooms`
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .with_state(relay)
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    ws.on_upgrade(move |socket| handle_relay_connection(socket, relay))
}

async fn health_handler(State(relay): State<Arc<Relay>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": relay.started_at.elapsed().as_secs_f64(),
        "connections": relay.connection_count(),
        "rooms": relay.room_ids().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn rooms_handler(State(relay): State<Arc<Relay>>) -> Json<Vec<RoomId>> {
    Json(relay.room_ids())
}

/// Bind and run the relay until the process exits
pub async fn run_signaling_server(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Signaling relay listening on ws://{}/ws", addr);

    axum::serve(listener, router(Arc::new(Relay::new())))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}
