//! Client-side cache of the relay's active rooms

use super::RoomId;
use crate::transport::Channel;
use crate::webrtc::signaling::{ClientMessage, EventName, ServerMessage};
use log::debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Last room list pushed by the relay. Each push replaces the list.
#[derive(Clone)]
pub struct RoomDirectory {
    rooms: Arc<watch::Sender<Vec<RoomId>>>,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDirectory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { rooms: Arc::new(tx) }
    }

    /// Subscribe to `get-rooms` pushes on `channel`
    pub fn attach(&self, channel: &dyn Channel) {
        let directory = self.clone();
        channel.subscribe(
            EventName::GetRooms,
            Box::new(move |message| {
                if let ServerMessage::GetRooms(rooms) = message {
                    directory.apply(rooms);
                }
            }),
        );
    }

    /// Ask the relay for the current room list
    pub fn request_rooms(&self, channel: &dyn Channel) {
        channel.send(ClientMessage::GetRooms);
    }

    pub fn apply(&self, rooms: Vec<RoomId>) {
        debug!("Room list updated: {} room(s)", rooms.len());
        self.rooms.send_replace(rooms);
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.borrow().clone()
    }

    /// Receiver that observes every future update
    pub fn watch(&self) -> watch::Receiver<Vec<RoomId>> {
        self.rooms.subscribe()
    }
}
