//! Named-event channel
//!
//! `send` is fire-and-forget. `subscribe` registers a handler per event name; handlers
//! run one at a time, in delivery order, on whichever task delivers inbound frames.

use crate::webrtc::signaling::{ClientMessage, EventName, ServerMessage};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Callback invoked for each delivered message of a subscribed event
pub type MessageHandler = Box<dyn Fn(ServerMessage) + Send + Sync>;

/// Bidirectional named-event channel to the relay
pub trait Channel: Send + Sync {
    /// Queue a message for delivery. Never fails; undeliverable messages are dropped.
    fn send(&self, message: ClientMessage);

    /// Register `handler` for every inbound message named `event`
    fn subscribe(&self, event: EventName, handler: MessageHandler);
}

/// Subscriptions keyed by event name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventName, Vec<MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: EventName, handler: MessageHandler) {
        self.handlers.write().entry(event).or_default().push(handler);
    }

    /// Run every handler registered for the message's event. Returns false if none matched.
    pub fn dispatch(&self, message: ServerMessage) -> bool {
        let event = message.event();
        let handlers = self.handlers.read();
        match handlers.get(&event) {
            Some(list) if !list.is_empty() => {
                for handler in list {
                    handler(message.clone());
                }
                true
            }
            _ => {
                debug!("No handler for {} event", event);
                false
            }
        }
    }
}

/// In-process channel: records outbound messages and delivers inbound ones on demand
#[derive(Default)]
pub struct LoopbackChannel {
    sent: Mutex<Vec<ClientMessage>>,
    handlers: HandlerRegistry,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound message to the subscribed handlers
    pub fn deliver(&self, message: ServerMessage) -> bool {
        self.handlers.dispatch(message)
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Take and clear everything sent so far
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, message: ClientMessage) {
        self.sent.lock().push(message);
    }

    fn subscribe(&self, event: EventName, handler: MessageHandler) {
        self.handlers.subscribe(event, handler);
    }
}
