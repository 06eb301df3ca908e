//! Client runtime
//!
//! Owns one `SessionCoordinator` and feeds it from a single select loop: channel
//! messages, link events from the WebRTC backend, the negotiation sweep and Ctrl-C.
//! Channel handlers only forward into the loop's queue.

use crate::config::Config;
use crate::rooms::{ParticipantId, RoomDirectory, RoomId};
use crate::transport::{Channel, WsChannel};
use crate::webrtc::signaling::ServerMessage;
use crate::webrtc::{PeerConnector, RtcConnector, SessionCoordinator};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;

/// How long teardown waits for the leave frame to reach the relay
const LEAVE_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// How long `rooms` waits for the relay's answer
const ROOM_LIST_WAIT: Duration = Duration::from_secs(5);

/// What the client does once connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Create a fresh room and join it
    Start,
    /// Join an existing room
    Join(RoomId),
    /// Print the active rooms and exit
    ListRooms,
}

pub struct ClientRuntime {
    config: Config,
    participant_id: ParticipantId,
}

impl ClientRuntime {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            participant_id: ParticipantId::generate(),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Connect, run `command` and keep the session alive until Ctrl-C or disconnect
    pub async fn run(self, command: ClientCommand) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.config.client.signaling_url.clone();
        let ws = Arc::new(WsChannel::connect(&url).await?);
        info!("Participant id: {}", self.participant_id);

        let directory = RoomDirectory::new();
        directory.attach(ws.as_ref());
        let mut rooms_rx = directory.watch();

        if command == ClientCommand::ListRooms {
            directory.request_rooms(ws.as_ref());
            match tokio::time::timeout(ROOM_LIST_WAIT, rooms_rx.changed()).await {
                Ok(Ok(())) => print_rooms(&directory.rooms()),
                _ => warn!("No room list received within {:?}", ROOM_LIST_WAIT),
            }
            ws.close(LEAVE_FLUSH_GRACE).await;
            return Ok(());
        }

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        forward_events::<RtcConnector>(ws.as_ref(), inbound_tx);

        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let connector = RtcConnector::new(self.config.webrtc.clone(), link_tx);
        let timeout = Duration::from_secs(self.config.client.negotiation_timeout_secs);
        let channel: Arc<dyn Channel> = ws.clone();
        let mut coordinator = SessionCoordinator::new(self.participant_id.clone(), channel, connector)
            .with_negotiation_timeout(timeout);

        directory.request_rooms(ws.as_ref());
        match command {
            ClientCommand::Start => {
                let room_id = coordinator.start_session().await;
                println!("Started room {}", room_id);
            }
            ClientCommand::Join(room_id) => {
                if !coordinator.join_session(Some(room_id.clone())).await {
                    warn!("Nothing to join");
                    ws.close(LEAVE_FLUSH_GRACE).await;
                    return Ok(());
                }
                println!("Joining room {}", room_id);
            }
            ClientCommand::ListRooms => {}
        }

        let sweep_period = if timeout.is_zero() {
            Duration::from_secs(1)
        } else {
            (timeout / 2).max(Duration::from_millis(100))
        };
        let mut sweep = tokio::time::interval(sweep_period);
        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(message) = inbound_rx.recv() => {
                    process_inbound(&mut coordinator, message).await;
                }
                Some(event) = link_rx.recv() => {
                    coordinator.handle_link_event(event).await;
                }
                Ok(()) = rooms_rx.changed() => {
                    let rooms = rooms_rx.borrow_and_update().clone();
                    info!("Active rooms: {}", join_ids(&rooms));
                }
                _ = sweep.tick() => {
                    if !ws.is_connected() {
                        warn!("Lost connection to signaling relay");
                        break;
                    }
                    let expired = coordinator.expire_stalled(Instant::now()).await;
                    if expired > 0 {
                        debug!("{} link(s) expired", expired);
                    }
                }
            }
        }

        coordinator.teardown().await;
        ws.close(LEAVE_FLUSH_GRACE).await;
        info!("Client stopped");
        Ok(())
    }
}

/// Forward every coordinator event from `channel` into `tx`
pub(crate) fn forward_events<P: PeerConnector>(
    channel: &dyn Channel,
    tx: mpsc::UnboundedSender<ServerMessage>,
) {
    for event in SessionCoordinator::<P>::SUBSCRIBED_EVENTS {
        let tx = tx.clone();
        channel.subscribe(
            event,
            Box::new(move |message| {
                let _ = tx.send(message);
            }),
        );
    }
}

/// Apply one inbound message and start whatever negotiations it made possible
pub(crate) async fn process_inbound<P: PeerConnector>(
    coordinator: &mut SessionCoordinator<P>,
    message: ServerMessage,
) {
    let roster_changes = matches!(
        message,
        ServerMessage::JoinRoom(_) | ServerMessage::MemberLeft(_)
    );
    let before = coordinator.roster().len();

    coordinator.handle_message(message).await;

    if roster_changes {
        coordinator.start_negotiations().await;
        if let Some(room_id) = coordinator.current_room() {
            if coordinator.roster().len() != before {
                info!(
                    "Room {} roster: {}",
                    room_id,
                    join_ids(coordinator.roster())
                );
            }
        }
    }
}

fn join_ids<T: std::fmt::Display>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_rooms(rooms: &[RoomId]) {
    if rooms.is_empty() {
        println!("No active rooms");
        return;
    }
    for room in rooms {
        println!("{}", room);
    }
}
