//! Session coordination
//!
//! Owns the local participant's identity, the room it is in and one peer link per other
//! roster member. The coordinator is the only writer of the roster and the link arena;
//! every method runs to completion before the next event is handled.
//!
//! Membership protocol:
//! - The newcomer (`newMember == self`) replaces its whole link arena with fresh
//!   links to the pre-join roster and offers to each of them.
//! - Existing members upsert a single link for the newcomer and wait for its offer.

use super::peer_connection::{LinkEvent, PeerConnector};
use super::peer_link::{NegotiationState, PeerLink, PeerLinks};
use super::signaling::{
    CandidateSignal, ClientMessage, EventName, JoinRequest, LeaveRequest, MemberLeft, RoomUpdate,
    ServerMessage, SessionDescription,
};
use crate::rooms::{ParticipantId, RoomId};
use crate::transport::Channel;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the local participant is in the join/leave protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not in a room
    Idle,
    /// Join sent, waiting for the relay's broadcast
    Joining,
    /// In a room
    Joined,
}

/// Room membership and peer-link topology for one local participant
pub struct SessionCoordinator<P: PeerConnector> {
    participant_id: ParticipantId,
    channel: Arc<dyn Channel>,
    connector: P,
    negotiation_timeout: Option<Duration>,
    /// Room this client asked to join and has not yet seen confirmed
    pending_room: Option<RoomId>,
    current_room: Option<RoomId>,
    roster: Vec<ParticipantId>,
    links: PeerLinks<P::Connection>,
    /// Last generation handed to the connector
    next_generation: u64,
}

impl<P: PeerConnector> SessionCoordinator<P> {
    /// Events the coordinator must receive from the channel
    pub const SUBSCRIBED_EVENTS: [EventName; 5] = [
        EventName::JoinRoom,
        EventName::MemberLeft,
        EventName::Offer,
        EventName::Answer,
        EventName::IceCandidate,
    ];

    pub fn new(participant_id: ParticipantId, channel: Arc<dyn Channel>, connector: P) -> Self {
        Self {
            participant_id,
            channel,
            connector,
            negotiation_timeout: None,
            pending_room: None,
            current_room: None,
            roster: Vec::new(),
            links: PeerLinks::new(),
            next_generation: 0,
        }
    }

    /// Fail links that are not connected within `timeout`. Zero disables the limit.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn current_room(&self) -> Option<&RoomId> {
        self.current_room.as_ref()
    }

    pub fn pending_room(&self) -> Option<&RoomId> {
        self.pending_room.as_ref()
    }

    pub fn roster(&self) -> &[ParticipantId] {
        &self.roster
    }

    pub fn links(&self) -> &PeerLinks<P::Connection> {
        &self.links
    }

    pub fn link_state(&self, remote: &ParticipantId) -> Option<NegotiationState> {
        self.links.get(remote).map(|link| link.state())
    }

    pub fn state(&self) -> SessionState {
        if self.current_room.is_some() {
            SessionState::Joined
        } else if self.pending_room.is_some() {
            SessionState::Joining
        } else {
            SessionState::Idle
        }
    }

    /// Create a new room and ask to join it
    pub async fn start_session(&mut self) -> RoomId {
        let room_id = RoomId::generate();
        self.request_join(room_id.clone()).await;
        room_id
    }

    /// Ask to join an existing room. Blank or missing room ids are ignored.
    pub async fn join_session(&mut self, room_id: Option<RoomId>) -> bool {
        match room_id {
            Some(room_id) if !room_id.is_blank() => {
                self.request_join(room_id).await;
                true
            }
            _ => {
                debug!("join_session called without a room, ignoring");
                false
            }
        }
    }

    async fn request_join(&mut self, room_id: RoomId) {
        let active = self.current_room.as_ref().or(self.pending_room.as_ref());
        if active.is_some_and(|room| *room != room_id) {
            self.leave_session().await;
        }
        info!("Joining room {} as {}", room_id, self.participant_id);
        self.pending_room = Some(room_id.clone());
        self.channel.send(ClientMessage::JoinRoom(JoinRequest {
            room_id,
            user_id: self.participant_id.clone(),
        }));
    }

    /// Announce departure and drop every link without waiting for the relay
    pub async fn leave_session(&mut self) {
        let room_id = self.current_room.take().or_else(|| self.pending_room.take());
        self.channel.send(ClientMessage::LeaveRoom(LeaveRequest {
            room_id: room_id.clone(),
            user_id: self.participant_id.clone(),
        }));

        self.links.close_all().await;
        self.roster.clear();
        self.pending_room = None;

        match room_id {
            Some(room) => info!("Left room {}", room),
            None => debug!("Leave sent while not in a room"),
        }
    }

    /// Process teardown: best-effort leave
    pub async fn teardown(&mut self) {
        self.leave_session().await;
    }

    /// Handle one inbound channel message
    pub async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::JoinRoom(update) => self.handle_room_update(update).await,
            ServerMessage::MemberLeft(departure) => self.handle_member_left(departure).await,
            ServerMessage::Offer(offer) => self.handle_offer(offer).await,
            ServerMessage::Answer(answer) => self.handle_answer(answer).await,
            ServerMessage::IceCandidate(signal) => self.handle_remote_candidate(signal).await,
            ServerMessage::GetRooms(_) => {}
        }
    }

    fn is_room_of_interest(&self, room_id: &RoomId) -> bool {
        self.pending_room.as_ref() == Some(room_id) || self.current_room.as_ref() == Some(room_id)
    }

    async fn handle_room_update(&mut self, update: RoomUpdate) {
        if !self.is_room_of_interest(&update.room_id) {
            debug!("Ignoring join-room for unrelated room {}", update.room_id);
            return;
        }

        self.current_room = Some(update.room_id.clone());
        self.pending_room = None;

        if update.new_member == self.participant_id {
            let mut next = PeerLinks::new();
            let mut roster = Vec::with_capacity(update.room_members.len() + 1);
            for member in update.room_members {
                if member == self.participant_id || roster.contains(&member) {
                    continue;
                }
                next.insert_if_absent(self.open_link(&member, true).await);
                roster.push(member);
            }
            roster.push(self.participant_id.clone());

            let mut previous = self.links.replace(next);
            previous.close_all().await;
            self.roster = roster;

            info!(
                "Joined room {} with {} other member(s)",
                update.room_id,
                self.links.len()
            );
        } else {
            let newcomer = update.new_member;
            if !self.links.contains(&newcomer) {
                let link = self.open_link(&newcomer, false).await;
                self.links.insert_if_absent(link);
            } else {
                debug!("Link to {} already exists, keeping it", newcomer);
            }
            if !self.roster.contains(&newcomer) {
                self.roster.push(newcomer.clone());
            }
            info!("New user {} joined room {}", newcomer, update.room_id);
        }
    }

    async fn handle_member_left(&mut self, departure: MemberLeft) {
        if self.current_room.as_ref() != Some(&departure.room_id)
            || departure.user_id == self.participant_id
        {
            debug!("Ignoring member-left for {} in {}", departure.user_id, departure.room_id);
            return;
        }

        if let Some(mut link) = self.links.remove(&departure.user_id) {
            link.close().await;
        }
        self.roster.retain(|member| *member != departure.user_id);
        info!("User {} left room {}", departure.user_id, departure.room_id);
    }

    fn is_addressed_to_me(&self, room_id: &RoomId, to: &ParticipantId) -> bool {
        self.current_room.as_ref() == Some(room_id) && *to == self.participant_id
    }

    async fn handle_offer(&mut self, offer: SessionDescription) {
        if !self.is_addressed_to_me(&offer.room_id, &offer.to) {
            debug!("Dropping offer from {} not addressed to this session", offer.from);
            return;
        }
        if offer.from == self.participant_id {
            return;
        }

        // A fresh offer on a link past Pending means the sender rebuilt its side
        let renegotiating = self
            .links
            .get(&offer.from)
            .is_some_and(|link| link.state() != NegotiationState::Pending);
        if renegotiating {
            if let Some(mut stale) = self.links.remove(&offer.from) {
                info!(
                    "New offer from {} while {:?}, replacing the link",
                    offer.from,
                    stale.state()
                );
                stale.close().await;
            }
        }

        // The offer can overtake the join-room broadcast announcing its sender
        if !self.links.contains(&offer.from) {
            let link = self.open_link(&offer.from, false).await;
            self.links.insert_if_absent(link);
            if !self.roster.contains(&offer.from) {
                self.roster.push(offer.from.clone());
            }
        }

        let Some(link) = self.links.get_mut(&offer.from) else {
            return;
        };
        if let Some(sdp) = link.answer(&offer.sdp).await {
            self.channel.send(ClientMessage::Answer(SessionDescription {
                room_id: offer.room_id,
                from: self.participant_id.clone(),
                to: offer.from,
                sdp,
            }));
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        if !self.is_addressed_to_me(&answer.room_id, &answer.to) {
            debug!("Dropping answer from {} not addressed to this session", answer.from);
            return;
        }
        match self.links.get_mut(&answer.from) {
            Some(link) => link.accept_answer(&answer.sdp).await,
            None => debug!("Answer from {} without a link", answer.from),
        }
    }

    async fn handle_remote_candidate(&mut self, signal: CandidateSignal) {
        if !self.is_addressed_to_me(&signal.room_id, &signal.to) {
            return;
        }
        match self.links.get_mut(&signal.from) {
            Some(link) => link.add_remote_candidate(signal.candidate).await,
            None => debug!("ICE candidate from {} without a link", signal.from),
        }
    }

    /// Send offers on every Pending link this side initiates
    pub async fn start_negotiations(&mut self) {
        let Some(room_id) = self.current_room.clone() else {
            return;
        };
        for link in self.links.iter_mut() {
            if let Some(sdp) = link.initiate().await {
                self.channel.send(ClientMessage::Offer(SessionDescription {
                    room_id: room_id.clone(),
                    from: self.participant_id.clone(),
                    to: link.remote().clone(),
                    sdp,
                }));
            }
        }
    }

    /// Handle a notification raised by one of the link connections
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let current = self.links.get(event.remote()).map(|link| link.generation());
        if current != Some(event.generation()) {
            debug!(
                "Dropping event for link #{} to {}, current link is {:?}",
                event.generation(),
                event.remote(),
                current
            );
            return;
        }

        match event {
            LinkEvent::LocalCandidate {
                remote, candidate, ..
            } => {
                let Some(room_id) = self.current_room.clone() else {
                    return;
                };
                if !self.links.get(&remote).is_some_and(|link| link.is_open()) {
                    debug!("Dropping local candidate for closed link to {}", remote);
                    return;
                }
                self.channel.send(ClientMessage::IceCandidate(CandidateSignal {
                    room_id,
                    from: self.participant_id.clone(),
                    to: remote,
                    candidate,
                }));
            }
            LinkEvent::Connected { remote, .. } => {
                if let Some(link) = self.links.get_mut(&remote) {
                    link.mark_connected();
                    info!("Audio link to {} connected", remote);
                }
            }
            LinkEvent::Failed { remote, .. } => {
                if let Some(link) = self.links.get_mut(&remote) {
                    warn!("Audio link to {} failed", remote);
                    link.fail().await;
                }
            }
        }
    }

    /// Fail links still negotiating after the timeout. Returns how many expired.
    pub async fn expire_stalled(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.negotiation_timeout else {
            return 0;
        };
        let mut expired = 0;
        for link in self.links.iter_mut() {
            let negotiating = matches!(
                link.state(),
                NegotiationState::Pending | NegotiationState::OfferSent | NegotiationState::AnswerSent
            );
            if negotiating && link.age(now) >= timeout {
                warn!(
                    "Negotiation with {} stalled in {:?} for {:?}, giving up",
                    link.remote(),
                    link.state(),
                    timeout
                );
                link.fail().await;
                expired += 1;
            }
        }
        expired
    }

    async fn open_link(&mut self, remote: &ParticipantId, initiator: bool) -> PeerLink<P::Connection> {
        self.next_generation += 1;
        let generation = self.next_generation;
        match self.connector.connect(remote, generation).await {
            Ok(connection) => PeerLink::new(remote.clone(), generation, connection, initiator),
            Err(e) => {
                warn!("Could not create peer connection for {}: {}", remote, e);
                PeerLink::failed(remote.clone(), generation, initiator)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackChannel;
    use crate::webrtc::signaling::IceCandidate;
    use crate::webrtc::testing::FakeConnector;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    fn coordinator(id: &str) -> (SessionCoordinator<FakeConnector>, Arc<LoopbackChannel>, FakeConnector) {
        let channel = Arc::new(LoopbackChannel::new());
        let connector = FakeConnector::default();
        let coordinator = SessionCoordinator::new(pid(id), channel.clone(), connector.clone());
        (coordinator, channel, connector)
    }

    fn update(room: &RoomId, new_member: &str, members: &[&str]) -> ServerMessage {
        ServerMessage::JoinRoom(RoomUpdate {
            room_id: room.clone(),
            new_member: pid(new_member),
            room_members: members.iter().map(|m| pid(m)).collect(),
        })
    }

    fn remotes<P: PeerConnector>(coordinator: &SessionCoordinator<P>) -> Vec<String> {
        let mut ids: Vec<String> = coordinator
            .links()
            .remotes()
            .map(|id| id.as_str().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn candidate(room: &RoomId, from: &str, to: &str, n: u32) -> ServerMessage {
        ServerMessage::IceCandidate(CandidateSignal {
            room_id: room.clone(),
            from: pid(from),
            to: pid(to),
            candidate: IceCandidate {
                candidate: format!("candidate:{}", n),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        })
    }

    fn generation_of(coordinator: &SessionCoordinator<FakeConnector>, remote: &str) -> u64 {
        coordinator
            .links()
            .get(&pid(remote))
            .map(|link| link.generation())
            .expect("link exists")
    }

    /// Join `room` as `id` with the given existing members
    async fn joined(
        id: &str,
        room: &RoomId,
        members: &[&str],
    ) -> (SessionCoordinator<FakeConnector>, Arc<LoopbackChannel>, FakeConnector) {
        let (mut c, channel, connector) = coordinator(id);
        c.join_session(Some(room.clone())).await;
        c.handle_message(update(room, id, members)).await;
        channel.take_sent();
        connector.log.clear();
        (c, channel, connector)
    }

    #[tokio::test]
    async fn start_session_sends_join_and_waits() {
        let (mut c, channel, _) = coordinator("a");
        let room = c.start_session().await;
        assert_eq!(c.state(), SessionState::Joining);
        assert_eq!(
            channel.sent(),
            vec![ClientMessage::JoinRoom(JoinRequest {
                room_id: room,
                user_id: pid("a"),
            })]
        );
    }

    #[tokio::test]
    async fn start_then_echo_with_empty_roster_is_joined_without_links() {
        let (mut c, _, _) = coordinator("a");
        let room = c.start_session().await;
        c.handle_message(update(&room, "a", &[])).await;
        assert_eq!(c.state(), SessionState::Joined);
        assert_eq!(c.current_room(), Some(&room));
        assert!(c.links().is_empty());
        assert_eq!(c.roster(), &[pid("a")]);
    }

    #[tokio::test]
    async fn newcomer_links_to_every_existing_member() {
        let room = RoomId::from("r1");
        let (mut c, _, _) = coordinator("d");
        c.join_session(Some(room.clone())).await;
        c.handle_message(update(&room, "d", &["a", "b", "c", "d", "b"])).await;
        assert_eq!(remotes(&c), vec!["a", "b", "c"]);
        assert_eq!(c.roster(), &[pid("a"), pid("b"), pid("c"), pid("d")]);
        for remote in ["a", "b", "c"] {
            assert_eq!(c.link_state(&pid(remote)), Some(NegotiationState::Pending));
            assert!(c.links().get(&pid(remote)).is_some_and(|l| l.is_initiator()));
        }
    }

    #[tokio::test]
    async fn newcomer_broadcast_discards_previous_links() {
        let room = RoomId::from("r1");
        let (mut c, _, connector) = joined("a", &room, &[]).await;
        c.handle_message(update(&room, "x", &[])).await;
        assert_eq!(remotes(&c), vec!["x"]);

        // Replayed self-join rebuilds the arena from scratch
        c.handle_message(update(&room, "a", &["y", "z"])).await;
        assert_eq!(remotes(&c), vec!["y", "z"]);
        assert!(connector.log.entries().contains(&"x:close".to_string()));
        assert_eq!(c.roster(), &[pid("y"), pid("z"), pid("a")]);
    }

    #[tokio::test]
    async fn existing_member_adds_exactly_one_link() {
        let room = RoomId::from("r1");
        let (mut c, _, connector) = joined("a", &room, &["b"]).await;
        c.start_negotiations().await;
        let before = c.link_state(&pid("b"));
        connector.log.clear();

        c.handle_message(update(&room, "c", &["a", "b"])).await;

        assert_eq!(remotes(&c), vec!["b", "c"]);
        assert_eq!(c.link_state(&pid("b")), before);
        assert_eq!(c.link_state(&pid("c")), Some(NegotiationState::Pending));
        assert!(!c.links().get(&pid("c")).is_some_and(|l| l.is_initiator()));
        assert!(connector.log.entries().is_empty());
        assert_eq!(c.roster(), &[pid("b"), pid("a"), pid("c")]);
    }

    #[tokio::test]
    async fn replayed_join_broadcast_is_idempotent() {
        let room = RoomId::from("r1");
        let (mut c, _, _) = joined("a", &room, &[]).await;
        c.handle_message(update(&room, "b", &["a"])).await;
        c.handle_message(candidate(&room, "b", "a", 1)).await;
        c.handle_message(update(&room, "b", &["a"])).await;

        assert_eq!(remotes(&c), vec!["b"]);
        assert_eq!(c.roster(), &[pid("a"), pid("b")]);
        assert_eq!(c.links().get(&pid("b")).map(|l| l.queued_candidates()), Some(1));
    }

    #[tokio::test]
    async fn broadcast_for_other_room_is_ignored() {
        let (mut c, _, _) = coordinator("a");
        let room = c.start_session().await;
        c.handle_message(update(&RoomId::from("elsewhere"), "a", &["b"])).await;
        assert_eq!(c.state(), SessionState::Joining);
        assert_eq!(c.pending_room(), Some(&room));
        assert!(c.links().is_empty());
    }

    #[tokio::test]
    async fn broadcast_while_idle_is_ignored() {
        let (mut c, _, _) = coordinator("a");
        c.handle_message(update(&RoomId::from("r1"), "b", &[])).await;
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.roster().is_empty());
    }

    #[tokio::test]
    async fn join_without_room_is_a_no_op() {
        let (mut c, channel, _) = coordinator("a");
        assert!(!c.join_session(None).await);
        assert!(!c.join_session(Some(RoomId::from(""))).await);
        assert!(channel.sent().is_empty());
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn leave_while_idle_sends_null_room_once() {
        let (mut c, channel, _) = coordinator("a");
        c.leave_session().await;
        assert_eq!(
            channel.sent(),
            vec![ClientMessage::LeaveRoom(LeaveRequest {
                room_id: None,
                user_id: pid("a"),
            })]
        );
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn leave_closes_links_and_resets() {
        let room = RoomId::from("r1");
        let (mut c, channel, connector) = joined("a", &room, &["b", "c"]).await;
        c.leave_session().await;

        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.links().is_empty());
        assert!(c.roster().is_empty());
        assert_eq!(
            channel.sent(),
            vec![ClientMessage::LeaveRoom(LeaveRequest {
                room_id: Some(room.clone()),
                user_id: pid("a"),
            })]
        );
        let mut closed = connector.log.entries();
        closed.sort();
        assert_eq!(closed, vec!["b:close", "c:close"]);

        // Late broadcasts for the room we left are not acted on
        c.handle_message(update(&room, "d", &["a", "b", "c"])).await;
        assert!(c.links().is_empty());
    }

    #[tokio::test]
    async fn starting_a_new_room_leaves_the_current_one() {
        let room = RoomId::from("r1");
        let (mut c, channel, _) = joined("a", &room, &["b"]).await;
        let next = c.start_session().await;
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], ClientMessage::LeaveRoom(req) if req.room_id == Some(room.clone())));
        assert!(matches!(&sent[1], ClientMessage::JoinRoom(req) if req.room_id == next));
        assert!(c.links().is_empty());
    }

    #[tokio::test]
    async fn switching_rooms_while_joining_leaves_the_pending_room() {
        let (mut c, channel, _) = coordinator("a");
        let first = c.start_session().await;
        let next = RoomId::from("y");
        assert!(c.join_session(Some(next.clone())).await);

        assert_eq!(
            channel.sent(),
            vec![
                ClientMessage::JoinRoom(JoinRequest {
                    room_id: first.clone(),
                    user_id: pid("a"),
                }),
                ClientMessage::LeaveRoom(LeaveRequest {
                    room_id: Some(first.clone()),
                    user_id: pid("a"),
                }),
                ClientMessage::JoinRoom(JoinRequest {
                    room_id: next.clone(),
                    user_id: pid("a"),
                }),
            ]
        );
        assert_eq!(c.state(), SessionState::Joining);
        assert_eq!(c.pending_room(), Some(&next));

        // The abandoned room's echo no longer lands this client in it
        c.handle_message(update(&first, "a", &[])).await;
        assert_eq!(c.state(), SessionState::Joining);
        assert_eq!(c.current_room(), None);
    }

    #[tokio::test]
    async fn repeating_a_pending_join_does_not_leave() {
        let (mut c, channel, _) = coordinator("a");
        let room = RoomId::from("r1");
        c.join_session(Some(room.clone())).await;
        c.join_session(Some(room.clone())).await;
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| matches!(m, ClientMessage::JoinRoom(_))));
        assert_eq!(c.pending_room(), Some(&room));
    }

    #[tokio::test]
    async fn member_left_drops_link_and_roster_entry() {
        let room = RoomId::from("r1");
        let (mut c, _, connector) = joined("a", &room, &["b", "c"]).await;

        c.handle_message(ServerMessage::MemberLeft(MemberLeft {
            room_id: RoomId::from("other"),
            user_id: pid("b"),
        }))
        .await;
        assert_eq!(remotes(&c), vec!["b", "c"]);

        c.handle_message(ServerMessage::MemberLeft(MemberLeft {
            room_id: room.clone(),
            user_id: pid("b"),
        }))
        .await;
        assert_eq!(remotes(&c), vec!["c"]);
        assert_eq!(c.roster(), &[pid("c"), pid("a")]);
        assert_eq!(connector.log.entries(), vec!["b:close"]);
    }

    #[tokio::test]
    async fn two_clients_build_a_mesh() {
        let (mut a, a_channel, _) = coordinator("a");
        let (mut b, b_channel, _) = coordinator("b");

        let room = a.start_session().await;
        assert!(matches!(
            a_channel.take_sent().as_slice(),
            [ClientMessage::JoinRoom(JoinRequest { room_id, user_id })] if *room_id == room && *user_id == pid("a")
        ));
        a.handle_message(update(&room, "a", &[])).await;
        assert_eq!(a.roster(), &[pid("a")]);
        assert!(a.links().is_empty());

        b.join_session(Some(room.clone())).await;
        assert!(matches!(
            b_channel.take_sent().as_slice(),
            [ClientMessage::JoinRoom(JoinRequest { room_id, user_id })] if *room_id == room && *user_id == pid("b")
        ));
        let broadcast = update(&room, "b", &["a"]);
        a.handle_message(broadcast.clone()).await;
        b.handle_message(broadcast).await;

        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::Pending));
        assert_eq!(b.link_state(&pid("a")), Some(NegotiationState::Pending));
        assert_eq!(b.roster(), &[pid("a"), pid("b")]);
        assert_eq!(a.roster(), &[pid("a"), pid("b")]);

        // Only the newcomer offers
        a.start_negotiations().await;
        assert!(a_channel.take_sent().is_empty());
        b.start_negotiations().await;
        let offer = match b_channel.take_sent().as_slice() {
            [ClientMessage::Offer(offer)] => offer.clone(),
            other => panic!("Expected one offer, got {:?}", other),
        };
        assert_eq!(offer.to, pid("a"));
        assert_eq!(b.link_state(&pid("a")), Some(NegotiationState::OfferSent));

        a.handle_message(ServerMessage::Offer(offer)).await;
        let answer = match a_channel.take_sent().as_slice() {
            [ClientMessage::Answer(answer)] => answer.clone(),
            other => panic!("Expected one answer, got {:?}", other),
        };
        assert_eq!(answer.to, pid("b"));
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::AnswerSent));

        b.handle_message(ServerMessage::Answer(answer)).await;
        assert!(b.links().get(&pid("a")).is_some_and(|l| l.remote_description_set()));
    }

    #[tokio::test]
    async fn rejoining_peer_is_answered_on_a_fresh_link() {
        let room = RoomId::from("r1");
        let (mut a, a_channel, a_connector) = joined("a", &room, &[]).await;
        let (mut b, b_channel, _) = coordinator("b");
        b.join_session(Some(room.clone())).await;
        b_channel.take_sent();

        let broadcast = update(&room, "b", &["a"]);
        a.handle_message(broadcast.clone()).await;
        b.handle_message(broadcast.clone()).await;
        b.start_negotiations().await;
        for message in b_channel.take_sent() {
            if let ClientMessage::Offer(offer) = message {
                a.handle_message(ServerMessage::Offer(offer)).await;
            }
        }
        for message in a_channel.take_sent() {
            if let ClientMessage::Answer(answer) = message {
                b.handle_message(ServerMessage::Answer(answer)).await;
            }
        }
        let first = generation_of(&a, "b");
        a.handle_link_event(LinkEvent::Connected {
            remote: pid("b"),
            generation: first,
        })
        .await;
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::Connected));
        a_connector.log.clear();

        // The same join is delivered again: b rebuilds and offers anew
        a.handle_message(broadcast.clone()).await;
        b.handle_message(broadcast).await;
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::Connected));
        b.start_negotiations().await;
        let offer = match b_channel.take_sent().as_slice() {
            [ClientMessage::Offer(offer)] => offer.clone(),
            other => panic!("Expected one offer, got {:?}", other),
        };

        a.handle_message(ServerMessage::Offer(offer)).await;
        let answer = match a_channel.take_sent().as_slice() {
            [ClientMessage::Answer(answer)] => answer.clone(),
            other => panic!("Expected one answer, got {:?}", other),
        };
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::AnswerSent));
        assert_ne!(generation_of(&a, "b"), first);
        assert_eq!(a_connector.log.entries(), vec!["b:close", "b:offer-applied"]);
        assert_eq!(a.roster(), &[pid("a"), pid("b")]);

        b.handle_message(ServerMessage::Answer(answer)).await;
        assert!(b.links().get(&pid("a")).is_some_and(|l| l.remote_description_set()));
    }

    #[tokio::test]
    async fn candidates_before_answer_are_applied_after_it_in_order() {
        let room = RoomId::from("r1");
        let (mut b, _, connector) = joined("b", &room, &["a"]).await;
        b.start_negotiations().await;

        b.handle_message(candidate(&room, "a", "b", 1)).await;
        b.handle_message(candidate(&room, "a", "b", 2)).await;
        b.handle_message(ServerMessage::Answer(SessionDescription {
            room_id: room.clone(),
            from: pid("a"),
            to: pid("b"),
            sdp: "answer".to_string(),
        }))
        .await;
        b.handle_message(candidate(&room, "a", "b", 3)).await;

        assert_eq!(
            connector.log.entries(),
            vec![
                "a:offer",
                "a:answer-applied",
                "a:candidate:1",
                "a:candidate:2",
                "a:candidate:3",
            ]
        );
    }

    #[tokio::test]
    async fn offer_ahead_of_join_broadcast_creates_link() {
        let room = RoomId::from("r1");
        let (mut a, channel, _) = joined("a", &room, &[]).await;
        a.handle_message(ServerMessage::Offer(SessionDescription {
            room_id: room.clone(),
            from: pid("b"),
            to: pid("a"),
            sdp: "offer".to_string(),
        }))
        .await;
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::AnswerSent));
        assert_eq!(a.roster(), &[pid("a"), pid("b")]);
        assert_eq!(channel.sent().len(), 1);

        // The broadcast arriving afterwards keeps the negotiated link
        a.handle_message(update(&room, "b", &["a"])).await;
        assert_eq!(a.link_state(&pid("b")), Some(NegotiationState::AnswerSent));
        assert_eq!(a.roster(), &[pid("a"), pid("b")]);
    }

    #[tokio::test]
    async fn signaling_for_someone_else_is_dropped() {
        let room = RoomId::from("r1");
        let (mut a, channel, connector) = joined("a", &room, &["b"]).await;
        a.handle_message(ServerMessage::Offer(SessionDescription {
            room_id: room.clone(),
            from: pid("b"),
            to: pid("c"),
            sdp: "offer".to_string(),
        }))
        .await;
        a.handle_message(candidate(&RoomId::from("other"), "b", "a", 1)).await;
        assert!(channel.sent().is_empty());
        assert!(connector.log.entries().is_empty());
        assert_eq!(a.links().get(&pid("b")).map(|l| l.queued_candidates()), Some(0));
    }

    #[tokio::test]
    async fn unreachable_peer_keeps_a_failed_link() {
        let room = RoomId::from("r1");
        let (mut c, _, connector) = coordinator("a");
        connector.refuse(&pid("b"));
        c.join_session(Some(room.clone())).await;
        c.handle_message(update(&room, "a", &["b", "c"])).await;
        assert_eq!(remotes(&c), vec!["b", "c"]);
        assert_eq!(c.link_state(&pid("b")), Some(NegotiationState::Failed));
        assert_eq!(c.link_state(&pid("c")), Some(NegotiationState::Pending));
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_their_peer() {
        let room = RoomId::from("r1");
        let (mut c, channel, _) = joined("a", &room, &["b"]).await;
        let generation = generation_of(&c, "b");
        let local = IceCandidate {
            candidate: "candidate:9".to_string(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        };
        c.handle_link_event(LinkEvent::LocalCandidate {
            remote: pid("b"),
            generation,
            candidate: local.clone(),
        })
        .await;
        c.handle_link_event(LinkEvent::LocalCandidate {
            remote: pid("gone"),
            generation,
            candidate: local.clone(),
        })
        .await;
        assert_eq!(
            channel.sent(),
            vec![ClientMessage::IceCandidate(CandidateSignal {
                room_id: room,
                from: pid("a"),
                to: pid("b"),
                candidate: local,
            })]
        );
    }

    #[tokio::test]
    async fn connection_events_update_link_state() {
        let room = RoomId::from("r1");
        let (mut c, _, _) = joined("a", &room, &["b", "c"]).await;
        let (b, cg) = (generation_of(&c, "b"), generation_of(&c, "c"));
        c.handle_link_event(LinkEvent::Connected {
            remote: pid("b"),
            generation: b,
        })
        .await;
        c.handle_link_event(LinkEvent::Failed {
            remote: pid("c"),
            generation: cg,
        })
        .await;
        assert_eq!(c.link_state(&pid("b")), Some(NegotiationState::Connected));
        assert_eq!(c.link_state(&pid("c")), Some(NegotiationState::Failed));
        assert_eq!(remotes(&c), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn events_from_a_replaced_connection_are_ignored() {
        let room = RoomId::from("r1");
        let (mut c, channel, _) = joined("a", &room, &["b"]).await;
        let old = generation_of(&c, "b");

        c.handle_message(ServerMessage::MemberLeft(MemberLeft {
            room_id: room.clone(),
            user_id: pid("b"),
        }))
        .await;
        c.handle_message(update(&room, "b", &["a"])).await;
        let current = generation_of(&c, "b");
        assert_ne!(current, old);

        c.handle_link_event(LinkEvent::Connected {
            remote: pid("b"),
            generation: old,
        })
        .await;
        c.handle_link_event(LinkEvent::Failed {
            remote: pid("b"),
            generation: old,
        })
        .await;
        c.handle_link_event(LinkEvent::LocalCandidate {
            remote: pid("b"),
            generation: old,
            candidate: IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: None,
                sdp_mline_index: Some(0),
            },
        })
        .await;
        assert_eq!(c.link_state(&pid("b")), Some(NegotiationState::Pending));
        assert!(channel.sent().is_empty());

        c.handle_link_event(LinkEvent::Connected {
            remote: pid("b"),
            generation: current,
        })
        .await;
        assert_eq!(c.link_state(&pid("b")), Some(NegotiationState::Connected));
    }

    #[tokio::test]
    async fn stalled_negotiations_expire_but_keep_their_slot() {
        let room = RoomId::from("r1");
        let (c, channel, connector) = coordinator("a");
        let mut c = c.with_negotiation_timeout(Duration::from_secs(30));
        c.join_session(Some(room.clone())).await;
        c.handle_message(update(&room, "a", &["b", "c"])).await;
        let generation = generation_of(&c, "b");
        c.handle_link_event(LinkEvent::Connected {
            remote: pid("b"),
            generation,
        })
        .await;
        channel.take_sent();

        assert_eq!(c.expire_stalled(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(c.expire_stalled(later).await, 1);
        assert_eq!(c.link_state(&pid("b")), Some(NegotiationState::Connected));
        assert_eq!(c.link_state(&pid("c")), Some(NegotiationState::Failed));
        assert_eq!(remotes(&c), vec!["b", "c"]);
        assert!(connector.log.entries().contains(&"c:close".to_string()));
    }

    #[tokio::test]
    async fn zero_timeout_never_expires() {
        let room = RoomId::from("r1");
        let (c, _, _) = coordinator("a");
        let mut c = c.with_negotiation_timeout(Duration::ZERO);
        c.join_session(Some(room.clone())).await;
        c.handle_message(update(&room, "a", &["b"])).await;
        let much_later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(c.expire_stalled(much_later).await, 0);
    }

    #[tokio::test]
    async fn teardown_leaves_room() {
        let room = RoomId::from("r1");
        let (mut c, channel, _) = joined("a", &room, &["b"]).await;
        c.teardown().await;
        assert_eq!(c.state(), SessionState::Idle);
        assert!(matches!(
            channel.sent().as_slice(),
            [ClientMessage::LeaveRoom(LeaveRequest { room_id: Some(r), .. })] if *r == room
        ));
    }
}
