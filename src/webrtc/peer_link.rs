//! Per-peer link lifecycle
//!
//! A `PeerLink` owns one connection to a remote participant and drives its
//! offer/answer exchange. Remote ICE candidates that arrive before the remote
//! description is applied are queued and replayed, in arrival order, right after it is.

use super::peer_connection::PeerConnection;
use super::signaling::IceCandidate;
use crate::rooms::ParticipantId;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Negotiation progress of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Created, nothing exchanged yet
    Pending,
    /// Offer sent, waiting for the answer (initiator side)
    OfferSent,
    /// Offer received and answered (responder side)
    AnswerSent,
    /// Media path established
    Connected,
    /// Connection could not be created, negotiation failed or timed out
    Failed,
}

/// One participant's handle to a direct connection with another participant
pub struct PeerLink<C: PeerConnection> {
    remote: ParticipantId,
    /// Identifies this link's connection among successive links to `remote`
    generation: u64,
    connection: Option<C>,
    state: NegotiationState,
    initiator: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    created_at: Instant,
}

impl<C: PeerConnection> PeerLink<C> {
    /// Create a Pending link around an established connection
    pub fn new(remote: ParticipantId, generation: u64, connection: C, initiator: bool) -> Self {
        Self {
            remote,
            generation,
            connection: Some(connection),
            state: NegotiationState::Pending,
            initiator,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            created_at: Instant::now(),
        }
    }

    /// Placeholder for a peer whose connection could not be created
    pub fn failed(remote: ParticipantId, generation: u64, initiator: bool) -> Self {
        Self {
            remote,
            generation,
            connection: None,
            state: NegotiationState::Failed,
            initiator,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            created_at: Instant::now(),
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Start negotiation on a Pending initiator link. Returns the offer SDP to send.
    pub async fn initiate(&mut self) -> Option<String> {
        if !self.initiator || self.state != NegotiationState::Pending {
            return None;
        }
        let connection = self.connection.as_ref()?;
        match connection.create_offer().await {
            Ok(sdp) => {
                self.state = NegotiationState::OfferSent;
                debug!("Offer created for {}", self.remote);
                Some(sdp)
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", self.remote, e);
                self.fail().await;
                None
            }
        }
    }

    /// Answer a remote offer on a Pending link. Returns the answer SDP to send.
    pub async fn answer(&mut self, offer_sdp: &str) -> Option<String> {
        if self.state != NegotiationState::Pending {
            debug!("Ignoring offer from {} in state {:?}", self.remote, self.state);
            return None;
        }
        let connection = self.connection.as_ref()?;
        match connection.accept_offer(offer_sdp).await {
            Ok(answer_sdp) => {
                self.state = NegotiationState::AnswerSent;
                self.remote_description_set = true;
                self.flush_candidates().await;
                Some(answer_sdp)
            }
            Err(e) => {
                warn!("Failed to answer offer from {}: {}", self.remote, e);
                self.fail().await;
                None
            }
        }
    }

    /// Apply the remote answer to an offer this link sent
    pub async fn accept_answer(&mut self, answer_sdp: &str) {
        if self.state != NegotiationState::OfferSent || self.remote_description_set {
            debug!("Ignoring answer from {} in state {:?}", self.remote, self.state);
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        match connection.accept_answer(answer_sdp).await {
            Ok(()) => {
                self.remote_description_set = true;
                self.flush_candidates().await;
            }
            Err(e) => {
                warn!("Failed to apply answer from {}: {}", self.remote, e);
                self.fail().await;
            }
        }
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            return;
        }
        if let Some(connection) = self.connection.as_ref() {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                warn!("ICE candidate from {} rejected: {}", self.remote, e);
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            self.pending_candidates.clear();
            return;
        };
        if !self.pending_candidates.is_empty() {
            debug!(
                "Applying {} queued ICE candidates from {}",
                self.pending_candidates.len(),
                self.remote
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                warn!("Queued ICE candidate from {} rejected: {}", self.remote, e);
            }
        }
    }

    pub fn mark_connected(&mut self) {
        if self.connection.is_some() {
            self.state = NegotiationState::Connected;
        }
    }

    /// Close the connection and mark the link Failed
    pub async fn fail(&mut self) {
        self.close().await;
        self.state = NegotiationState::Failed;
    }

    /// Release the underlying connection. Calling this again is a no-op.
    pub async fn close(&mut self) {
        self.pending_candidates.clear();
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!("Closing link to {}: {}", self.remote, e);
            }
        }
    }
}

/// Arena of links keyed by remote participant
pub struct PeerLinks<C: PeerConnection> {
    links: HashMap<ParticipantId, PeerLink<C>>,
}

impl<C: PeerConnection> Default for PeerLinks<C> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
        }
    }
}

impl<C: PeerConnection> PeerLinks<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, remote: &ParticipantId) -> bool {
        self.links.contains_key(remote)
    }

    pub fn get(&self, remote: &ParticipantId) -> Option<&PeerLink<C>> {
        self.links.get(remote)
    }

    pub fn get_mut(&mut self, remote: &ParticipantId) -> Option<&mut PeerLink<C>> {
        self.links.get_mut(remote)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &ParticipantId> {
        self.links.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerLink<C>> {
        self.links.values_mut()
    }

    /// Insert a link unless one already exists for that participant.
    /// Returns false (dropping `link`) when the participant already had one.
    pub fn insert_if_absent(&mut self, link: PeerLink<C>) -> bool {
        if self.links.contains_key(&link.remote) {
            return false;
        }
        self.links.insert(link.remote.clone(), link);
        true
    }

    pub fn remove(&mut self, remote: &ParticipantId) -> Option<PeerLink<C>> {
        self.links.remove(remote)
    }

    /// Swap in a whole new arena, returning the previous one
    pub fn replace(&mut self, next: PeerLinks<C>) -> PeerLinks<C> {
        std::mem::replace(self, next)
    }

    /// Close every link and empty the arena
    pub async fn close_all(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close().await;
        }
    }
}
