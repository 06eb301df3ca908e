//! In-memory peer connections for tests

use super::peer_connection::{PeerConnection, PeerConnector};
use super::signaling::IceCandidate;
use super::WebRTCError;
use crate::rooms::ParticipantId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared record of every call made on fake connections, as `"<remote>:<call>"`
#[derive(Clone, Default)]
pub struct FakeLog(Arc<Mutex<Vec<String>>>);

impl FakeLog {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

pub struct FakeConnection {
    remote: ParticipantId,
    log: FakeLog,
    failing: bool,
}

impl FakeConnection {
    pub fn new(remote: ParticipantId, log: FakeLog) -> Self {
        Self {
            remote,
            log,
            failing: false,
        }
    }

    /// Every negotiation call fails
    pub fn failing(remote: ParticipantId, log: FakeLog) -> Self {
        Self {
            remote,
            log,
            failing: true,
        }
    }

    fn record(&self, call: &str) -> Result<(), WebRTCError> {
        if self.failing {
            return Err(WebRTCError::SdpError(format!("{} refused", call)));
        }
        self.log.push(format!("{}:{}", self.remote, call));
        Ok(())
    }
}

impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<String, WebRTCError> {
        self.record("offer")?;
        Ok(format!("offer-from-{}", self.remote))
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String, WebRTCError> {
        self.record("offer-applied")?;
        Ok(format!("answer-to-{}", self.remote))
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<(), WebRTCError> {
        self.record("answer-applied")
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        self.record(&candidate.candidate)
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.log.push(format!("{}:close", self.remote));
        Ok(())
    }
}

/// Connector handing out `FakeConnection`s that all write to one log
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub log: FakeLog,
    unreachable: Arc<Mutex<HashSet<ParticipantId>>>,
}

impl FakeConnector {
    /// Make `connect` fail for `remote`
    pub fn refuse(&self, remote: &ParticipantId) {
        self.unreachable.lock().insert(remote.clone());
    }
}

impl PeerConnector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(
        &self,
        remote: &ParticipantId,
        _generation: u64,
    ) -> Result<FakeConnection, WebRTCError> {
        if self.unreachable.lock().contains(remote) {
            return Err(WebRTCError::ConnectionFailed(format!("{} unreachable", remote)));
        }
        Ok(FakeConnection::new(remote.clone(), self.log.clone()))
    }
}
