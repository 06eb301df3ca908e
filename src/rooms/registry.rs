//! Relay-side roster of every room

use super::{ParticipantId, RoomId};
use std::collections::BTreeMap;

/// Result of adding a participant to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members present before the join, excluding the joiner
    pub existing: Vec<ParticipantId>,
    /// Whether the room came into existence with this join
    pub room_created: bool,
    /// Whether the participant was already a member
    pub already_member: bool,
}

/// Result of removing a participant from a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Members still in the room
    pub remaining: Vec<ParticipantId>,
    /// Whether the room disappeared because it became empty
    pub room_removed: bool,
}

/// Rooms and their members, in join order. Empty rooms are removed.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<RoomId, Vec<ParticipantId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, room_id: &RoomId, user_id: &ParticipantId) -> JoinOutcome {
        let room_created = !self.rooms.contains_key(room_id);
        let members = self.rooms.entry(room_id.clone()).or_default();
        let existing: Vec<ParticipantId> = members
            .iter()
            .filter(|member| *member != user_id)
            .cloned()
            .collect();
        let already_member = existing.len() != members.len();
        if !already_member {
            members.push(user_id.clone());
        }
        JoinOutcome {
            existing,
            room_created,
            already_member,
        }
    }

    /// Remove `user_id` from `room_id`. Returns None when it was not a member.
    pub fn leave(&mut self, room_id: &RoomId, user_id: &ParticipantId) -> Option<LeaveOutcome> {
        let members = self.rooms.get_mut(room_id)?;
        let position = members.iter().position(|member| member == user_id)?;
        members.remove(position);

        let remaining = members.clone();
        let room_removed = remaining.is_empty();
        if room_removed {
            self.rooms.remove(room_id);
        }
        Some(LeaveOutcome {
            remaining,
            room_removed,
        })
    }

    /// Remove `user_id` from every room it is in
    pub fn leave_all(&mut self, user_id: &ParticipantId) -> Vec<(RoomId, LeaveOutcome)> {
        let joined: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(user_id))
            .map(|(room_id, _)| room_id.clone())
            .collect();
        joined
            .into_iter()
            .filter_map(|room_id| {
                let outcome = self.leave(&room_id, user_id)?;
                Some((room_id, outcome))
            })
            .collect()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    pub fn members(&self, room_id: &RoomId) -> &[ParticipantId] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_member(&self, room_id: &RoomId, user_id: &ParticipantId) -> bool {
        self.members(room_id).contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
