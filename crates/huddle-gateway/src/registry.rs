//! Room registry and session-room index
//!
//! Owns room existence, membership and history, plus the reverse index from
//! connection to joined rooms. Both sides are updated in the same `&mut self`
//! call, so `conn ∈ room.members ⇔ room ∈ index[conn]` holds after every
//! operation, and a room exists exactly while it has members.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::auth::Identity;
use crate::connection::ConnectionId;
use crate::history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
use crate::protocol::ChatMessage;

/// Opaque, server-generated room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Random v4 UUID, neither sequential nor guessable
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room state
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// Identity of the connection that created the room
    pub creator: Identity,
    pub created_at: DateTime<Utc>,
    members: HashSet<ConnectionId>,
    history: MessageHistory,
}

impl Room {
    fn new(name: String, creator: Identity, history_capacity: usize) -> Self {
        Self {
            id: RoomId::generate(),
            name,
            creator,
            created_at: Utc::now(),
            members: HashSet::new(),
            history: MessageHistory::new(history_capacity),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.members.contains(&conn)
    }

    /// Members in id order
    pub fn members(&self) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self.members.iter().copied().collect();
        members.sort_unstable();
        members
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            name: self.name.clone(),
            messages: self.history.to_vec(),
        }
    }
}

/// Returned by room creation
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDescriptor {
    pub id: RoomId,
    pub name: String,
    /// Members right after creation (the creator)
    pub members: Vec<ConnectionId>,
}

/// What a joining connection gets to see
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub name: String,
    /// Retained history, oldest first
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    /// Members after the join, joiner included
    pub members: Vec<ConnectionId>,
    /// `false` when the connection was already a member
    pub newly_joined: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub conn: ConnectionId,
    /// Members after the leave
    pub remaining: Vec<ConnectionId>,
    /// The room became empty and was destroyed
    pub closed: bool,
}

/// Registry-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("Connection {conn} is not in room {room_id}")]
    NotInRoom { room_id: RoomId, conn: ConnectionId },
}

/// All live rooms plus the connection → rooms index
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    index: HashMap<ConnectionId, HashSet<RoomId>>,
    history_capacity: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl RoomRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            index: HashMap::new(),
            history_capacity,
        }
    }

    /// Create a room with a fresh id and make `conn` its first member.
    ///
    /// Creation and the creator's join are one step, so no empty room is
    /// ever observable.
    pub fn create_room(
        &mut self,
        name: impl Into<String>,
        creator: Identity,
        conn: ConnectionId,
    ) -> RoomDescriptor {
        let mut room = Room::new(name.into(), creator, self.history_capacity);
        while self.rooms.contains_key(&room.id) {
            room.id = RoomId::generate();
        }
        room.members.insert(conn);

        let descriptor = RoomDescriptor {
            id: room.id.clone(),
            name: room.name.clone(),
            members: room.members(),
        };
        self.index.entry(conn).or_default().insert(room.id.clone());
        self.rooms.insert(room.id.clone(), room);
        descriptor
    }

    /// Add `conn` to a room. Joining twice is a no-op that still returns the snapshot.
    pub fn join(&mut self, room_id: &RoomId, conn: ConnectionId) -> Result<JoinOutcome, RegistryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.clone()))?;

        let newly_joined = room.members.insert(conn);
        self.index.entry(conn).or_default().insert(room_id.clone());

        Ok(JoinOutcome {
            snapshot: room.snapshot(),
            members: room.members(),
            newly_joined,
        })
    }

    /// Remove `conn` from a room, destroying the room if it became empty
    pub fn leave(&mut self, room_id: &RoomId, conn: ConnectionId) -> Result<LeaveOutcome, RegistryError> {
        let not_in_room = || RegistryError::NotInRoom {
            room_id: room_id.clone(),
            conn,
        };
        let room = self.rooms.get_mut(room_id).ok_or_else(not_in_room)?;
        if !room.members.remove(&conn) {
            return Err(not_in_room());
        }

        let remaining = room.members();
        let closed = remaining.is_empty();
        if closed {
            self.rooms.remove(room_id);
        }

        if let Some(rooms) = self.index.get_mut(&conn) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.index.remove(&conn);
            }
        }

        Ok(LeaveOutcome {
            room_id: room_id.clone(),
            conn,
            remaining,
            closed,
        })
    }

    /// Append a message sent by `message.conn_id`, returning the members to deliver it to
    pub fn append_message(&mut self, message: ChatMessage) -> Result<Vec<ConnectionId>, RegistryError> {
        let room = self
            .rooms
            .get_mut(&message.room_id)
            .filter(|room| room.is_member(message.conn_id))
            .ok_or_else(|| RegistryError::NotInRoom {
                room_id: message.room_id.clone(),
                conn: message.conn_id,
            })?;

        room.history.push(message);
        Ok(room.members())
    }

    /// Leave every room `conn` is indexed in and drop its index entry.
    ///
    /// Only the connection's own rooms are visited, each through [`leave`].
    /// Calling this again for the same connection finds no entry and changes
    /// nothing.
    ///
    /// [`leave`]: RoomRegistry::leave
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<LeaveOutcome> {
        let mut rooms: Vec<RoomId> = match self.index.get(&conn) {
            Some(rooms) => rooms.iter().cloned().collect(),
            None => return Vec::new(),
        };
        rooms.sort();

        let outcomes = rooms
            .iter()
            .filter_map(|room_id| self.leave(room_id, conn).ok())
            .collect();
        self.index.remove(&conn);
        outcomes
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn is_member(&self, room_id: &RoomId, conn: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.is_member(conn))
    }

    /// Rooms `conn` has joined, in id order
    #[cfg(test)]
    pub(crate) fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .index
            .get(&conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[cfg(test)]
    pub(crate) fn list_rooms(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }
}
