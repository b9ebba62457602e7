//! WebSocket protocol definitions
//!
//! Every frame is a JSON text message. Clients send
//! `{"event": .., "data": .., "ack": ..}`; the server answers with event
//! frames `{"event": .., "data": ..}` and ack frames `{"ack": .., "data": ..}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionId;
use crate::registry::RoomId;

/// Raw frame sent from client to gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    /// Operation name
    pub event: String,
    /// Operation payload, shape depends on the operation
    #[serde(default)]
    pub data: Value,
    /// Acknowledgment id; present when the client wants a response
    #[serde(default)]
    pub ack: Option<u64>,
}

/// The closed set of operations a client can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    NewMessage,
}

/// Dispatch table from wire event names to operations
const OPERATIONS: &[(&str, Operation)] = &[
    ("createRoom", Operation::CreateRoom),
    ("joinRoom", Operation::JoinRoom),
    ("leaveRoom", Operation::LeaveRoom),
    ("newMessage", Operation::NewMessage),
];

impl Operation {
    /// Look up an operation by its event name. Unknown names yield `None`.
    pub fn from_event(name: &str) -> Option<Self> {
        OPERATIONS
            .iter()
            .find(|(event, _)| *event == name)
            .map(|(_, op)| *op)
    }

    /// Wire name of this operation
    pub fn name(self) -> &'static str {
        OPERATIONS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(event, _)| *event)
            .unwrap_or("unknown")
    }

    /// Error code reported when processing fails for a non-validation reason
    pub fn failure_code(self) -> ErrorCode {
        match self {
            Operation::CreateRoom => ErrorCode::CreateRoomFailed,
            Operation::JoinRoom => ErrorCode::JoinRoomFailed,
            Operation::LeaveRoom => ErrorCode::LeaveRoomFailed,
            Operation::NewMessage => ErrorCode::SendMessageFailed,
        }
    }
}

/// A validated client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateRoom {
        /// Trimmed, non-empty name, or `None` for the default name
        room_name: Option<String>,
    },
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    NewMessage {
        room_id: RoomId,
        /// Untrimmed text; emptiness is checked after membership
        text: String,
    },
}

impl Request {
    /// Validate the payload shape of `op` and build the request
    pub fn parse(op: Operation, data: &Value) -> Result<Self, ErrorCode> {
        match op {
            Operation::CreateRoom => {
                let room_name = data
                    .get("roomName")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                Ok(Request::CreateRoom { room_name })
            }
            Operation::JoinRoom => room_id_of(data)
                .map(|room_id| Request::JoinRoom { room_id })
                .ok_or(ErrorCode::InvalidRoomId),
            Operation::LeaveRoom => room_id_of(data)
                .map(|room_id| Request::LeaveRoom { room_id })
                .ok_or(ErrorCode::NotInRoom),
            Operation::NewMessage => {
                let room_id = ["room", "roomId"]
                    .iter()
                    .find_map(|key| data.get(*key).and_then(non_blank_str))
                    .map(RoomId::from)
                    .ok_or(ErrorCode::InvalidRoomId)?;
                let text = ["text", "newMessage"]
                    .iter()
                    .find_map(|key| data.get(*key).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string();
                Ok(Request::NewMessage { room_id, text })
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Request::CreateRoom { .. } => Operation::CreateRoom,
            Request::JoinRoom { .. } => Operation::JoinRoom,
            Request::LeaveRoom { .. } => Operation::LeaveRoom,
            Request::NewMessage { .. } => Operation::NewMessage,
        }
    }
}

/// Accepts either a bare string or `{"roomId": ..}`
fn room_id_of(data: &Value) -> Option<RoomId> {
    non_blank_str(data)
        .or_else(|| data.get("roomId").and_then(non_blank_str))
        .map(RoomId::from)
}

fn non_blank_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Error codes returned in failure acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRoomId,
    RoomNotFound,
    NotInRoom,
    EmptyMessage,
    CreateRoomFailed,
    JoinRoomFailed,
    LeaveRoomFailed,
    SendMessageFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRoomId => "INVALID_ROOM_ID",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::EmptyMessage => "EMPTY_MESSAGE",
            ErrorCode::CreateRoomFailed => "CREATE_ROOM_FAILED",
            ErrorCode::JoinRoomFailed => "JOIN_ROOM_FAILED",
            ErrorCode::LeaveRoomFailed => "LEAVE_ROOM_FAILED",
            ErrorCode::SendMessageFailed => "SEND_MESSAGE_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as stored in room history and delivered to members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: RoomId,
    pub text: String,
    /// Verified user id of the sender
    pub sender_id: String,
    pub sender_name: String,
    /// Connection the message was sent from
    pub conn_id: ConnectionId,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

/// Events sent from gateway to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Sent once after the handshake was admitted
    Connected {
        conn_id: ConnectionId,
        user_id: String,
    },
    /// Sent to the creator of a room
    RoomCreated {
        room_id: RoomId,
        room_name: String,
    },
    /// Current member count of a room
    RoomUsers {
        room_id: RoomId,
        count: usize,
    },
    /// Snapshot delivered to a joining connection
    RoomJoined {
        room_id: RoomId,
        room_name: String,
        messages: Vec<ChatMessage>,
    },
    UserJoined {
        room_id: RoomId,
        conn_id: ConnectionId,
    },
    UserLeft {
        room_id: RoomId,
        conn_id: ConnectionId,
    },
    RoomClosed {
        room_id: RoomId,
    },
    GetLatestMessage(ChatMessage),
    /// Internal failure while handling a request of this connection
    ServerError { message: String },
    /// Validation failure of a request that asked for no acknowledgment
    RoomError { message: String },
}

impl ServerEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::RoomCreated { .. } => "roomCreated",
            ServerEvent::RoomUsers { .. } => "roomUsers",
            ServerEvent::RoomJoined { .. } => "roomJoined",
            ServerEvent::UserJoined { .. } => "userJoined",
            ServerEvent::UserLeft { .. } => "userLeft",
            ServerEvent::RoomClosed { .. } => "roomClosed",
            ServerEvent::GetLatestMessage(_) => "getLatestMessage",
            ServerEvent::ServerError { .. } => "serverError",
            ServerEvent::RoomError { .. } => "roomError",
        }
    }
}

/// Fields of a successful acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum AckBody {
    RoomCreated { room_id: RoomId, room_name: String },
    Room { room_id: RoomId },
    Message { message: ChatMessage },
}

/// One-shot response to a request
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Success(AckBody),
    Failure(ErrorCode),
}

#[derive(Serialize)]
#[serde(untagged)]
enum AckRepr<'a> {
    Success {
        ok: bool,
        #[serde(flatten)]
        body: &'a AckBody,
    },
    Failure {
        ok: bool,
        error: ErrorCode,
    },
}

impl Serialize for Ack {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Ack::Success(body) => AckRepr::Success { ok: true, body }.serialize(serializer),
            Ack::Failure(error) => AckRepr::Failure {
                ok: false,
                error: *error,
            }
            .serialize(serializer),
        }
    }
}

/// Anything written to a client socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(ServerEvent),
    Ack { ack: u64, data: Ack },
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        ServerFrame::Event(event)
    }
}
