//! Huddle Gateway - real-time WebSocket room broker
//!
//! Clients authenticate once during the WebSocket handshake, then create,
//! join and leave chat rooms and exchange messages. Each room keeps a short
//! message history for late joiners and disappears with its last member.
//!
//! All room state is owned by a single broker task; connection tasks talk to
//! it over channels, so no locks guard the registry.

mod auth;
mod broker;
mod connection;
mod gateway;
mod history;
mod protocol;
mod registry;
mod router;

pub use auth::{
    extract_credential, strip_bearer, unauthorized, AuthError, AuthInterceptor, Claims, Identity,
    IdentityVerifier, JwtVerifier, StaticTokenVerifier,
};
pub use broker::{
    Broker, BrokerError, BrokerHandle, BrokerSettings, BrokerStats, HandlerError, HandlerResult,
    DEFAULT_ROOM_NAME,
};
pub use connection::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionPool, Echo, OUTBOUND_QUEUE_CAPACITY,
};
pub use gateway::{Gateway, GatewayConfig, GatewayError};
pub use history::{MessageHistory, DEFAULT_HISTORY_CAPACITY};
pub use protocol::{
    Ack, AckBody, ChatMessage, ClientFrame, ErrorCode, Operation, Request, ServerEvent,
    ServerFrame,
};
pub use registry::{
    JoinOutcome, LeaveOutcome, RegistryError, Room, RoomDescriptor, RoomId, RoomRegistry,
    RoomSnapshot,
};
pub use router::EventRouter;
