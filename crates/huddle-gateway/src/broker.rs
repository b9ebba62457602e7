//! Broker task
//!
//! One task owns the room registry and the connection pool. Connection tasks
//! never touch shared state directly; they send [`Command`]s through a
//! [`BrokerHandle`] and wait for the reply. Every mutation therefore runs to
//! completion before the next command is looked at, and broadcasts are
//! queued from the post-mutation state.

use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionPool, Echo};
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::protocol::{AckBody, ChatMessage, ErrorCode, Request, ServerEvent};
use crate::registry::{LeaveOutcome, RegistryError, RoomId, RoomRegistry};

/// Room name used when `createRoom` carries none
pub const DEFAULT_ROOM_NAME: &str = "New Room";

/// Broker tuning
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Messages retained per room
    pub history_capacity: usize,
    pub default_room_name: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_room_name: DEFAULT_ROOM_NAME.to_string(),
        }
    }
}

/// Why a request did not succeed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Validation failure, nothing was changed
    #[error("Rejected: {0}")]
    Rejected(ErrorCode),
    /// Unexpected failure while handling the request
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for HandlerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::RoomNotFound(_) => HandlerError::Rejected(ErrorCode::RoomNotFound),
            RegistryError::NotInRoom { .. } => HandlerError::Rejected(ErrorCode::NotInRoom),
        }
    }
}

pub type HandlerResult = Result<AckBody, HandlerError>;

/// Broker-related errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker is not running")]
    Closed,
}

/// Counters reported by [`BrokerHandle::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub rooms: usize,
    pub connections: usize,
}

/// Commands processed by the broker task
#[derive(Debug)]
pub enum Command {
    /// Admit a connection
    Register(ConnectionHandle),
    Request {
        conn: ConnectionId,
        request: Request,
        reply: oneshot::Sender<HandlerResult>,
    },
    /// Run disconnect cleanup, then signal `done`
    Disconnect {
        conn: ConnectionId,
        done: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
}

/// Cloneable sender side of the broker
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    pub(crate) sender: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.sender.send(command).map_err(|_| BrokerError::Closed)
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<(), BrokerError> {
        self.send(Command::Register(handle))
    }

    /// Submit a request and wait for its result
    pub async fn request(
        &self,
        conn: ConnectionId,
        request: Request,
    ) -> Result<HandlerResult, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Request {
            conn,
            request,
            reply,
        })?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Run disconnect cleanup for `conn` and wait until it has been applied
    pub async fn disconnect(&self, conn: ConnectionId) -> Result<(), BrokerError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Disconnect { conn, done })?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Owner of all room and connection state
pub struct Broker {
    registry: RoomRegistry,
    pool: ConnectionPool,
    settings: BrokerSettings,
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> (Self, BrokerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let broker = Self {
            registry: RoomRegistry::new(settings.history_capacity),
            pool: ConnectionPool::new(),
            settings,
            receiver,
        };
        (broker, BrokerHandle { sender })
    }

    /// Start the broker on the current runtime
    pub fn spawn(settings: BrokerSettings) -> BrokerHandle {
        let (broker, handle) = Self::new(settings);
        tokio::spawn(broker.run());
        handle
    }

    /// Process commands until every handle has been dropped
    pub async fn run(mut self) {
        info!(
            "Broker started (history capacity {})",
            self.settings.history_capacity
        );
        while let Some(command) = self.receiver.recv().await {
            self.handle_command(command);
        }
        info!(
            "Broker stopped with {} rooms and {} connections",
            self.registry.room_count(),
            self.pool.count()
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register(handle) => {
                debug!(
                    "Registered connection {} for user {}",
                    handle.id, handle.identity.user_id
                );
                self.pool.add(handle);
            }
            Command::Request {
                conn,
                request,
                reply,
            } => {
                let op = request.operation();
                let result = self.contained(|broker| broker.handle_request(conn, request));
                match &result {
                    Ok(_) => debug!("{} from connection {} succeeded", op.name(), conn),
                    Err(HandlerError::Rejected(code)) => {
                        debug!("{} from connection {} rejected: {}", op.name(), conn, code)
                    }
                    Err(HandlerError::Internal(msg)) => {
                        error!("{} from connection {} failed: {}", op.name(), conn, msg)
                    }
                }
                // The requester may have gone away while waiting
                let _ = reply.send(result);
            }
            Command::Disconnect { conn, done } => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.disconnect(conn))) {
                    error!(
                        "Cleanup of connection {} panicked: {}",
                        conn,
                        panic_message(&panic)
                    );
                }
                let _ = done.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Run a handler, turning a panic into an internal failure
    fn contained<F>(&mut self, handler: F) -> HandlerResult
    where
        F: FnOnce(&mut Self) -> HandlerResult,
    {
        match catch_unwind(AssertUnwindSafe(|| handler(self))) {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Internal(format!(
                "handler panicked: {}",
                panic_message(&panic)
            ))),
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            rooms: self.registry.room_count(),
            connections: self.pool.count(),
        }
    }

    fn handle_request(&mut self, conn: ConnectionId, request: Request) -> HandlerResult {
        if !self.pool.contains(conn) {
            return Err(HandlerError::Internal(format!(
                "connection {} is not registered",
                conn
            )));
        }

        match request {
            Request::CreateRoom { room_name } => self.create_room(conn, room_name),
            Request::JoinRoom { room_id } => self.join_room(conn, room_id),
            Request::LeaveRoom { room_id } => self.leave_room(conn, room_id),
            Request::NewMessage { room_id, text } => self.new_message(conn, room_id, text),
        }
    }

    fn create_room(&mut self, conn: ConnectionId, room_name: Option<String>) -> HandlerResult {
        let creator = self
            .pool
            .get(conn)
            .map(|handle| handle.identity.clone())
            .ok_or_else(|| HandlerError::Internal(format!("connection {} vanished", conn)))?;
        let name = room_name.unwrap_or_else(|| self.settings.default_room_name.clone());

        let room = self.registry.create_room(name, creator, conn);
        info!("Room {} ({}) created by connection {}", room.id, room.name, conn);

        let _ = self.pool.send_to(
            conn,
            ServerEvent::RoomCreated {
                room_id: room.id.clone(),
                room_name: room.name.clone(),
            },
        );
        self.pool.broadcast(
            &room.members,
            &ServerEvent::RoomUsers {
                room_id: room.id.clone(),
                count: room.members.len(),
            },
            conn,
            Echo::Include,
        );

        Ok(AckBody::RoomCreated {
            room_id: room.id,
            room_name: room.name,
        })
    }

    fn join_room(&mut self, conn: ConnectionId, room_id: RoomId) -> HandlerResult {
        let outcome = self.registry.join(&room_id, conn)?;
        let snapshot = outcome.snapshot;

        let _ = self.pool.send_to(
            conn,
            ServerEvent::RoomJoined {
                room_id: snapshot.room_id.clone(),
                room_name: snapshot.name,
                messages: snapshot.messages,
            },
        );

        if outcome.newly_joined {
            info!("Connection {} joined room {}", conn, room_id);
            self.pool.broadcast(
                &outcome.members,
                &ServerEvent::UserJoined {
                    room_id: room_id.clone(),
                    conn_id: conn,
                },
                conn,
                Echo::ExcludeOrigin,
            );
            self.pool.broadcast(
                &outcome.members,
                &ServerEvent::RoomUsers {
                    room_id: room_id.clone(),
                    count: outcome.members.len(),
                },
                conn,
                Echo::Include,
            );
        }

        Ok(AckBody::Room { room_id })
    }

    fn leave_room(&mut self, conn: ConnectionId, room_id: RoomId) -> HandlerResult {
        let outcome = self.registry.leave(&room_id, conn)?;
        info!("Connection {} left room {}", conn, room_id);
        self.announce_leave(&outcome);
        Ok(AckBody::Room { room_id })
    }

    fn new_message(&mut self, conn: ConnectionId, room_id: RoomId, text: String) -> HandlerResult {
        if !self.registry.is_member(&room_id, conn) {
            return Err(HandlerError::Rejected(ErrorCode::NotInRoom));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(HandlerError::Rejected(ErrorCode::EmptyMessage));
        }

        let sender = self
            .pool
            .get(conn)
            .map(|handle| handle.identity.clone())
            .ok_or_else(|| HandlerError::Internal(format!("connection {} vanished", conn)))?;

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id,
            text: text.to_string(),
            sender_id: sender.user_id,
            sender_name: sender.display_name,
            conn_id: conn,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let members = self.registry.append_message(message.clone())?;

        self.pool.broadcast(
            &members,
            &ServerEvent::GetLatestMessage(message.clone()),
            conn,
            Echo::Include,
        );

        Ok(AckBody::Message { message })
    }

    /// Broadcasts shared by `leaveRoom` and disconnect cleanup
    fn announce_leave(&self, outcome: &LeaveOutcome) {
        if outcome.closed {
            info!("Room {} closed", outcome.room_id);
            let _ = self.pool.send_to(
                outcome.conn,
                ServerEvent::RoomClosed {
                    room_id: outcome.room_id.clone(),
                },
            );
            return;
        }

        self.pool.broadcast(
            &outcome.remaining,
            &ServerEvent::UserLeft {
                room_id: outcome.room_id.clone(),
                conn_id: outcome.conn,
            },
            outcome.conn,
            Echo::Include,
        );
        self.pool.broadcast(
            &outcome.remaining,
            &ServerEvent::RoomUsers {
                room_id: outcome.room_id.clone(),
                count: outcome.remaining.len(),
            },
            outcome.conn,
            Echo::Include,
        );
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let outcomes = self.registry.disconnect(conn);
        for outcome in &outcomes {
            self.announce_leave(outcome);
        }

        match self.pool.remove(conn) {
            Some(handle) => info!(
                "Connection {} ({}) cleaned up, left {} rooms",
                conn,
                handle.addr,
                outcomes.len()
            ),
            None => warn!("Disconnect for unknown connection {}", conn),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::protocol::ServerFrame;
    use std::net::SocketAddr;

    struct Client {
        id: ConnectionId,
        rx: mpsc::Receiver<ServerFrame>,
    }

    impl Client {
        fn events(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let ServerFrame::Event(event) = frame {
                    events.push(event);
                }
            }
            events
        }

        fn event_names(&mut self) -> Vec<&'static str> {
            self.events().iter().map(ServerEvent::name).collect()
        }
    }

    async fn connect(broker: &BrokerHandle, user: &str) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let id = ConnectionId::next();
        broker
            .register(ConnectionHandle::new(id, Identity::new(user, user), addr, tx))
            .unwrap();
        Client { id, rx }
    }

    async fn create(broker: &BrokerHandle, client: &Client) -> RoomId {
        match broker
            .request(client.id, Request::CreateRoom { room_name: None })
            .await
            .unwrap()
        {
            Ok(AckBody::RoomCreated { room_id, .. }) => room_id,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    async fn join(broker: &BrokerHandle, client: &Client, room_id: &RoomId) -> HandlerResult {
        broker
            .request(
                client.id,
                Request::JoinRoom {
                    room_id: room_id.clone(),
                },
            )
            .await
            .unwrap()
    }

    async fn send(
        broker: &BrokerHandle,
        client: &Client,
        room_id: &RoomId,
        text: &str,
    ) -> HandlerResult {
        broker
            .request(
                client.id,
                Request::NewMessage {
                    room_id: room_id.clone(),
                    text: text.to_string(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_room_joins_creator() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut a = connect(&broker, "a").await;

        let room = create(&broker, &a).await;
        let events = a.events();
        assert_eq!(
            events,
            vec![
                ServerEvent::RoomCreated {
                    room_id: room.clone(),
                    room_name: DEFAULT_ROOM_NAME.to_string()
                },
                ServerEvent::RoomUsers {
                    room_id: room,
                    count: 1
                },
            ]
        );
        assert_eq!(
            broker.stats().await.unwrap(),
            BrokerStats {
                rooms: 1,
                connections: 1
            }
        );
    }

    #[tokio::test]
    async fn test_join_broadcast_order() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut a = connect(&broker, "a").await;
        let mut b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;
        a.events();

        assert_eq!(
            join(&broker, &b, &room).await,
            Ok(AckBody::Room {
                room_id: room.clone()
            })
        );
        assert_eq!(b.event_names(), vec!["roomJoined", "roomUsers"]);
        assert_eq!(
            a.events(),
            vec![
                ServerEvent::UserJoined {
                    room_id: room.clone(),
                    conn_id: b.id
                },
                ServerEvent::RoomUsers {
                    room_id: room.clone(),
                    count: 2
                },
            ]
        );

        // Joining again only re-sends the snapshot
        assert!(join(&broker, &b, &room).await.is_ok());
        assert_eq!(b.event_names(), vec!["roomJoined"]);
        assert!(a.events().is_empty());
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut b = connect(&broker, "b").await;

        assert_eq!(
            join(&broker, &b, &RoomId::from("no-such-room")).await,
            Err(HandlerError::Rejected(ErrorCode::RoomNotFound))
        );
        assert!(b.events().is_empty());
        assert_eq!(broker.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_message_validation_order() {
        let broker = Broker::spawn(BrokerSettings::default());
        let a = connect(&broker, "a").await;
        let b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;

        assert_eq!(
            send(&broker, &b, &room, "   ").await,
            Err(HandlerError::Rejected(ErrorCode::NotInRoom))
        );
        assert_eq!(
            send(&broker, &a, &room, "   ").await,
            Err(HandlerError::Rejected(ErrorCode::EmptyMessage))
        );
        assert_eq!(
            send(&broker, &a, &RoomId::from("gone"), "hi").await,
            Err(HandlerError::Rejected(ErrorCode::NotInRoom))
        );
    }

    #[tokio::test]
    async fn test_message_echoes_to_every_member() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut a = connect(&broker, "a").await;
        let mut b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;
        join(&broker, &b, &room).await.unwrap();
        a.events();
        b.events();

        let message = match send(&broker, &b, &room, "  hi ").await {
            Ok(AckBody::Message { message }) => message,
            other => panic!("unexpected result: {:?}", other),
        };
        assert_eq!(message.text, "hi");
        assert_eq!(message.sender_id, "b");
        assert_eq!(message.conn_id, b.id);

        let expected = vec![ServerEvent::GetLatestMessage(message)];
        assert_eq!(a.events(), expected);
        assert_eq!(b.events(), expected);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_history() {
        let settings = BrokerSettings {
            history_capacity: 2,
            ..BrokerSettings::default()
        };
        let broker = Broker::spawn(settings);
        let a = connect(&broker, "a").await;
        let mut b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;
        for text in ["one", "two", "three"] {
            send(&broker, &a, &room, text).await.unwrap();
        }

        join(&broker, &b, &room).await.unwrap();
        match b.events().first() {
            Some(ServerEvent::RoomJoined { messages, .. }) => {
                let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["two", "three"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut a = connect(&broker, "a").await;
        let b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;
        a.events();

        let leave = Request::LeaveRoom {
            room_id: room.clone(),
        };
        assert!(broker.request(a.id, leave.clone()).await.unwrap().is_ok());
        assert_eq!(
            a.events(),
            vec![ServerEvent::RoomClosed {
                room_id: room.clone()
            }]
        );
        assert_eq!(
            broker.request(a.id, leave).await.unwrap(),
            Err(HandlerError::Rejected(ErrorCode::NotInRoom))
        );
        assert_eq!(
            join(&broker, &b, &room).await,
            Err(HandlerError::Rejected(ErrorCode::RoomNotFound))
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_members() {
        let broker = Broker::spawn(BrokerSettings::default());
        let mut a = connect(&broker, "a").await;
        let b = connect(&broker, "b").await;
        let room = create(&broker, &a).await;
        join(&broker, &b, &room).await.unwrap();
        a.events();

        broker.disconnect(b.id).await.unwrap();
        assert_eq!(
            a.events(),
            vec![
                ServerEvent::UserLeft {
                    room_id: room.clone(),
                    conn_id: b.id
                },
                ServerEvent::RoomUsers {
                    room_id: room.clone(),
                    count: 1
                },
            ]
        );

        // Second cleanup changes nothing
        broker.disconnect(b.id).await.unwrap();
        assert!(a.events().is_empty());
        assert_eq!(
            broker.stats().await.unwrap(),
            BrokerStats {
                rooms: 1,
                connections: 1
            }
        );
    }

    #[tokio::test]
    async fn test_terminated_connection_is_refused() {
        let broker = Broker::spawn(BrokerSettings::default());
        let a = connect(&broker, "a").await;
        broker.disconnect(a.id).await.unwrap();

        let result = broker
            .request(a.id, Request::CreateRoom { room_name: None })
            .await
            .unwrap();
        assert!(matches!(result, Err(HandlerError::Internal(_))));
        assert_eq!(broker.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_broker() {
        let (broker, handle) = Broker::new(BrokerSettings::default());
        drop(broker);

        assert!(handle.is_closed());
        assert_eq!(handle.stats().await, Err(BrokerError::Closed));
        assert_eq!(
            handle
                .request(ConnectionId::next(), Request::CreateRoom { room_name: None })
                .await,
            Err(BrokerError::Closed)
        );
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let (mut broker, _handle) = Broker::new(BrokerSettings::default());

        let result = broker.contained(|_| panic!("registry exploded"));
        assert!(
            matches!(&result, Err(HandlerError::Internal(msg)) if msg.contains("registry exploded"))
        );

        // The same broker keeps serving requests afterwards
        let (tx, _rx) = mpsc::channel(8);
        let conn = ConnectionId::next();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        broker.handle_command(Command::Register(ConnectionHandle::new(
            conn,
            Identity::new("a", "A"),
            addr,
            tx,
        )));

        let (reply, mut reply_rx) = oneshot::channel();
        broker.handle_command(Command::Request {
            conn,
            request: Request::CreateRoom { room_name: None },
            reply,
        });
        assert!(matches!(
            reply_rx.try_recv(),
            Ok(Ok(AckBody::RoomCreated { .. }))
        ));
        assert_eq!(broker.stats().rooms, 1);
    }
}
