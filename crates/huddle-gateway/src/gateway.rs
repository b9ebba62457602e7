//! Gateway main structure
//!
//! Accepts TCP connections, authenticates the WebSocket handshake and runs
//! one task per admitted connection. Room state lives in the broker task.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::{error_response, unauthorized, AuthInterceptor, Identity, IdentityVerifier};
use crate::broker::{Broker, BrokerError, BrokerHandle, BrokerSettings};
use crate::connection::{ConnectionHandle, ConnectionId, OUTBOUND_QUEUE_CAPACITY};
use crate::protocol::{ServerEvent, ServerFrame};
use crate::router::EventRouter;

/// Time allowed for the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat intervals a connection may stay silent before it is dropped
const MISSED_HEARTBEATS: u32 = 3;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address (e.g., "127.0.0.1:3001")
    pub bind: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    pub broker: BrokerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            broker: BrokerSettings::default(),
        }
    }
}

/// The WebSocket room gateway
#[derive(Debug, Clone)]
pub struct Gateway {
    config: GatewayConfig,
    auth: AuthInterceptor,
    broker: BrokerHandle,
    permits: Arc<Semaphore>,
}

impl Gateway {
    /// Create a gateway and start its broker. Must be called inside a tokio runtime.
    pub fn new(config: GatewayConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let broker = Broker::spawn(config.broker.clone());
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            auth: AuthInterceptor::new(verifier),
            broker,
            permits,
        }
    }

    /// Handle to the broker, for stats
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Run the gateway server until the process exits
    pub async fn run(&self) -> Result<(), GatewayError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already bound listener until `shutdown` resolves.
    ///
    /// Open connections are closed and their cleanup has finished when this returns.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        info!("Gateway listening on ws://{}", listener.local_addr()?);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, closing {} connections", tracker.len());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!("New connection from {}", peer_addr);

                    let gateway = self.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream, peer_addr, cancel).await {
                            debug!("Connection {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
            }
        }

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        info!("Gateway stopped");
        Ok(())
    }

    /// Authenticate the handshake, then reserve a connection slot
    async fn accept(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<Option<(WsStream, Identity, OwnedSemaphorePermit)>, GatewayError> {
        let mut admitted: Option<(Identity, OwnedSemaphorePermit)> = None;

        let callback = |request: &Request, response: Response| {
            let identity = match self.auth.admit(request) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Refusing handshake from {}: {}", addr, e);
                    return Err(unauthorized());
                }
            };
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    admitted = Some((identity, permit));
                    Ok(response)
                }
                Err(_) => {
                    warn!("Connection limit reached, refusing {}", addr);
                    Err(error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service Unavailable",
                    ))
                }
            }
        };

        let ws_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout)??;

        Ok(admitted.map(|(identity, permit)| (ws_stream, identity, permit)))
    }

    /// Handle a WebSocket connection
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = self.accept(stream, addr) => accepted?,
        };
        let Some((ws_stream, identity, _permit)) = accepted else {
            return Ok(());
        };
        let (mut sender, mut receiver) = ws_stream.split();

        let conn = ConnectionId::next();
        let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_CAPACITY);
        let user_id = identity.user_id.clone();
        let handle = ConnectionHandle::new(conn, identity, addr, tx);
        let overflow = handle.overflow().clone();
        self.broker.register(handle.clone())?;
        info!("Connection {} admitted from {} as {}", conn, addr, user_id);

        let _ = handle.send(ServerEvent::Connected { conn_id: conn, user_id });

        let router = EventRouter::new(self.broker.clone());
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }

                _ = overflow.cancelled() => {
                    warn!("Connection {} is not reading, dropping", conn);
                    break;
                }

                // Handle outgoing frames
                Some(frame) = rx.recv() => {
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if let Err(e) = sender.send(Message::Text(json)).await {
                                error!("Failed to send to connection {}: {}", conn, e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to serialize frame: {}", e);
                        }
                    }
                }

                // Handle incoming frames, one request at a time
                msg = receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for frame in router.route(conn, &text).await {
                                let _ = handle.send(frame);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sender.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("Ignoring binary frame from connection {}", conn);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Connection {} closed", conn);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error on connection {}: {}", conn, e);
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= period * MISSED_HEARTBEATS {
                        warn!("Connection {} missed {} heartbeats, dropping", conn, MISSED_HEARTBEATS);
                        break;
                    }
                    if let Err(e) = sender.send(Message::Ping(Vec::new())).await {
                        warn!("Failed to ping connection {}: {}", conn, e);
                        break;
                    }
                }
            }
        }

        // Cleanup
        if let Err(e) = self.broker.disconnect(conn).await {
            error!("Cleanup of connection {} failed: {}", conn, e);
        }
        info!("Connection {} disconnected", addr);
        Ok(())
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Gateway-related errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Handshake timed out")]
    HandshakeTimeout,
}
