//! Event router: raw client frames in, frames for the originator out

use tracing::{debug, error, warn};

use crate::broker::{BrokerHandle, HandlerError};
use crate::connection::ConnectionId;
use crate::protocol::{Ack, ClientFrame, Operation, Request, ServerEvent, ServerFrame};

/// Routes inbound frames of one connection to the broker
#[derive(Debug, Clone)]
pub struct EventRouter {
    broker: BrokerHandle,
}

impl EventRouter {
    pub fn new(broker: BrokerHandle) -> Self {
        Self { broker }
    }

    /// Handle one text frame.
    ///
    /// Returns the frames destined for the originating connection only:
    /// its acknowledgment and any diagnostic event. Broadcasts have already
    /// been queued by the broker by the time this returns. A request that
    /// carried an ack id yields exactly one ack frame, whatever happened.
    pub async fn route(&self, conn: ConnectionId, text: &str) -> Vec<ServerFrame> {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed frame from connection {}: {}", conn, e);
                return Vec::new();
            }
        };

        let Some(op) = Operation::from_event(&frame.event) else {
            debug!("Ignoring unknown event '{}' from connection {}", frame.event, conn);
            return Vec::new();
        };

        let result = match Request::parse(op, &frame.data) {
            Ok(request) => match self.broker.request(conn, request).await {
                Ok(result) => result,
                Err(e) => {
                    error!("{} from connection {} not processed: {}", op.name(), conn, e);
                    Err(HandlerError::Internal(e.to_string()))
                }
            },
            Err(code) => Err(HandlerError::Rejected(code)),
        };

        let mut frames = Vec::new();
        let ack = match result {
            Ok(body) => Ack::Success(body),
            Err(HandlerError::Rejected(code)) => {
                if frame.ack.is_none() {
                    frames.push(
                        ServerEvent::RoomError {
                            message: code.to_string(),
                        }
                        .into(),
                    );
                }
                Ack::Failure(code)
            }
            Err(HandlerError::Internal(msg)) => {
                frames.push(
                    ServerEvent::ServerError {
                        message: format!("{} failed: {}", op.name(), msg),
                    }
                    .into(),
                );
                Ack::Failure(op.failure_code())
            }
        };

        if let Some(id) = frame.ack {
            frames.push(ServerFrame::Ack { ack: id, data: ack });
        }
        frames
    }
}
