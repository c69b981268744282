//! Transit Broker
//!
//! Publish/subscribe plumbing for the transit event stream: a STOMP 1.2 codec and
//! connector, an in-memory broker for tests, and the `ConnectionManager` that owns
//! the subscription lifecycle (connect, subscribe, reconnect, resubscribe).

pub mod frame;
mod manager;
mod memory;
mod stomp;

pub use frame::{Command, Frame, FrameError, Inbound, Outbound, StompCodec};
pub use manager::{ConnectError, ConnectionManager, DisconnectReason, ReconnectPolicy};
pub use memory::{MemoryBroker, MemorySession};
pub use stomp::{ConnectionParams, StompConnector, StompSession, TlsParams};

use async_trait::async_trait;
use bytes::Bytes;

/// A topic subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Destination to subscribe to (e.g. `/topic/transfer.events`)
    pub destination: String,

    /// Subscription identifier, reused on every resubscribe
    pub id: String,

    /// Ask the broker for a durable, non auto-deleted queue
    pub durable: bool,
}

impl Subscription {
    /// Create a subscription, generating an id when none is given
    pub fn new(destination: impl Into<String>, id: Option<String>) -> Self {
        Self {
            destination: destination.into(),
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            durable: false,
        }
    }

    /// Request a durable subscription
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// A message as received by a session
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned message id
    pub message_id: String,

    /// Identifier to use when acknowledging
    pub ack_id: String,

    /// Frame headers
    pub headers: Vec<(String, String)>,

    /// Raw body
    pub body: Bytes,
}

/// Handle used to acknowledge a delivery on the session that received it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    /// Identifier to acknowledge
    pub ack_id: String,

    /// Session generation the message arrived on
    pub generation: u64,
}

/// A message delivered through the connection manager
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: Receipt,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Delivery {
    /// Stamp a session message with the generation it arrived on
    pub fn new(message: Message, generation: u64) -> Self {
        Self {
            message_id: message.message_id,
            receipt: Receipt {
                ack_id: message.ack_id,
                generation,
            },
            headers: message.headers,
            body: message.body,
        }
    }

    /// Get a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Acknowledge or reject a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// A pending acknowledgement decided by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub receipt: Receipt,
    pub disposition: Disposition,
}

impl Acknowledgement {
    pub fn ack(receipt: Receipt) -> Self {
        Self {
            receipt,
            disposition: Disposition::Ack,
        }
    }

    pub fn nack(receipt: Receipt) -> Self {
        Self {
            receipt,
            disposition: Disposition::Nack,
        }
    }
}

/// Opens sessions to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Open a new session
    async fn connect(&self) -> Result<Self::Session, TransportError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// An established broker session
#[async_trait]
pub trait Session: Send {
    /// Subscribe with client-individual acknowledgement
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError>;

    /// Wait for the next message; `Ok(None)` means the broker closed the session
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;

    /// Acknowledge a single message
    async fn ack(&mut self, ack_id: &str) -> Result<(), TransportError>;

    /// Negatively acknowledge a single message
    async fn nack(&mut self, ack_id: &str) -> Result<(), TransportError>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Broker error: {0}")]
    Rejected(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_generates_id() {
        let a = Subscription::new("/topic/events", None);
        let b = Subscription::new("/topic/events", None);
        assert_ne!(a.id, b.id);
        assert!(!a.durable);

        let c = Subscription::new("/topic/events", Some("sub-1".into())).durable(true);
        assert_eq!(c.id, "sub-1");
        assert!(c.durable);
    }

    #[test]
    fn test_delivery_header_lookup() {
        let delivery = Delivery::new(
            Message {
                message_id: "m-1".into(),
                ack_id: "a-1".into(),
                headers: vec![("redelivered".into(), "true".into())],
                body: Bytes::from_static(b"{}"),
            },
            3,
        );

        assert_eq!(delivery.header("redelivered"), Some("true"));
        assert_eq!(delivery.header("missing"), None);
        assert_eq!(delivery.receipt.generation, 3);
        assert_eq!(delivery.receipt.ack_id, "a-1");
    }
}
