//! Connection Manager
//!
//! Owns the broker session and the subscription lifecycle. The initial connect and
//! every reconnect are bounded by a `ReconnectPolicy`; exhausting it is the only
//! fatal condition and surfaces as `ConnectError::Exhausted`.

use crate::{Acknowledgement, Connector, Delivery, Disposition, Receipt, Session, Subscription};
use crate::TransportError;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry bounds for connecting and reconnecting
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts per (re)connect before giving up
    pub max_attempts: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The broker closed the session
    Closed,
    /// The session failed
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed by broker"),
            DisconnectReason::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Fatal connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Broker {endpoint} unreachable after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("Not connected")]
    NotConnected,
}

type DisconnectHandler = Box<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Owns a broker session and keeps it subscribed
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    session: Option<C::Session>,
    subscription: Option<Subscription>,
    generation: u64,
    reconnects: u64,
    disconnect_handlers: Vec<DisconnectHandler>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            session: None,
            subscription: None,
            generation: 0,
            reconnects: 0,
            disconnect_handlers: Vec::new(),
        }
    }

    /// Register a callback invoked on every unexpected disconnect
    pub fn on_disconnect(&mut self, handler: impl Fn(&DisconnectReason) + Send + Sync + 'static) {
        self.disconnect_handlers.push(Box::new(handler));
    }

    /// Connect, retrying up to the policy's attempt limit
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let session = establish(&self.connector, &self.policy, None).await?;
        self.install(session);
        info!(endpoint = %self.connector.endpoint(), "Connected to broker");
        Ok(())
    }

    /// Subscribe and remember the subscription for reconnects
    pub async fn subscribe(&mut self, subscription: Subscription) -> Result<(), ConnectError> {
        let session = self.session.as_mut().ok_or(ConnectError::NotConnected)?;
        let result = session.subscribe(&subscription).await;
        match &result {
            Ok(()) => info!(
                topic = %subscription.destination,
                subscription_id = %subscription.id,
                "Subscribed"
            ),
            Err(e) => warn!(
                topic = %subscription.destination,
                subscription_id = %subscription.id,
                error = %e,
                "Subscribe failed; reconnecting"
            ),
        }
        self.subscription = Some(subscription);

        if let Err(e) = result {
            self.recover(DisconnectReason::Error(e.to_string())).await?;
        }
        Ok(())
    }

    /// Wait for the next delivery, reconnecting and resubscribing as needed
    pub async fn next_delivery(&mut self) -> Result<Delivery, ConnectError> {
        loop {
            let session = self.session.as_mut().ok_or(ConnectError::NotConnected)?;
            let reason = match session.recv().await {
                Ok(Some(message)) => return Ok(Delivery::new(message, self.generation)),
                Ok(None) => DisconnectReason::Closed,
                Err(e) => DisconnectReason::Error(e.to_string()),
            };
            self.recover(reason).await?;
        }
    }

    /// Apply a consumer's decision
    ///
    /// Returns `false` when the frame could not be sent; the broker will redeliver.
    pub async fn acknowledge(&mut self, ack: &Acknowledgement) -> bool {
        match ack.disposition {
            Disposition::Ack => self.ack(&ack.receipt).await,
            Disposition::Nack => self.nack(&ack.receipt).await,
        }
    }

    pub async fn ack(&mut self, receipt: &Receipt) -> bool {
        let Some(session) = self.current_session(receipt) else {
            return false;
        };
        match session.ack(&receipt.ack_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(ack_id = %receipt.ack_id, error = %e, "Failed to acknowledge message");
                false
            }
        }
    }

    pub async fn nack(&mut self, receipt: &Receipt) -> bool {
        let Some(session) = self.current_session(receipt) else {
            return false;
        };
        match session.nack(&receipt.ack_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(ack_id = %receipt.ack_id, error = %e, "Failed to reject message");
                false
            }
        }
    }

    /// Close the session
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.disconnect().await {
                debug!(error = %e, "Error while disconnecting");
            }
            info!(endpoint = %self.connector.endpoint(), "Disconnected from broker");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Session generation; increases on every successful (re)connect
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of automatic reconnects performed
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    fn current_session(&mut self, receipt: &Receipt) -> Option<&mut C::Session> {
        if receipt.generation != self.generation {
            debug!(
                ack_id = %receipt.ack_id,
                generation = receipt.generation,
                current = self.generation,
                "Skipping acknowledgement for a previous session"
            );
            return None;
        }
        self.session.as_mut()
    }

    fn install(&mut self, session: C::Session) {
        self.session = Some(session);
        self.generation += 1;
    }

    async fn recover(&mut self, reason: DisconnectReason) -> Result<(), ConnectError> {
        warn!(endpoint = %self.connector.endpoint(), reason = %reason, "Lost connection to broker");
        for handler in &self.disconnect_handlers {
            handler(&reason);
        }
        self.session = None;

        let session =
            establish(&self.connector, &self.policy, self.subscription.as_ref()).await?;
        self.install(session);
        self.reconnects += 1;
        info!(
            topic = self.subscription.as_ref().map(|s| s.destination.as_str()).unwrap_or(""),
            subscription_id = self.subscription.as_ref().map(|s| s.id.as_str()).unwrap_or(""),
            reconnects = self.reconnects,
            "Reconnected to broker"
        );
        Ok(())
    }
}

/// Open a session (and resubscribe when a subscription is known)
async fn establish<C: Connector>(
    connector: &C,
    policy: &ReconnectPolicy,
    subscription: Option<&Subscription>,
) -> Result<C::Session, ConnectError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match open(connector, subscription).await {
            Ok(session) => return Ok(session),
            Err(e) if attempt < max_attempts => {
                warn!(
                    endpoint = %connector.endpoint(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "Unable to connect; retrying"
                );
                tokio::time::sleep(policy.retry_delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    endpoint = %connector.endpoint(),
                    attempts = max_attempts,
                    error = %e,
                    "Failed to connect to broker"
                );
                return Err(ConnectError::Exhausted {
                    endpoint: connector.endpoint(),
                    attempts: max_attempts,
                    last: e,
                });
            }
        }
    }
}

async fn open<C: Connector>(
    connector: &C,
    subscription: Option<&Subscription>,
) -> Result<C::Session, TransportError> {
    let mut session = connector.connect().await?;
    if let Some(subscription) = subscription {
        session.subscribe(subscription).await?;
    }
    Ok(session)
}
