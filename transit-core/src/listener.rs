//! Listener loop
//!
//! Connects, subscribes, then feeds deliveries to a `DeliveryHandler` until the
//! run's shutdown signal fires. Only a `ConnectError` ends it early.

use crate::context::RunContext;
use crate::handler::DeliveryHandler;
use tracing::{debug, info};
use transit_broker::{
    Acknowledgement, ConnectError, ConnectionManager, Connector, Disposition, Subscription,
};

/// Counters for one listener run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,

    /// Acknowledgements not sent because their session was gone
    pub unsent: u64,
}

pub struct Listener<C: Connector> {
    manager: ConnectionManager<C>,
    subscription: Subscription,
}

impl<C: Connector> Listener<C> {
    pub fn new(manager: ConnectionManager<C>, subscription: Subscription) -> Self {
        Self {
            manager,
            subscription,
        }
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Run until shutdown; fails only when the broker cannot be reached
    pub async fn run<H: DeliveryHandler>(
        &mut self,
        handler: &mut H,
        ctx: &RunContext,
    ) -> Result<ListenerStats, ConnectError> {
        let mut stats = ListenerStats::default();

        self.manager.connect().await?;
        self.manager.subscribe(self.subscription.clone()).await?;
        ctx.mark_subscribed();
        info!(
            topic = %self.subscription.destination,
            subscription_id = %self.subscription.id,
            "Listening for events"
        );

        while !ctx.shutdown().is_triggered() {
            let delivery = tokio::select! {
                biased;
                _ = ctx.shutdown().triggered() => break,
                delivery = self.manager.next_delivery() => delivery?,
            };
            stats.received += 1;
            debug!(message_id = %delivery.message_id, "Received message");

            let acks = handler.handle(delivery).await;
            self.settle(&acks, &mut stats).await;
        }

        let acks = handler.finish().await;
        self.settle(&acks, &mut stats).await;
        self.manager.disconnect().await;

        info!(
            received = stats.received,
            acked = stats.acked,
            nacked = stats.nacked,
            reconnects = self.manager.reconnects(),
            "Listener stopped"
        );
        Ok(stats)
    }

    async fn settle(&mut self, acks: &[Acknowledgement], stats: &mut ListenerStats) {
        for ack in acks {
            if !self.manager.acknowledge(ack).await {
                stats.unsent += 1;
                continue;
            }
            match ack.disposition {
                Disposition::Ack => stats.acked += 1,
                Disposition::Nack => stats.nacked += 1,
            }
        }
    }
}
