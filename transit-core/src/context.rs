//! Per-run context shared by the listener, the poller and the orchestrator.

use std::sync::Arc;
use tokio::sync::watch;
use transit_tracker::CorrelationEngine;

/// One-way flag observed by every task of a run
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// State owned by one tracking or ingestion run
#[derive(Debug, Clone)]
pub struct RunContext {
    engine: Arc<CorrelationEngine>,
    shutdown: ShutdownSignal,
    subscribed: Arc<watch::Sender<bool>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(CorrelationEngine::new()),
            shutdown: ShutdownSignal::new(),
            subscribed: Arc::new(watch::channel(false).0),
        }
    }

    pub fn engine(&self) -> &Arc<CorrelationEngine> {
        &self.engine
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Record that the listener holds an active subscription
    pub fn mark_subscribed(&self) {
        self.subscribed.send_replace(true);
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Resolves once the listener has subscribed
    pub async fn subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }
}
