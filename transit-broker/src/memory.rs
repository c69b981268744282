//! In-process broker
//!
//! A `Connector` backed by a shared queue. Nacked messages are requeued and
//! deliveries left unsettled are redelivered after the session ends, which is
//! enough to exercise the reconnect and acknowledgement paths without a network.

use crate::{Connector, Message, Session, Subscription, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Queued {
    id: String,
    body: Bytes,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    message: Queued,
}

#[derive(Debug, Default)]
struct BrokerState {
    refuse_connects: u32,
    connects: u32,
    generation: u64,
    next_id: u64,
    queue: VecDeque<Queued>,
    inflight: Vec<InFlight>,
    subscriptions: Vec<Subscription>,
    acked: Vec<String>,
    nacked: Vec<String>,
}

impl BrokerState {
    /// Put every in-flight message matching `pred` back at the head of the queue
    fn requeue(&mut self, pred: impl Fn(&InFlight) -> bool) {
        let (back, keep): (Vec<_>, Vec<_>) = self.inflight.drain(..).partition(|m| pred(m));
        self.inflight = keep;
        for mut entry in back.into_iter().rev() {
            entry.message.redelivered = true;
            self.queue.push_front(entry.message);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker; clones share the same queue
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: u32) {
        self.shared.state.lock().refuse_connects = count;
    }

    /// Enqueue a message and return its id
    pub fn publish(&self, body: impl Into<Bytes>) -> String {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_id += 1;
            let id = format!("msg-{}", state.next_id);
            state.queue.push_back(Queued {
                id: id.clone(),
                body: body.into(),
                redelivered: false,
            });
            id
        };
        self.shared.notify.notify_waiters();
        id
    }

    /// Sever every open session; unacknowledged messages are redelivered
    pub fn drop_connections(&self) {
        {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.requeue(|_| true);
        }
        self.shared.notify.notify_waiters();
    }

    /// Connection attempts seen so far, refused ones included
    pub fn connects(&self) -> u32 {
        self.shared.state.lock().connects
    }

    /// Every SUBSCRIBE received, in order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.state.lock().subscriptions.clone()
    }

    /// Ids of acknowledged messages, in order
    pub fn acked(&self) -> Vec<String> {
        self.shared.state.lock().acked.clone()
    }

    /// Ids of rejected messages, in order
    pub fn nacked(&self) -> Vec<String> {
        self.shared.state.lock().nacked.clone()
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Messages delivered but not yet settled
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().inflight.len()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, TransportError> {
        let mut state = self.shared.state.lock();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Refused("memory broker".to_string()));
        }
        Ok(MemorySession {
            broker: self.clone(),
            generation: state.generation,
            subscription: None,
        })
    }

    fn endpoint(&self) -> String {
        "memory://broker".to_string()
    }
}

/// Session on a `MemoryBroker`
pub struct MemorySession {
    broker: MemoryBroker,
    generation: u64,
    subscription: Option<Subscription>,
}

impl MemorySession {
    fn settle(&self, ack_id: &str, accepted: bool) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        if state.generation != self.generation {
            return Err(TransportError::Closed);
        }
        let Some(pos) = state
            .inflight
            .iter()
            .position(|m| m.generation == self.generation && m.message.id == ack_id)
        else {
            return Err(TransportError::Rejected(format!("unknown ack id {ack_id}")));
        };
        let mut entry = state.inflight.remove(pos);
        if accepted {
            state.acked.push(entry.message.id);
            return Ok(());
        }
        state.nacked.push(entry.message.id.clone());
        entry.message.redelivered = true;
        state.queue.push_back(entry.message);
        drop(state);
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        if state.generation != self.generation {
            return Err(TransportError::Closed);
        }
        state.subscriptions.push(subscription.clone());
        self.subscription = Some(subscription.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.shared.state.lock();
                if state.generation != self.generation {
                    return Ok(None);
                }
                if let Some(subscription) = &self.subscription {
                    if let Some(message) = state.queue.pop_front() {
                        let mut headers = vec![
                            ("message-id".to_string(), message.id.clone()),
                            ("subscription".to_string(), subscription.id.clone()),
                            ("destination".to_string(), subscription.destination.clone()),
                        ];
                        if message.redelivered {
                            headers.push(("redelivered".to_string(), "true".to_string()));
                        }
                        let delivered = Message {
                            message_id: message.id.clone(),
                            ack_id: message.id.clone(),
                            headers,
                            body: message.body.clone(),
                        };
                        state.inflight.push(InFlight {
                            generation: self.generation,
                            message,
                        });
                        return Ok(Some(delivered));
                    }
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, ack_id: &str) -> Result<(), TransportError> {
        self.settle(ack_id, true)
    }

    /// Rejected messages go to the back of the queue
    async fn nack(&mut self, ack_id: &str) -> Result<(), TransportError> {
        self.settle(ack_id, false)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let generation = self.generation;
        {
            let mut state = self.broker.shared.state.lock();
            state.requeue(|m| m.generation == generation);
        }
        self.subscription = None;
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn subscription() -> Subscription {
        Subscription::new("/topic/events", Some("sub-1".into()))
    }

    #[tokio::test]
    async fn test_publish_then_receive() {
        let broker = MemoryBroker::new();
        let id = broker.publish(&b"hello"[..]);

        let mut session = broker.connect().await.unwrap();
        session.subscribe(&subscription()).await.unwrap();

        let message = session.recv().await.unwrap().unwrap();
        assert_eq!(message.message_id, id);
        assert_eq!(message.body, Bytes::from_static(b"hello"));
        assert_eq!(broker.in_flight(), 1);

        session.ack(&message.ack_id).await.unwrap();
        assert_eq!(broker.acked(), vec![id]);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let broker = MemoryBroker::new();
        let mut session = broker.connect().await.unwrap();
        session.subscribe(&subscription()).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&b"late"[..]);
        });

        let message = session.recv().await.unwrap().unwrap();
        assert_eq!(message.body, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(2);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connects(), 3);
    }

    #[tokio::test]
    async fn test_drop_connections_redelivers() {
        let broker = MemoryBroker::new();
        broker.publish(&b"a"[..]);

        let mut first = broker.connect().await.unwrap();
        first.subscribe(&subscription()).await.unwrap();
        let message = first.recv().await.unwrap().unwrap();

        broker.drop_connections();
        assert!(first.recv().await.unwrap().is_none());
        assert!(matches!(
            first.ack(&message.ack_id).await,
            Err(TransportError::Closed)
        ));

        let mut second = broker.connect().await.unwrap();
        second.subscribe(&subscription()).await.unwrap();
        let again = second.recv().await.unwrap().unwrap();
        assert_eq!(again.message_id, message.message_id);
        assert!(again
            .headers
            .iter()
            .any(|(k, v)| k == "redelivered" && v == "true"));
    }

    #[tokio::test]
    async fn test_nack_requeues_message() {
        let broker = MemoryBroker::new();
        let id = broker.publish(&b"bad"[..]);
        broker.publish(&b"next"[..]);

        let mut session = broker.connect().await.unwrap();
        session.subscribe(&subscription()).await.unwrap();
        let message = session.recv().await.unwrap().unwrap();
        session.nack(&message.ack_id).await.unwrap();

        assert_eq!(broker.nacked(), vec![id.clone()]);
        assert_eq!(broker.pending(), 2);
        assert_eq!(broker.in_flight(), 0);

        let next = session.recv().await.unwrap().unwrap();
        assert_eq!(next.body, Bytes::from_static(b"next"));
        let again = session.recv().await.unwrap().unwrap();
        assert_eq!(again.message_id, id);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unsettled() {
        let broker = MemoryBroker::new();
        broker.publish(&b"a"[..]);
        broker.publish(&b"b"[..]);

        let mut session = broker.connect().await.unwrap();
        session.subscribe(&subscription()).await.unwrap();
        let _ = session.recv().await.unwrap().unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(broker.pending(), 2);
        assert_eq!(broker.in_flight(), 0);
    }
}
