//! In-process broker.
//!
//! A message published to a target reaches every consumer whose queue name
//! or routing key equals the target. Consumers sharing a queue compete
//! (round robin); distinct queues each get a copy. Deliveries on manual-ack
//! consumers stay outstanding until acked, are redelivered elsewhere on
//! `nack(requeue)` and are requeued when their connection closes. Messages
//! nobody can take are parked until a matching consumer subscribes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::adapter::{BrokerAdapter, BrokerConnection, Delivery};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// A message as it was handed to [`BrokerConnection::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub queue: String,
    pub body: Bytes,
}

struct Consumer {
    id: u64,
    connection: u64,
    queue: String,
    routing_key: String,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn matches(&self, target: &str) -> bool {
        self.queue == target || self.routing_key == target
    }
}

struct Unacked {
    connection: u64,
    consumer: u64,
    queue: String,
    body: Bytes,
}

struct Parked {
    target: String,
    body: Bytes,
    skip: Option<u64>,
    redelivered: bool,
}

#[derive(Default)]
struct State {
    open: HashSet<u64>,
    consumers: Vec<Consumer>,
    cursors: HashMap<String, usize>,
    unacked: HashMap<u64, Unacked>,
    parked: Vec<Parked>,
    next_tag: u64,
    next_consumer: u64,
    next_connection: u64,
}

impl State {
    /// Deliver one copy per distinct queue matching `target`.
    fn route(&mut self, target: &str, body: &Bytes, skip: Option<u64>, redelivered: bool) -> bool {
        let mut queues: Vec<String> = Vec::new();
        for consumer in &self.consumers {
            if consumer.matches(target)
                && Some(consumer.id) != skip
                && !queues.contains(&consumer.queue)
            {
                queues.push(consumer.queue.clone());
            }
        }
        let mut delivered = false;
        for queue in queues {
            delivered |= self.deliver_to_queue(&queue, target, body.clone(), skip, redelivered);
        }
        delivered
    }

    fn deliver_to_queue(
        &mut self,
        queue: &str,
        target: &str,
        body: Bytes,
        skip: Option<u64>,
        redelivered: bool,
    ) -> bool {
        loop {
            let candidates: Vec<usize> = self
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, c)| c.queue == queue && c.matches(target) && Some(c.id) != skip)
                .map(|(i, _)| i)
                .collect();
            if candidates.is_empty() {
                return false;
            }
            let cursor = self.cursors.entry(queue.to_string()).or_insert(0);
            let idx = candidates[*cursor % candidates.len()];
            *cursor = cursor.wrapping_add(1);

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &self.consumers[idx];
            let delivery = Delivery {
                tag,
                body: body.clone(),
                redelivered,
            };
            if consumer.tx.send(delivery).is_ok() {
                if !consumer.auto_ack {
                    self.unacked.insert(
                        tag,
                        Unacked {
                            connection: consumer.connection,
                            consumer: consumer.id,
                            queue: queue.to_string(),
                            body,
                        },
                    );
                }
                return true;
            }
            debug!(queue, consumer = consumer.id, "dropping consumer with closed stream");
            self.consumers.remove(idx);
        }
    }

    fn route_or_park(&mut self, target: &str, body: Bytes, skip: Option<u64>, redelivered: bool) {
        if !self.route(target, &body, skip, redelivered) {
            debug!(destination = target, "no consumer available, parking message");
            self.parked.push(Parked {
                target: target.to_string(),
                body,
                skip,
                redelivered,
            });
        }
    }

    fn flush_parked(&mut self) {
        let parked = std::mem::take(&mut self.parked);
        for entry in parked {
            if !self.route(&entry.target, &entry.body, entry.skip, entry.redelivered) {
                self.parked.push(entry);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) -> bool {
        if !self.open.remove(&connection) {
            return false;
        }
        self.consumers.retain(|c| c.connection != connection);
        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        let mut orphaned_entries: Vec<(u64, Unacked)> = orphaned
            .into_iter()
            .filter_map(|tag| self.unacked.remove(&tag).map(|u| (tag, u)))
            .collect();
        orphaned_entries.sort_by_key(|(tag, _)| *tag);
        for (_, entry) in orphaned_entries {
            self.route_or_park(&entry.queue, entry.body, None, true);
        }
        true
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    published: Mutex<Vec<Published>>,
    published_notify: Notify,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    connects: AtomicU64,
}

/// In-memory [`BrokerAdapter`]. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish from outside any connection, e.g. a scripted server reply.
    pub fn inject(&self, target: &str, body: impl Into<Bytes>) {
        self.record_and_route(target, body.into());
    }

    /// Drop every open connection as if the broker went away.
    pub fn force_close(&self) {
        let mut state = self.shared.state.lock();
        let open: Vec<u64> = state.open.iter().copied().collect();
        for connection in open {
            state.close_connection(connection);
        }
        info!("memory broker closed all connections");
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes fail and close the publishing connection.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Number of connect attempts, failed ones included.
    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    pub fn parked_count(&self) -> usize {
        self.shared.state.lock().parked.len()
    }

    pub fn published(&self) -> Vec<Published> {
        self.shared.published.lock().clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<Bytes> {
        self.shared
            .published
            .lock()
            .iter()
            .filter(|p| p.queue == queue)
            .map(|p| p.body.clone())
            .collect()
    }

    /// Wait until at least `n` messages have been published in total.
    pub async fn wait_for_published(&self, n: usize) -> Vec<Published> {
        loop {
            let notified = self.shared.published_notify.notified();
            {
                let published = self.shared.published.lock();
                if published.len() >= n {
                    return published.clone();
                }
            }
            notified.await;
        }
    }

    fn record_and_route(&self, target: &str, body: Bytes) {
        self.shared.published.lock().push(Published {
            queue: target.to_string(),
            body: body.clone(),
        });
        self.shared.state.lock().route_or_park(target, body, None, false);
        self.shared.published_notify.notify_waiters();
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BrokerAdapter for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.shared.fail_connects) {
            return Err(BrokerError::ConnectionFailed(format!(
                "{} refused the connection",
                config.display_url()
            )));
        }
        let id = {
            let mut state = self.shared.state.lock();
            state.next_connection += 1;
            let id = state.next_connection;
            state.open.insert(id);
            id
        };
        debug!(connection = id, "memory broker connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed(format!("connection {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.shared.state.lock().open.contains(&self.id)
    }

    async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if take_one(&self.broker.shared.fail_publishes) {
            self.broker.shared.state.lock().close_connection(self.id);
            warn!(connection = self.id, queue, "injected publish failure");
            return Err(BrokerError::ChannelClosed(format!(
                "publish to {queue} failed on connection {}",
                self.id
            )));
        }
        self.broker.record_and_route(queue, body);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        routing_key: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.shared.state.lock();
        if !state.open.contains(&self.id) {
            return Err(BrokerError::ChannelClosed(format!("connection {} is closed", self.id)));
        }
        state.next_consumer += 1;
        let id = state.next_consumer;
        state.consumers.push(Consumer {
            id,
            connection: self.id,
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            auto_ack,
            tx,
        });
        state.flush_parked();
        debug!(connection = self.id, queue, routing_key, consumer = id, "consumer registered");
        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        match state.unacked.get(&tag) {
            Some(entry) if entry.connection == self.id => {
                state.unacked.remove(&tag);
                Ok(())
            }
            _ => Err(BrokerError::UnknownDelivery(tag)),
        }
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock();
        let entry = match state.unacked.get(&tag) {
            Some(entry) if entry.connection == self.id => state.unacked.remove(&tag),
            _ => None,
        };
        let Some(entry) = entry else {
            return Err(BrokerError::UnknownDelivery(tag));
        };
        if requeue {
            state.route_or_park(&entry.queue, entry.body, Some(entry.consumer), true);
        } else {
            debug!(tag, queue = %entry.queue, "delivery rejected without requeue");
        }
        Ok(())
    }

    async fn close(&self) {
        if self.broker.shared.state.lock().close_connection(self.id) {
            debug!(connection = self.id, "memory broker connection closed");
        }
    }
}
