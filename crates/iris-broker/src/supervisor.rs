//! Connection supervision.
//!
//! The supervisor owns the single broker connection. Operations that need a
//! live channel connect first when the link is down, and a transport failure
//! during an operation buys exactly one reconnect before the error is
//! surfaced as [`BrokerError::ConnectionFailed`]. Subscriptions are
//! remembered and re-established on every reconnect; their deliveries are
//! forwarded into one inbound channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{BrokerAdapter, BrokerConnection, Delivery};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

const INBOUND_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub queue: String,
    pub routing_key: String,
    pub auto_ack: bool,
}

/// A delivery tagged with the queue it was consumed from.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub queue: String,
    pub delivery: Delivery,
}

#[derive(Default)]
struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    subscriptions: Vec<SubscriptionSpec>,
    forwarders: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Link {
    fn teardown(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        self.connection.take()
    }
}

pub struct ConnectionSupervisor {
    adapter: Arc<dyn BrokerAdapter>,
    config: BrokerConfig,
    link: Mutex<Link>,
    state: RwLock<ConnectionState>,
    inbound_tx: mpsc::Sender<Inbound>,
    connects: AtomicU64,
    reconnects: AtomicU64,
}

impl ConnectionSupervisor {
    /// Create a supervisor and the receiving end of its inbound channel.
    /// Nothing connects until the first operation.
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        config: BrokerConfig,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let supervisor = Self {
            adapter,
            config,
            link: Mutex::new(Link::default()),
            state: RwLock::new(ConnectionState::Disconnected),
            inbound_tx,
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        };
        (supervisor, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Successful connects after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = ?*state, to = ?next, "connection state change");
            *state = next;
        }
    }

    /// The current connection if it is still open. A connection found dead
    /// is torn down and the state drops to `Disconnected`.
    fn live(&self, link: &mut Link) -> Option<Arc<dyn BrokerConnection>> {
        match link.connection.as_ref().map(|conn| conn.is_open()) {
            Some(true) => link.connection.clone(),
            Some(false) => {
                warn!(url = %self.config.display_url(), "broker connection lost");
                link.teardown();
                self.set_state(ConnectionState::Disconnected);
                None
            }
            None => None,
        }
    }

    fn mark_lost(&self, link: &mut Link, error: &BrokerError) {
        warn!(error = %error, kind = error.error_kind(), "dropping broker connection");
        link.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn establish(&self, link: &mut Link) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if link.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(stale) = link.teardown() {
            stale.close().await;
        }
        self.set_state(ConnectionState::Connecting);

        let attempt =
            tokio::time::timeout(self.config.connect_timeout, self.adapter.connect(&self.config)).await;
        let conn = match attempt {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(url = %self.config.display_url(), error = %e, "connect failed");
                return Err(BrokerError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(url = %self.config.display_url(), "connect timed out");
                return Err(BrokerError::ConnectionFailed(format!(
                    "connect to {} timed out after {:?}",
                    self.config.display_url(),
                    self.config.connect_timeout
                )));
            }
        };

        for spec in link.subscriptions.clone() {
            match conn.subscribe(&spec.queue, &spec.routing_key, spec.auto_ack).await {
                Ok(rx) => link.forwarders.push(self.spawn_forwarder(spec.queue.clone(), rx)),
                Err(e) => {
                    for handle in link.forwarders.drain(..) {
                        handle.abort();
                    }
                    conn.close().await;
                    self.set_state(ConnectionState::Disconnected);
                    return Err(BrokerError::ConnectionFailed(format!(
                        "subscribe to {} failed: {e}",
                        spec.queue
                    )));
                }
            }
        }

        if self.connects.fetch_add(1, Ordering::Relaxed) > 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                url = %self.config.display_url(),
                subscriptions = link.subscriptions.len(),
                "reconnected to broker"
            );
        } else {
            info!(url = %self.config.display_url(), "connected to broker");
        }
        link.connection = Some(conn.clone());
        self.set_state(ConnectionState::Connected);
        Ok(conn)
    }

    fn spawn_forwarder(
        &self,
        queue: String,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let inbound = Inbound {
                    queue: queue.clone(),
                    delivery,
                };
                if tx.send(inbound).await.is_err() {
                    return;
                }
            }
            debug!(queue = %queue, "consumer stream ended");
        })
    }

    /// Returns the live connection and whether it was opened just now.
    async fn connection(
        &self,
        link: &mut Link,
    ) -> Result<(Arc<dyn BrokerConnection>, bool), BrokerError> {
        if link.closed {
            return Err(BrokerError::Closed);
        }
        match self.live(link) {
            Some(conn) => Ok((conn, false)),
            None => Ok((self.establish(link).await?, true)),
        }
    }

    pub async fn ensure_connected(&self) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        self.connection(&mut link).await.map(|_| ())
    }

    pub async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        let (conn, fresh) = self.connection(&mut link).await?;
        let error = match conn.publish(queue, body.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transport() => e,
            Err(e) => return Err(e),
        };
        self.mark_lost(&mut link, &error);
        if fresh {
            // The connect for this operation was its one attempt.
            return Err(BrokerError::ConnectionFailed(error.to_string()));
        }
        let conn = self.establish(&mut link).await?;
        match conn.publish(queue, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_lost(&mut link, &e);
                Err(BrokerError::ConnectionFailed(e.to_string()))
            }
        }
    }

    /// Consume `queue` (bound to `routing_key`) into the inbound channel,
    /// now and after every reconnect.
    pub async fn subscribe(
        &self,
        queue: &str,
        routing_key: &str,
        auto_ack: bool,
    ) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        if link.closed {
            return Err(BrokerError::Closed);
        }
        let spec = SubscriptionSpec {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            auto_ack,
        };
        if link.subscriptions.contains(&spec) {
            return Ok(());
        }
        link.subscriptions.push(spec.clone());

        let result = match self.live(&mut link) {
            None => self.establish(&mut link).await.map(|_| ()),
            Some(conn) => match conn.subscribe(queue, routing_key, auto_ack).await {
                Ok(rx) => {
                    let handle = self.spawn_forwarder(spec.queue.clone(), rx);
                    link.forwarders.push(handle);
                    Ok(())
                }
                Err(e) if e.is_transport() => {
                    self.mark_lost(&mut link, &e);
                    self.establish(&mut link).await.map(|_| ())
                }
                Err(e) => Err(e),
            },
        };
        match &result {
            Ok(()) => info!(queue, routing_key, auto_ack, "subscribed"),
            Err(_) => link.subscriptions.retain(|s| s != &spec),
        }
        result
    }

    /// Acknowledge on the current connection. Tags from a previous
    /// connection are unknown to the broker and fail.
    pub async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        match self.live(&mut link) {
            Some(conn) => conn.ack(tag).await,
            None => Err(BrokerError::ChannelClosed(format!("cannot ack {tag}: not connected"))),
        }
    }

    pub async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        match self.live(&mut link) {
            Some(conn) => conn.nack(tag, requeue).await,
            None => Err(BrokerError::ChannelClosed(format!("cannot nack {tag}: not connected"))),
        }
    }

    /// Close the connection. Every later operation fails with `Closed`.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.closed {
            return;
        }
        link.closed = true;
        if let Some(conn) = link.teardown() {
            conn.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("broker connection closed");
    }
}
