//! Broker boundary for the Iris client.
//!
//! [`BrokerAdapter`] and [`BrokerConnection`] describe the transport the
//! client consumes. [`ConnectionSupervisor`] owns one connection, reconnects
//! it on demand and funnels every subscription into a single inbound channel.
//! [`MemoryBroker`] is an in-process implementation used by tests and the
//! CLI loopback mode.

pub mod adapter;
pub mod config;
pub mod error;
pub mod memory;
pub mod supervisor;

pub use adapter::{BrokerAdapter, BrokerConnection, Delivery};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use memory::{MemoryBroker, Published};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Inbound, SubscriptionSpec};
