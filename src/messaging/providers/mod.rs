//! Broker provider implementations

pub mod in_memory;
pub mod nats;

pub use in_memory::{InMemoryBroker, PublishedMessage};
pub use nats::NatsTransport;
