//! # Messaging Module
//!
//! Message types and the broker provider seam. Two providers ship with the
//! crate: NATS (`async-nats`) for deployments and an in-memory broker for
//! tests and local runs.

pub mod errors;
pub mod message;
pub mod providers;
pub mod transport;

pub use errors::MessagingError;
pub use message::{
    Delivery, FailureReason, Message, Metadata, ProcessingContext, ProcessingResult,
    ProcessingStatus, SpanContext, CORRELATION_ID_HEADER, FAILURE_REASON_HEADER,
    ORIGINAL_TOPIC_HEADER, REDELIVERED_HEADER, SOURCE_MESSAGE_ID_HEADER,
};
pub use providers::{InMemoryBroker, NatsTransport, PublishedMessage};
pub use transport::{BrokerSession, BrokerTransport, MessageStream, Publisher};
