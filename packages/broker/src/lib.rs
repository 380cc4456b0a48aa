//! Queue and control-bus primitives for the dispatch system.
//!
//! The dispatch core treats both as external collaborators:
//! - [`Broker`] - durable per-tenant queue with blocking claim and ack
//! - [`ControlBus`] - best-effort pub/sub for administrative commands
//!
//! In-process implementations ([`MemoryBroker`], [`MemoryBus`]) let the
//! system run standalone and back the test suites.

mod bus;
mod memory;
mod queue;

pub use bus::{BusMessage, ControlBus, MemoryBus, Subscription, SubscriptionError};
pub use memory::MemoryBroker;
pub use queue::{
    AckDisposition, AckOutcome, Broker, BrokerError, BrokerFuture, Delivery, DeliveryTag,
};
