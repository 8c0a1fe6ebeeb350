//! Event bus driving frame lifecycle and budget events.
//!
//! Publishing is thread-safe and allocation-free once the queue has
//! been reserved; dispatch runs on a single thread once per frame.

mod bus;
mod message;
mod queue;

pub use bus::{BusStats, MessageBus, MessageHandler, ScopedSubscriptions, SubscriptionId};
pub use message::{
    message_type, EventCategory, EventMessage, EventPayload, MessageType, SenderId,
};
pub use queue::PreAllocatedQueue;
