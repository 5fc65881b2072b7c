//! In-process message bus with topics, consumer groups and manual commits.
//!
//! The bus is the seam between pipeline components. Producers publish
//! keyed records to named topics; consumer groups subscribe with wildcard
//! patterns and commit offsets only after a record has been fully
//! processed. Uncommitted records are redelivered when the group
//! resubscribes, which gives the at-least-once semantics the persistence
//! layer relies on. Within a topic records are delivered in publish order,
//! so per-key ordering holds as well.
//!
//! One live subscription per group: the group cursor is shared, not
//! fanned out.

mod bus;
mod pattern;

pub use bus::{Delivery, MessageBus, Subscription};
pub use pattern::TopicPattern;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
