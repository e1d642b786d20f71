//! Demo resources served behind the validator.

pub mod events;

pub use events::{Event, EventItem, EventStore, EventsBatch, EventsCollection};
