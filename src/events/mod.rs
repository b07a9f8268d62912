//! Engine event bus.
//!
//! Components publish typed [`EventPayload`]s; observers subscribe per
//! [`EventTopic`]. Emission never blocks and never fails: an event with no
//! subscribers is counted and dropped.

pub mod bus;
pub mod engine_events;

pub use bus::{EventBus, DEFAULT_CHANNEL_CAPACITY};
pub use engine_events::{EngineEvent, EventPayload, EventTopic, WatchdogAlertKind};
