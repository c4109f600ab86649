//! Coordination substrate.
//!
//! Signals are persistent records delivered by polling: a driver asks the
//! bus for its oldest unacknowledged signal at each safe point. Delivery is
//! at-least-once; acknowledgment is idempotent and never re-delivered.

mod bus;
mod cascade;

pub use bus::SignalBus;
pub use cascade::{CascadeOutcome, invalidate_descendants};
