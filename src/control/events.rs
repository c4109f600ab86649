//! EventLog: persisted observability stream plus live push channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use super::messages::ControlEvent;
use crate::domain::EventRecord;
use crate::store::Store;

/// Buffered push events before lagging receivers start losing them.
const CHANNEL_CAPACITY: usize = 256;

/// Writes event records through the store and mirrors typed push events to
/// subscribers. Both paths are fire-and-forget from the emitter's view.
pub struct EventLog {
    store: Arc<Store>,
    tx: broadcast::Sender<ControlEvent>,
}

impl EventLog {
    pub fn new(store: Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, tx }
    }

    /// Persist an observability record. Failures are warned, not fatal:
    /// observability never takes the engine down.
    pub fn record(&self, event: EventRecord) {
        if let Err(e) = self.store.create(&event) {
            warn!(event_type = %event.event_type, error = %e, "failed to persist event");
        }
    }

    /// Push a typed event to live subscribers.
    pub fn push(&self, event: ControlEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Persist and push in one step.
    pub fn emit(&self, record: EventRecord, push: Option<ControlEvent>) {
        self.record(record);
        if let Some(event) = push {
            self.push(event);
        }
    }

    /// Subscribe to live push events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}
