use rusqlite::Connection;
use tokio::sync::broadcast;

use crate::event::{EventPayload, IssuerEvent};
use crate::store::emit_event;

/// Default capacity of the in-process event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Persists events and fans them out to in-process subscribers.
///
/// Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IssuerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IssuerEvent> {
        self.tx.subscribe()
    }

    /// Writes the event to the log and broadcasts it.
    ///
    /// Failures are logged and never reach the caller: a lost event must
    /// not undo the operation that produced it.
    pub fn emit(&self, conn: &Connection, issuer: &str, entity_id: &str, payload: &EventPayload) {
        match emit_event(conn, issuer, entity_id, payload) {
            Ok(event) => self.publish(event),
            Err(e) => {
                tracing::warn!(
                    issuer,
                    event_type = payload.event_type(),
                    "failed to emit event: {}",
                    e
                );
            }
        }
    }

    /// Broadcasts an already persisted event, e.g. one written inside a
    /// transaction that has since committed.
    pub fn publish(&self, event: IssuerEvent) {
        let event_type = event.event_type.clone();
        if self.tx.send(event).is_err() {
            tracing::trace!(event_type, "no event subscribers");
        }
    }
}
