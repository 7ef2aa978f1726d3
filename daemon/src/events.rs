//! Supervisor events, fanned out to every subscriber

use crate::telemetry::SummaryPoint;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Connected,
    Disconnected,
    Message { text: String },
    Summary { point: SummaryPoint },
}

/// Cheap to clone; sending never blocks and never fails for lack of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(Event::Message { text: text.into() });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
