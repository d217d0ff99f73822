//! Change notifications published after a successful commit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{model::Identifier, registry::EntityType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChangedEvent {
    pub entity_type: EntityType,
    pub id: Identifier,
    pub action: ChangeAction,
}

/// Receiver of committed changes. Delivery is best effort: the manager does not retry and a
/// publisher must not fail the commit that produced the event.
pub trait MessageBus: Send + Sync {
    fn publish(&self, event: &EntityChangedEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoopBus;

impl MessageBus for NoopBus {
    fn publish(&self, _event: &EntityChangedEvent) {}
}

/// Keeps published events in memory; useful for tests and in-process consumers.
#[derive(Debug, Default)]
pub struct RecordingBus {
    events: Mutex<Vec<EntityChangedEvent>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EntityChangedEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn drain(&self) -> Vec<EntityChangedEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, event: &EntityChangedEvent) {
        self.events.lock().push(event.clone());
    }
}
