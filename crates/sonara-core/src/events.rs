use std::sync::Arc;

use crate::engine::{ConnectionState, MediaKind, ParticipantId};

/// Discrete notifications emitted by the connection driver, alongside the
/// snapshot updates.
#[derive(Debug, Clone)]
pub enum SonaraEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    TrackSubscribed { participant: ParticipantId, kind: MediaKind },
    TrackCleared { participant: ParticipantId, kind: MediaKind },
    JoinFailed { channel: String, reason: String },
}

/// Trait for receiving events from a connection.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SonaraEventListener: Send + Sync {
    fn on_event(&self, event: SonaraEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn SonaraEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SonaraEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: SonaraEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
