//! Player change notifications
//!
//! Listeners are called synchronously on the thread that mutated the player,
//! never from the real-time callback.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::domain::equalizer::Band;

/// Tunable player parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    Gain(Band),
    Frequency(Band),
    Q(Band),
    Bypass,
}

impl Parameter {
    /// Band the parameter belongs to, `None` for global ones
    pub fn band(&self) -> Option<Band> {
        match self {
            Parameter::Gain(band) | Parameter::Frequency(band) | Parameter::Q(band) => Some(*band),
            Parameter::Bypass => None,
        }
    }
}

/// Something about the player changed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PlayerEvent {
    /// A new input was set, or setting one failed
    InputChanged,
    /// Transport started, stopped or reached the end of the stream
    TransportChanged { playing: bool },
    /// A parameter took a new value; `Bypass` reports 1.0 for on
    ParameterChanged { parameter: Parameter, value: f32 },
}

/// Receiver of player events
pub trait PlayerListener: Send + Sync {
    fn on_player_event(&self, event: &PlayerEvent);
}

/// Ordered set of listeners
///
/// Notification order is registration order. Identity is the `Arc`
/// allocation, so adding the same handle twice is a no-op.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn PlayerListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns `false` if it was already present
    pub fn add(&self, listener: Arc<dyn PlayerListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener; returns `false` if it was not present
    pub fn remove(&self, listener: &Arc<dyn PlayerListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener in order
    ///
    /// The list is snapshotted first so a listener may add or remove
    /// listeners while being notified.
    pub fn notify(&self, event: &PlayerEvent) {
        let snapshot: Vec<Arc<dyn PlayerListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        trace!(?event, listeners = snapshot.len(), "Notifying listeners");
        for listener in snapshot {
            listener.on_player_event(event);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
