//! Scene-wide transit notifications.

use tokio::sync::broadcast;
use uuid::Uuid;

/// A transit transition on some entity in the scene.
#[derive(Debug, Clone)]
pub struct TransitEvent {
    pub entity: Uuid,
    pub kind: TransitEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitEventKind {
    /// The entity entered transit.
    Begin,
    /// The entity left transit; on success the local copy is about to be
    /// torn down by the crossing caller.
    End { success: bool },
}

/// Shared bus every entity publishes its transit transitions to.
#[derive(Clone)]
pub struct TransitEventBus {
    tx: broadcast::Sender<TransitEvent>,
}

impl TransitEventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransitEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: TransitEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for TransitEventBus {
    fn default() -> Self {
        Self::new()
    }
}
