use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::document::SaveOperation;
use crate::error::DocumentError;

/// Notifications published by documents.
///
/// `UnhandledSaveError` is the fallback channel for write failures nobody
/// awaited: timer autosaves, background saves and the autosave run by close.
#[derive(Clone, Debug)]
pub enum DocumentEvent {
    Opened { id: Uuid, location: PathBuf },
    Persisted { id: Uuid, location: PathBuf, operation: SaveOperation },
    LocationChangedBySaving { id: Uuid, from: PathBuf, to: PathBuf },
    Moved { id: Uuid, from: PathBuf, to: PathBuf },
    Reverted { id: Uuid, location: PathBuf },
    /// The item changed on disk while the document had unsaved changes.
    ExternalChange { id: Uuid, location: PathBuf },
    ConflictDetected { id: Uuid, location: PathBuf, conflicts: usize },
    ConflictResolved { id: Uuid, location: PathBuf },
    OperationStalled { id: Uuid, context: String, elapsed: Duration },
    UnhandledSaveError { id: Uuid, location: PathBuf, error: DocumentError },
    Closed { id: Uuid },
    Deleted { id: Uuid, location: PathBuf },
}

impl DocumentEvent {
    pub fn document_id(&self) -> Uuid {
        match self {
            DocumentEvent::Opened { id, .. }
            | DocumentEvent::Persisted { id, .. }
            | DocumentEvent::LocationChangedBySaving { id, .. }
            | DocumentEvent::Moved { id, .. }
            | DocumentEvent::Reverted { id, .. }
            | DocumentEvent::ExternalChange { id, .. }
            | DocumentEvent::ConflictDetected { id, .. }
            | DocumentEvent::ConflictResolved { id, .. }
            | DocumentEvent::OperationStalled { id, .. }
            | DocumentEvent::UnhandledSaveError { id, .. }
            | DocumentEvent::Closed { id }
            | DocumentEvent::Deleted { id, .. } => *id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DocumentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Process-wide bus used by documents that were not given one.
    pub fn shared() -> Self {
        static SHARED: OnceLock<EventBus> = OnceLock::new();
        SHARED.get_or_init(EventBus::new).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: DocumentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
