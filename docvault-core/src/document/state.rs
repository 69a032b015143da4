use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use super::conflict::ConflictTracker;
use crate::error::DocumentError;
use crate::token::ChangeToken;

/// Lifecycle phase of a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    Closed,
    Opening,
    Open,
    Saving,
    Autosaving,
    Reverting,
    Closing,
    Deleted,
}

impl DocumentState {
    /// Whether content is loaded and may be edited.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            DocumentState::Open
                | DocumentState::Saving
                | DocumentState::Autosaving
                | DocumentState::Reverting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Closed => "closed",
            DocumentState::Opening => "opening",
            DocumentState::Open => "open",
            DocumentState::Saving => "saving",
            DocumentState::Autosaving => "autosaving",
            DocumentState::Reverting => "reverting",
            DocumentState::Closing => "closing",
            DocumentState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of save being performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveOperation {
    /// Explicit save. Writing to another location moves the item there.
    Save,
    /// Save triggered by the autosave timer or by close.
    Autosave,
    /// Write a new item and present it from then on. The original stays.
    SaveAs,
    /// Export a copy. Location, token and unsaved flag are untouched.
    SaveTo,
}

impl SaveOperation {
    /// Whether a successful save re-points the document at the target.
    pub fn adopts_location(&self) -> bool {
        !matches!(self, SaveOperation::SaveTo)
    }

    /// Whether the previous item is moved rather than left behind when the
    /// target differs from the current location.
    pub fn moves_item(&self) -> bool {
        matches!(self, SaveOperation::Save | SaveOperation::Autosave)
    }

    /// Whether the save may retain a version in the version store.
    pub fn creates_version(&self) -> bool {
        matches!(self, SaveOperation::Save | SaveOperation::SaveAs)
    }

    pub(crate) fn working_state(&self) -> DocumentState {
        match self {
            SaveOperation::Autosave => DocumentState::Autosaving,
            _ => DocumentState::Saving,
        }
    }
}

impl fmt::Display for SaveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaveOperation::Save => "save",
            SaveOperation::Autosave => "autosave",
            SaveOperation::SaveAs => "save-as",
            SaveOperation::SaveTo => "save-to",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Done,
    Undone,
    Redone,
    /// The in-memory content matches what is on disk again.
    Cleared,
}

/// A change registered against a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub undoable: bool,
}

impl DocumentChange {
    pub fn done() -> Self {
        Self::of(ChangeKind::Done)
    }

    pub fn undone() -> Self {
        Self::of(ChangeKind::Undone)
    }

    pub fn redone() -> Self {
        Self::of(ChangeKind::Redone)
    }

    pub fn cleared() -> Self {
        Self::of(ChangeKind::Cleared)
    }

    /// Mark the change as one the undo history must not record.
    pub fn not_undoable(mut self) -> Self {
        self.undoable = false;
        self
    }

    fn of(kind: ChangeKind) -> Self {
        Self {
            kind,
            undoable: true,
        }
    }
}

/// Undo history hook. Receives every registered change.
pub trait ChangeRecorder: Send + Sync {
    fn record(&self, kind: ChangeKind, undoable: bool);

    /// Start a new undo group at the next change.
    fn break_coalescing(&self) {}
}

/// Mutable document state, guarded by the document's state lock.
pub(crate) struct DocumentCell<T> {
    pub state: DocumentState,
    pub location: PathBuf,
    pub content: Option<T>,
    pub change_token: Option<ChangeToken>,
    /// Token of the item as this document last read or wrote it.
    pub disk_token: Option<ChangeToken>,
    pub has_unsaved_changes: bool,
    /// Bumped by every change that leaves the persisted state.
    pub change_generation: u64,
    pub editing_disabled: u32,
    pub last_read_error: Option<DocumentError>,
    pub last_write_error: Option<DocumentError>,
    pub last_open_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
    pub file_modification_date: Option<DateTime<Utc>>,
    pub last_version_at: Option<Instant>,
    pub conflicts: ConflictTracker,
}

impl<T> DocumentCell<T> {
    pub fn new(location: PathBuf) -> Self {
        Self {
            state: DocumentState::Closed,
            location,
            content: None,
            change_token: None,
            disk_token: None,
            has_unsaved_changes: false,
            change_generation: 0,
            editing_disabled: 0,
            last_read_error: None,
            last_write_error: None,
            last_open_date: None,
            change_date: None,
            file_modification_date: None,
            last_version_at: None,
            conflicts: ConflictTracker::default(),
        }
    }

    /// Drop content and session state, keeping the location.
    pub fn unload(&mut self, state: DocumentState) {
        self.state = state;
        self.content = None;
        self.change_token = None;
        self.disk_token = None;
        self.has_unsaved_changes = false;
        self.conflicts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_loaded_states_have_content() {
        assert!(DocumentState::Open.has_content());
        assert!(DocumentState::Autosaving.has_content());
        assert!(!DocumentState::Closed.has_content());
        assert!(!DocumentState::Opening.has_content());
        assert!(!DocumentState::Deleted.has_content());
    }

    #[test]
    fn save_operations_differ_in_what_they_adopt() {
        assert!(SaveOperation::Save.moves_item());
        assert!(!SaveOperation::SaveAs.moves_item());
        assert!(SaveOperation::SaveAs.adopts_location());
        assert!(!SaveOperation::SaveTo.adopts_location());
        assert!(!SaveOperation::Autosave.creates_version());
        assert_eq!(SaveOperation::Autosave.working_state(), DocumentState::Autosaving);
    }

    #[test]
    fn changes_default_to_undoable() {
        assert!(DocumentChange::done().undoable);
        assert!(!DocumentChange::done().not_undoable().undoable);
        assert_eq!(DocumentChange::cleared().kind, ChangeKind::Cleared);
    }
}
