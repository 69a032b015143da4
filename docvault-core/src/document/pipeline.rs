//! Synchronous read/save/revert pipeline.
//!
//! Everything here runs on the calling thread and may block on coordination.
//! The async API runs these same steps on the document's serial queue.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::conflict::ConflictChange;
use super::state::{DocumentState, SaveOperation};
use super::DocumentInner;
use crate::codec::FormatCodec;
use crate::coordination::{FileVersion, WriteIntent};
use crate::error::{DocumentError, Result};
use crate::events::DocumentEvent;
use crate::fsutil;
use crate::token::ChangeToken;

/// Why content is being re-read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RevertCause {
    /// Requested by the owner; reverting from the own location settles
    /// outstanding conflicts.
    Explicit,
    /// The item changed on disk underneath a clean document.
    External,
}

impl<C: FormatCodec> DocumentInner<C> {
    // ----- reading -----

    /// Decode the item at `location` into the document.
    pub(crate) fn read_from(&self, location: &Path) -> Result<()> {
        {
            let cell = self.cell.lock();
            if matches!(
                cell.state,
                DocumentState::Closed | DocumentState::Closing | DocumentState::Deleted
            ) {
                return Err(DocumentError::InvalidState {
                    operation: "read",
                    state: cell.state,
                });
            }
        }

        let representation =
            fsutil::read_representation(location).map_err(|e| DocumentError::read(location, e))?;
        let content = self
            .codec
            .read(representation)
            .map_err(|e| DocumentError::read(location, e))?;
        let token = ChangeToken::for_location(location, &self.codec.token_attributes())
            .map_err(|e| DocumentError::read(location, e))?;

        let mut cell = self.cell.lock();
        if matches!(
            cell.state,
            DocumentState::Closed | DocumentState::Closing | DocumentState::Deleted
        ) {
            return Err(DocumentError::InvalidState {
                operation: "read",
                state: cell.state,
            });
        }
        cell.content = Some(content);
        cell.change_token = Some(token.clone());
        cell.disk_token = Some(token);
        cell.has_unsaved_changes = false;
        cell.change_generation += 1;
        cell.file_modification_date = fsutil::modification_date(location);
        Ok(())
    }

    pub(crate) fn open(&self) -> Result<()> {
        let location = {
            let cell = self.cell.lock();
            if cell.state != DocumentState::Closed {
                return Err(DocumentError::InvalidState {
                    operation: "open",
                    state: cell.state,
                });
            }
            cell.location.clone()
        };
        let result = self
            .coordinator
            .coordinate_read(&location, None, &mut |loc| self.open_from(loc));
        if let Err(e) = &result {
            self.cell.lock().last_read_error = Some(e.clone());
        }
        result
    }

    /// Open from `location`. Callers hold read coordination on it.
    pub(crate) fn open_from(&self, location: &Path) -> Result<()> {
        {
            let mut cell = self.cell.lock();
            if cell.state != DocumentState::Closed {
                return Err(DocumentError::InvalidState {
                    operation: "open",
                    state: cell.state,
                });
            }
            cell.state = DocumentState::Opening;
            cell.last_read_error = None;
        }

        if let Err(e) = self.read_from(location) {
            tracing::warn!(document = %self.id, location = %location.display(), "open failed: {}", e);
            let mut cell = self.cell.lock();
            cell.unload(DocumentState::Closed);
            cell.last_read_error = Some(e.clone());
            return Err(e);
        }

        {
            let mut cell = self.cell.lock();
            cell.state = DocumentState::Open;
            cell.location = location.to_path_buf();
            cell.last_open_date = Some(Utc::now());
        }
        self.relay
            .begin_presentation(self.coordinator.as_ref(), location);
        self.refresh_conflicts();

        tracing::info!(document = %self.id, location = %location.display(), "document opened");
        self.events.send(DocumentEvent::Opened {
            id: self.id,
            location: location.to_path_buf(),
        });
        Ok(())
    }

    // ----- saving -----

    /// Save to `target`, acquiring coordination on this thread.
    pub(crate) fn save_to(&self, target: &Path, operation: SaveOperation) -> Result<()> {
        let current = self.enter_save(operation)?;
        let acting = self.relay.presenter_id();

        let result = if operation.moves_item() && !fsutil::same_location(target, &current) {
            self.coordinator
                .coordinate_move(&current, target, acting, &mut |_, to| self.write_to(to, operation))
        } else {
            self.coordinator.coordinate_write(
                target,
                WriteIntent::Replacing,
                acting,
                &mut |loc| self.write_to(loc, operation),
            )
        };

        self.leave_save(operation, target, &result);
        result
    }

    /// Save to `target`. Callers hold write coordination on `target`, and on
    /// the current location too when a save moves the item.
    pub(crate) fn coordinated_save_to(&self, target: &Path, operation: SaveOperation) -> Result<()> {
        self.enter_save(operation)?;
        let result = self.write_to(target, operation);
        self.leave_save(operation, target, &result);
        result
    }

    pub(crate) fn autosave_if_needed(&self) -> Result<()> {
        let location = {
            let cell = self.cell.lock();
            if self.read_only || !cell.state.has_content() || !cell.has_unsaved_changes {
                tracing::debug!(document = %self.id, "nothing to autosave");
                return Ok(());
            }
            cell.location.clone()
        };
        self.save_to(&location, SaveOperation::Autosave)
    }

    fn enter_save(&self, operation: SaveOperation) -> Result<PathBuf> {
        if self.read_only && operation != SaveOperation::SaveTo {
            return Err(DocumentError::ReadOnly);
        }
        let mut cell = self.cell.lock();
        if cell.state != DocumentState::Open {
            return Err(DocumentError::InvalidState {
                operation: "save",
                state: cell.state,
            });
        }
        cell.state = operation.working_state();
        Ok(cell.location.clone())
    }

    fn leave_save(&self, operation: SaveOperation, target: &Path, result: &Result<()>) {
        {
            let mut cell = self.cell.lock();
            if matches!(cell.state, DocumentState::Saving | DocumentState::Autosaving) {
                cell.state = DocumentState::Open;
            }
            cell.last_write_error = result.as_ref().err().cloned();
        }
        match result {
            Ok(()) => {
                tracing::info!(document = %self.id, %operation, location = %target.display(), "document saved");
                self.refresh_conflicts();
            }
            Err(e) => {
                tracing::warn!(document = %self.id, %operation, location = %target.display(), "save failed: {}", e);
            }
        }
    }

    /// Encode and publish the content at `target`.
    fn write_to(&self, target: &Path, operation: SaveOperation) -> Result<()> {
        let (representation, generation, previous) = {
            let cell = self.cell.lock();
            let content = cell.content.as_ref().ok_or(DocumentError::InvalidState {
                operation: "save",
                state: cell.state,
            })?;
            let representation = self
                .codec
                .write(content)
                .map_err(|e| DocumentError::write(target, e))?;
            (representation, cell.change_generation, cell.location.clone())
        };

        let relocating = operation.adopts_location() && !fsutil::same_location(target, &previous);
        let moved = relocating && operation.moves_item() && previous.exists();
        if moved {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DocumentError::write(target, e))?;
            }
            std::fs::rename(&previous, target).map_err(|e| DocumentError::write(target, e))?;
        }
        if let Err(e) = fsutil::write_representation_atomically(target, &representation) {
            // put the item back where the document still points
            if moved {
                if let Err(back) = std::fs::rename(target, &previous) {
                    tracing::error!(
                        document = %self.id,
                        from = %target.display(),
                        to = %previous.display(),
                        "could not restore item after failed save: {}",
                        back
                    );
                }
            }
            return Err(DocumentError::write(target, e));
        }

        if operation.creates_version() {
            self.retain_version(target);
        }
        if !operation.adopts_location() {
            return Ok(());
        }

        self.events.send(DocumentEvent::Persisted {
            id: self.id,
            location: target.to_path_buf(),
            operation,
        });

        let token = match ChangeToken::for_location(target, &self.codec.token_attributes()) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(document = %self.id, "no change token after save: {}", e);
                None
            }
        };
        {
            let mut cell = self.cell.lock();
            if !matches!(cell.state, DocumentState::Saving | DocumentState::Autosaving) {
                tracing::debug!(document = %self.id, state = %cell.state, "document closed while saving");
                return Ok(());
            }
            cell.location = target.to_path_buf();
            cell.disk_token = token.clone();
            cell.file_modification_date = fsutil::modification_date(target);
            // Changes registered while the write ran keep the document dirty.
            if cell.change_generation == generation {
                cell.has_unsaved_changes = false;
                if self.codec.is_round_trip_consistent() {
                    if let Some(token) = token {
                        cell.change_token = Some(token);
                    }
                }
            }
        }

        if relocating {
            self.relay.set_location(target);
            tracing::info!(
                document = %self.id,
                from = %previous.display(),
                to = %target.display(),
                "location changed by saving"
            );
            self.events.send(DocumentEvent::LocationChangedBySaving {
                id: self.id,
                from: previous,
                to: target.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Ask the version store for a retained copy, at most once per
    /// autoversioning interval.
    fn retain_version(&self, location: &Path) {
        let Some(interval) = self.config.autoversioning_interval() else {
            return;
        };
        let due = self
            .cell
            .lock()
            .last_version_at
            .map_or(true, |at| at.elapsed() >= interval);
        if !due {
            return;
        }
        match self.coordinator.add_version(location) {
            Ok(version) => {
                tracing::debug!(document = %self.id, version = %version.id, "retained version");
                self.cell.lock().last_version_at = Some(Instant::now());
            }
            Err(e) => {
                tracing::warn!(document = %self.id, "could not retain version: {}", e);
            }
        }
    }

    // ----- reverting -----

    pub(crate) fn revert(&self, location: &Path, cause: RevertCause) -> Result<()> {
        self.enter_revert()?;
        let acting = self.relay.presenter_id();
        let result = self.coordinator.coordinate_read(location, acting, &mut |loc| {
            self.read_from(loc)
        });
        self.leave_revert(location, cause, result)
    }

    /// Revert from `location`. Callers hold read coordination on it.
    pub(crate) fn coordinated_revert_from(&self, location: &Path) -> Result<()> {
        self.enter_revert()?;
        let result = self.read_from(location);
        self.leave_revert(location, RevertCause::Explicit, result)
    }

    fn enter_revert(&self) -> Result<()> {
        let mut cell = self.cell.lock();
        if cell.state != DocumentState::Open {
            return Err(DocumentError::InvalidState {
                operation: "revert",
                state: cell.state,
            });
        }
        cell.state = DocumentState::Reverting;
        Ok(())
    }

    fn leave_revert(&self, source: &Path, cause: RevertCause, result: Result<()>) -> Result<()> {
        let own_location = {
            let mut cell = self.cell.lock();
            if cell.state == DocumentState::Reverting {
                cell.state = DocumentState::Open;
            }
            match &result {
                Ok(()) => {
                    let now = Utc::now();
                    cell.last_open_date = Some(now);
                    cell.change_date = Some(now);
                    cell.last_read_error = None;
                }
                Err(e) => cell.last_read_error = Some(e.clone()),
            }
            cell.location.clone()
        };

        if let Err(e) = result {
            tracing::warn!(document = %self.id, source = %source.display(), "revert failed: {}", e);
            return Err(e);
        }

        if cause == RevertCause::Explicit && fsutil::same_location(source, &own_location) {
            if let Err(e) = self.coordinator.resolve_conflicts(&own_location) {
                tracing::warn!(document = %self.id, "could not resolve conflicts: {}", e);
            }
        }
        self.refresh_conflicts();

        tracing::info!(document = %self.id, source = %source.display(), ?cause, "document reverted");
        self.events.send(DocumentEvent::Reverted {
            id: self.id,
            location: source.to_path_buf(),
        });
        Ok(())
    }

    pub(crate) fn replace_with_version(&self, version: &FileVersion) -> Result<()> {
        if self.read_only {
            return Err(DocumentError::ReadOnly);
        }
        let location = {
            let cell = self.cell.lock();
            if cell.state != DocumentState::Open {
                return Err(DocumentError::InvalidState {
                    operation: "replace with version",
                    state: cell.state,
                });
            }
            cell.location.clone()
        };

        let acting = self.relay.presenter_id();
        self.coordinator.coordinate_write(
            &location,
            WriteIntent::Replacing,
            acting,
            &mut |loc| {
                self.coordinator
                    .replace_item_with_version(loc, version)
                    .map_err(|e| DocumentError::write(loc, e))?;
                self.coordinator
                    .resolve_conflicts(loc)
                    .map_err(|e| DocumentError::coordination(loc, e))
            },
        )?;
        tracing::info!(document = %self.id, version = %version.id, "replaced item with version");
        self.revert(&location, RevertCause::Explicit)
    }

    // ----- external activity -----

    /// Re-read the item if it changed on disk and the document is clean.
    pub(crate) fn check_external_change(&self) -> Result<()> {
        let (location, disk_token, unsaved) = {
            let cell = self.cell.lock();
            if cell.state != DocumentState::Open {
                return Ok(());
            }
            (cell.location.clone(), cell.disk_token.clone(), cell.has_unsaved_changes)
        };

        let fresh = match ChangeToken::for_location(&location, &self.codec.token_attributes()) {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(document = %self.id, "item unavailable after change notice: {}", e);
                return Ok(());
            }
        };
        if let Some(known) = disk_token {
            if known.matches(&fresh).unwrap_or(false) {
                return Ok(());
            }
        }

        if unsaved {
            tracing::warn!(document = %self.id, location = %location.display(), "item changed on disk while document has unsaved changes");
            self.events.send(DocumentEvent::ExternalChange { id: self.id, location });
            return Ok(());
        }
        self.revert(&location, RevertCause::External)
    }

    pub(crate) fn refresh_conflicts(&self) {
        let location = {
            let cell = self.cell.lock();
            if !cell.state.has_content() {
                return;
            }
            cell.location.clone()
        };
        let current = self.coordinator.current_version(&location);
        let conflicts = self.coordinator.conflict_versions(&location);
        let change = self.cell.lock().conflicts.refresh(current, conflicts);

        match change {
            ConflictChange::Detected { conflicts } => {
                tracing::info!(document = %self.id, conflicts, "conflicting versions detected");
                self.events.send(DocumentEvent::ConflictDetected {
                    id: self.id,
                    location,
                    conflicts,
                });
            }
            ConflictChange::Resolved => {
                tracing::info!(document = %self.id, "conflicts resolved");
                self.events.send(DocumentEvent::ConflictResolved { id: self.id, location });
            }
            ConflictChange::Unchanged => {}
        }
    }

    // ----- closing and deleting -----

    pub(crate) fn close(&self) -> Result<()> {
        {
            let cell = self.cell.lock();
            match cell.state {
                DocumentState::Closed => return Ok(()),
                DocumentState::Deleted => {
                    return Err(DocumentError::InvalidState {
                        operation: "close",
                        state: cell.state,
                    })
                }
                _ => {}
            }
        }
        self.autosave.cancel();
        let saved = self.autosave_if_needed();
        self.shut_down(DocumentState::Closed);
        if let Err(e) = &saved {
            self.report_unhandled(e.clone());
        }
        saved
    }

    pub(crate) fn close_immediately(&self) {
        self.autosave.cancel();
        if !matches!(self.cell.lock().state, DocumentState::Closed | DocumentState::Deleted) {
            self.shut_down(DocumentState::Closed);
        }
    }

    pub(crate) fn delete(&self) -> Result<()> {
        if self.read_only {
            return Err(DocumentError::ReadOnly);
        }
        let location = {
            let cell = self.cell.lock();
            if !matches!(cell.state, DocumentState::Open | DocumentState::Closed) {
                return Err(DocumentError::InvalidState {
                    operation: "delete",
                    state: cell.state,
                });
            }
            cell.location.clone()
        };
        self.autosave.cancel();

        let acting = self.relay.presenter_id();
        self.coordinator.coordinate_write(
            &location,
            WriteIntent::Deleting,
            acting,
            &mut |loc| fsutil::remove_item(loc).map_err(|e| DocumentError::write(loc, e)),
        )?;

        // deleting passes through Closed
        if self.cell.lock().state != DocumentState::Closed {
            self.shut_down(DocumentState::Closed);
        }
        self.cell.lock().state = DocumentState::Deleted;
        tracing::info!(document = %self.id, location = %location.display(), "document deleted");
        self.events.send(DocumentEvent::Deleted { id: self.id, location });
        Ok(())
    }

    /// Drop content and stop presenting.
    pub(crate) fn shut_down(&self, state: DocumentState) {
        self.cell.lock().state = DocumentState::Closing;
        self.relay.end_presentation(self.coordinator.as_ref());
        self.cell.lock().unload(state);
        tracing::info!(document = %self.id, "document closed");
        self.events.send(DocumentEvent::Closed { id: self.id });
    }

    pub(crate) fn report_unhandled(&self, error: DocumentError) {
        let location = self.cell.lock().location.clone();
        tracing::error!(document = %self.id, location = %location.display(), "unhandled save error: {}", error);
        self.events.send(DocumentEvent::UnhandledSaveError {
            id: self.id,
            location,
            error,
        });
    }
}
