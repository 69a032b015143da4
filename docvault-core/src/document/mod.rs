//! File-backed document with coordinated open, save, revert and delete.
//!
//! A [`Document`] is a cheap handle. Async operations are queued on a
//! per-document serial queue and run one at a time, each on the blocking
//! pool under a deadlock detector. The synchronous `coordinated_*` forms are
//! the building blocks those jobs use; callers invoking them directly must
//! already hold the matching coordination.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::autosave::AutosaveScheduler;
use crate::codec::FormatCodec;
use crate::config::DocumentConfig;
use crate::coordination::{CoordinationService, FilePresenter, FileVersion};
use crate::deadlock::{DeadlockDelegate, DeadlockDetector};
use crate::error::{DocumentError, Result};
use crate::events::{DocumentEvent, EventBus};
use crate::queue::SerialQueue;
use crate::relay::PresentationRelay;
use crate::token::ChangeToken;

pub mod conflict;
mod pipeline;
pub mod state;

pub use conflict::{ConflictChange, ConflictTracker};
pub use state::{ChangeKind, ChangeRecorder, DocumentChange, DocumentState, SaveOperation};

use pipeline::RevertCause;
use state::DocumentCell;

const UNTITLED: &str = "Untitled";

/// Identifies a queued operation to the deadlock detector.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub document: Uuid,
    pub operation: &'static str,
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on document {}", self.operation, self.document)
    }
}

pub(crate) struct DocumentInner<C: FormatCodec> {
    id: Uuid,
    codec: Arc<C>,
    coordinator: Arc<dyn CoordinationService>,
    config: DocumentConfig,
    events: EventBus,
    recorder: Option<Arc<dyn ChangeRecorder>>,
    read_only: bool,
    cell: Mutex<DocumentCell<C::Content>>,
    relay: Arc<PresentationRelay>,
    queue: SerialQueue,
    autosave: AutosaveScheduler,
    runtime: Handle,
    this: Weak<DocumentInner<C>>,
}

pub struct Document<C: FormatCodec> {
    inner: Arc<DocumentInner<C>>,
}

impl<C: FormatCodec> Clone for Document<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct DocumentBuilder<C: FormatCodec> {
    location: PathBuf,
    codec: C,
    coordinator: Arc<dyn CoordinationService>,
    config: DocumentConfig,
    events: Option<EventBus>,
    recorder: Option<Arc<dyn ChangeRecorder>>,
    read_only: bool,
}

impl<C: FormatCodec> DocumentBuilder<C> {
    pub fn config(mut self, config: DocumentConfig) -> Self {
        self.config = config;
        self
    }

    /// Bus for this document's events. Defaults to [`EventBus::shared`].
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn change_recorder(mut self, recorder: Arc<dyn ChangeRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Create the document in the `Closed` state.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn build(self) -> Document<C> {
        let runtime = Handle::current();
        let id = Uuid::new_v4();
        let inner = Arc::new_cyclic(|this: &Weak<DocumentInner<C>>| {
            let owner: Weak<dyn FilePresenter> = this.clone();
            DocumentInner {
                id,
                codec: Arc::new(self.codec),
                coordinator: self.coordinator,
                config: self.config,
                events: self.events.unwrap_or_else(EventBus::shared),
                recorder: self.recorder,
                read_only: self.read_only,
                cell: Mutex::new(DocumentCell::new(self.location)),
                relay: PresentationRelay::new(owner),
                queue: SerialQueue::new(format!("document-{id}"), &runtime),
                autosave: AutosaveScheduler::new(runtime.clone()),
                runtime,
                this: this.clone(),
            }
        });
        Document { inner }
    }
}

impl<C: FormatCodec> Document<C> {
    pub fn builder(
        location: impl Into<PathBuf>,
        codec: C,
        coordinator: Arc<dyn CoordinationService>,
    ) -> DocumentBuilder<C> {
        DocumentBuilder {
            location: location.into(),
            codec,
            coordinator,
            config: DocumentConfig::default(),
            events: None,
            recorder: None,
            read_only: false,
        }
    }

    // ----- properties -----

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn location(&self) -> PathBuf {
        self.inner.cell.lock().location.clone()
    }

    pub fn file_type(&self) -> &str {
        self.inner.codec.file_type()
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> DocumentState {
        self.inner.cell.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state().has_content()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.cell.lock().has_unsaved_changes
    }

    /// Token for the current content state; `None` while closed.
    pub fn change_token(&self) -> Option<ChangeToken> {
        self.inner.cell.lock().change_token.clone()
    }

    pub fn last_read_error(&self) -> Option<DocumentError> {
        self.inner.cell.lock().last_read_error.clone()
    }

    pub fn last_write_error(&self) -> Option<DocumentError> {
        self.inner.cell.lock().last_write_error.clone()
    }

    /// Last time content was read from disk, by open or revert.
    pub fn last_open_date(&self) -> Option<DateTime<Utc>> {
        self.inner.cell.lock().last_open_date
    }

    pub fn change_date(&self) -> Option<DateTime<Utc>> {
        self.inner.cell.lock().change_date
    }

    /// Last known modification date of the item on disk.
    pub fn file_modification_date(&self) -> Option<DateTime<Utc>> {
        self.inner.cell.lock().file_modification_date
    }

    pub fn current_version(&self) -> Option<FileVersion> {
        self.inner.cell.lock().conflicts.current().cloned()
    }

    pub fn conflict_versions(&self) -> Vec<FileVersion> {
        self.inner.cell.lock().conflicts.conflicts().to_vec()
    }

    pub fn has_conflicts(&self) -> bool {
        self.inner.cell.lock().conflicts.has_conflicts()
    }

    /// Operations queued or running.
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.pending()
    }

    pub fn is_autosave_armed(&self) -> bool {
        self.inner.autosave.is_armed()
    }

    // ----- file names -----

    /// Name to use for the next write: the current file name.
    pub fn preferred_filename(&self) -> String {
        self.location()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNTITLED.to_string())
    }

    /// Location a save of kind `operation` would write to when no explicit
    /// location is given: the current directory, the preferred file stem and
    /// the codec's extension.
    pub fn location_for_save_operation(&self, operation: SaveOperation, ignore_current_name: bool) -> PathBuf {
        let location = self.location();
        let stem = if ignore_current_name {
            UNTITLED.to_string()
        } else {
            let preferred = self.preferred_filename();
            let stem = Path::new(&preferred)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            sanitize_file_stem(&stem)
        };
        let name = format!("{stem}.{}", self.inner.codec.default_extension());
        tracing::trace!(document = %self.inner.id, %operation, %name, "composed save location");
        match location.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    // ----- content and change registration -----

    /// Read access to the loaded content.
    pub fn with_content<R>(&self, f: impl FnOnce(&C::Content) -> R) -> Result<R> {
        let cell = self.inner.cell.lock();
        match cell.content.as_ref() {
            Some(content) => Ok(f(content)),
            None => Err(DocumentError::InvalidState {
                operation: "access content",
                state: cell.state,
            }),
        }
    }

    /// Mutate the content and register `change` in one step.
    pub fn modify<R>(&self, change: DocumentChange, f: impl FnOnce(&mut C::Content) -> R) -> Result<R> {
        let output = {
            let mut cell = self.inner.cell.lock();
            self.inner.check_editable(&cell, "modify")?;
            let state = cell.state;
            let content = cell.content.as_mut().ok_or(DocumentError::InvalidState {
                operation: "modify",
                state,
            })?;
            let output = f(content);
            apply_change(&mut cell, change);
            output
        };
        self.inner.after_change(change);
        Ok(output)
    }

    /// Register a change made to the content through other means.
    pub fn update_change_count(&self, change: DocumentChange) -> Result<()> {
        {
            let mut cell = self.inner.cell.lock();
            self.inner.check_editable(&cell, "register change")?;
            apply_change(&mut cell, change);
        }
        self.inner.after_change(change);
        Ok(())
    }

    /// Block change registration until a matching [`enable_editing`](Self::enable_editing).
    pub fn disable_editing(&self) {
        self.inner.cell.lock().editing_disabled += 1;
    }

    pub fn enable_editing(&self) {
        let mut cell = self.inner.cell.lock();
        cell.editing_disabled = cell.editing_disabled.saturating_sub(1);
    }

    pub fn is_editing_enabled(&self) -> bool {
        let cell = self.inner.cell.lock();
        !self.inner.read_only && cell.editing_disabled == 0 && cell.state != DocumentState::Reverting
    }

    pub fn break_undo_coalescing(&self) {
        if let Some(recorder) = &self.inner.recorder {
            recorder.break_coalescing();
        }
    }

    pub fn update_change_date(&self) {
        self.inner.cell.lock().change_date = Some(Utc::now());
    }

    /// Whether the item on disk moved away from what this document last
    /// read or wrote.
    pub fn has_external_changes(&self) -> Result<bool> {
        let (location, known) = {
            let cell = self.inner.cell.lock();
            (cell.location.clone(), cell.disk_token.clone())
        };
        let Some(known) = known else {
            return Ok(false);
        };
        let fresh = ChangeToken::for_location(&location, &self.inner.codec.token_attributes())?;
        Ok(!known.matches(&fresh)?)
    }

    // ----- synchronous forms -----

    /// Decode the item at `location` into the document. Callers hold read
    /// coordination.
    pub fn read_from(&self, location: &Path) -> Result<()> {
        self.inner.read_from(location)
    }

    pub fn coordinated_open_from(&self, location: &Path) -> Result<()> {
        self.inner.open_from(location)
    }

    pub fn coordinated_save_to(&self, location: &Path, operation: SaveOperation) -> Result<()> {
        self.inner.coordinated_save_to(location, operation)
    }

    /// Save on the calling thread, acquiring coordination. Must not be
    /// called from async code.
    pub fn save_to_blocking(&self, location: &Path, operation: SaveOperation) -> Result<()> {
        self.inner.save_to(location, operation)
    }

    pub fn coordinated_revert_from(&self, location: &Path) -> Result<()> {
        self.inner.coordinated_revert_from(location)
    }

    /// Close without saving. Unsaved changes are discarded.
    pub fn close_immediately(&self) {
        self.inner.close_immediately()
    }

    // ----- asynchronous forms -----
    //
    // Each call enqueues its job immediately; the returned future only waits
    // for the result.

    pub fn open(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.submit("open", |d| d.open())
    }

    /// Save to the current location.
    pub fn save(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.autosave.cancel();
        self.inner.submit("save", |d| {
            let location = d.cell.lock().location.clone();
            d.save_to(&location, SaveOperation::Save)
        })
    }

    pub fn save_to(
        &self,
        location: impl Into<PathBuf>,
        operation: SaveOperation,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let location = location.into();
        if operation != SaveOperation::SaveTo {
            self.inner.autosave.cancel();
        }
        self.inner
            .submit("save", move |d| d.save_to(&location, operation))
    }

    /// Save if there are unsaved changes when the job runs.
    pub fn autosave(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.submit("autosave", |d| d.autosave_if_needed())
    }

    /// Autosave, then close regardless of the outcome. A failed autosave is
    /// returned and also published as [`DocumentEvent::UnhandledSaveError`].
    pub fn close(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.autosave.cancel();
        self.inner.submit("close", |d| d.close())
    }

    pub fn delete(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.submit("delete", |d| d.delete())
    }

    pub fn revert_to(&self, location: impl Into<PathBuf>) -> impl Future<Output = Result<()>> + Send + 'static {
        let location = location.into();
        self.inner
            .submit("revert", move |d| d.revert(&location, RevertCause::Explicit))
    }

    pub fn replace_with_version(
        &self,
        version: FileVersion,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner
            .submit("replace with version", move |d| d.replace_with_version(&version))
    }

    /// Save without awaiting the result. Failures are published as
    /// [`DocumentEvent::UnhandledSaveError`].
    pub fn save_in_background(&self) {
        self.inner.autosave.cancel();
        let inner = self.inner.clone();
        let saving = self.save();
        self.inner.runtime.spawn(async move {
            if let Err(e) = saving.await {
                inner.report_unhandled(e);
            }
        });
    }
}

impl<C: FormatCodec> fmt::Debug for Document<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.inner.cell.lock();
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("location", &cell.location)
            .field("state", &cell.state)
            .field("has_unsaved_changes", &cell.has_unsaved_changes)
            .finish()
    }
}

fn apply_change<T>(cell: &mut DocumentCell<T>, change: DocumentChange) {
    cell.change_generation += 1;
    match change.kind {
        ChangeKind::Done | ChangeKind::Undone | ChangeKind::Redone => {
            cell.has_unsaved_changes = true;
            cell.change_token = Some(ChangeToken::in_memory());
        }
        ChangeKind::Cleared => {
            cell.has_unsaved_changes = false;
            if let Some(token) = cell.disk_token.clone() {
                cell.change_token = Some(token);
            }
        }
    }
    cell.change_date = Some(Utc::now());
}

fn sanitize_file_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') || c.is_control() { '-' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        UNTITLED.to_string()
    } else {
        cleaned
    }
}

impl<C: FormatCodec> DocumentInner<C> {
    fn check_editable(&self, cell: &DocumentCell<C::Content>, operation: &'static str) -> Result<()> {
        if !cell.state.has_content() {
            return Err(DocumentError::InvalidState {
                operation,
                state: cell.state,
            });
        }
        if self.read_only {
            return Err(DocumentError::ReadOnly);
        }
        if cell.editing_disabled > 0 || cell.state == DocumentState::Reverting {
            return Err(DocumentError::EditingDisabled);
        }
        Ok(())
    }

    fn after_change(&self, change: DocumentChange) {
        if let Some(recorder) = &self.recorder {
            recorder.record(change.kind, change.undoable);
        }
        if change.kind == ChangeKind::Cleared {
            self.autosave.cancel();
        } else {
            self.schedule_autosave();
        }
    }

    fn schedule_autosave(&self) {
        let location = self.cell.lock().location.clone();
        let delay = if self.coordinator.is_remotely_synced(&location) {
            self.config.remote_autosave_delay()
        } else {
            self.config.autosave_delay()
        };
        let this = self.this.clone();
        self.autosave.schedule(delay, move || {
            if let Some(inner) = this.upgrade() {
                inner.autosave_in_background();
            }
        });
    }

    fn autosave_in_background(self: &Arc<Self>) {
        let inner = self.clone();
        let saving = self.submit("autosave", |d| d.autosave_if_needed());
        self.runtime.spawn(async move {
            if let Err(e) = saving.await {
                inner.report_unhandled(e);
            }
        });
    }

    /// Queue `work` and return a future for its result. The job runs on the
    /// blocking pool under a deadlock detector.
    fn submit<T, F>(self: &Arc<Self>, operation: &'static str, work: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&DocumentInner<C>) -> Result<T> + Send + 'static,
    {
        let inner = self.clone();
        let submitted = self.queue.submit(async move { inner.run_guarded(operation, work).await });
        async move {
            let rx = submitted?;
            rx.await.map_err(|_| DocumentError::QueueClosed)?
        }
    }

    async fn run_guarded<T, F>(self: Arc<Self>, operation: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentInner<C>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let delegate: Weak<dyn DeadlockDelegate<OperationContext>> = self.this.clone();
        let context = OperationContext {
            document: self.id,
            operation,
        };
        let worker = self.clone();
        DeadlockDetector::perform(context, self.config.operation_timeout(), delegate, move |completion| {
            tokio::task::spawn_blocking(move || {
                let result = work(worker.as_ref());
                drop(completion);
                let _ = tx.send(result);
            });
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(document = %self.id, operation, "operation aborted");
                Err(DocumentError::QueueClosed)
            }
        }
    }

    /// Run `work` on the queue, logging failures.
    fn enqueue_background<F>(&self, operation: &'static str, work: F)
    where
        F: FnOnce(&DocumentInner<C>) -> Result<()> + Send + 'static,
    {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let id = self.id;
        let running = inner.submit(operation, work);
        self.runtime.spawn(async move {
            if let Err(e) = running.await {
                tracing::warn!(document = %id, operation, "background operation failed: {}", e);
            }
        });
    }
}

impl<C: FormatCodec> FilePresenter for DocumentInner<C> {
    fn presented_location(&self) -> Option<PathBuf> {
        let cell = self.cell.lock();
        cell.state.has_content().then(|| cell.location.clone())
    }

    fn presented_item_did_change(&self) {
        self.enqueue_background("revert check", |d| d.check_external_change());
    }

    fn presented_subitem_did_change(&self, subitem: &Path) {
        if self.codec.handles_subitem_changes() {
            tracing::debug!(document = %self.id, subitem = %subitem.display(), "package item changed");
            self.enqueue_background("revert check", |d| d.check_external_change());
        }
    }

    fn presented_item_did_move(&self, to: &Path) {
        let from = {
            let mut cell = self.cell.lock();
            std::mem::replace(&mut cell.location, to.to_path_buf())
        };
        tracing::info!(document = %self.id, from = %from.display(), to = %to.display(), "item moved");
        self.events.send(DocumentEvent::Moved {
            id: self.id,
            from,
            to: to.to_path_buf(),
        });
    }

    fn accommodate_deletion(&self) {
        tracing::warn!(document = %self.id, "item is being deleted by another participant");
        self.enqueue_background("close after deletion", |d| {
            d.close_immediately();
            Ok(())
        });
    }

    fn presented_item_did_gain_version(&self, _version: &FileVersion) {
        self.enqueue_background("conflict refresh", |d| {
            d.refresh_conflicts();
            Ok(())
        });
    }

    fn presented_item_did_resolve_conflict(&self, _version: &FileVersion) {
        self.enqueue_background("conflict refresh", |d| {
            d.refresh_conflicts();
            Ok(())
        });
    }
}

impl<C: FormatCodec> DeadlockDelegate<OperationContext> for DocumentInner<C> {
    fn deadlock_detector_did_exceed_time_limit(&self, detector: &DeadlockDetector<OperationContext>) {
        let context = detector.context();
        let elapsed = detector.elapsed();
        tracing::warn!(
            document = %self.id,
            operation = context.operation,
            ?elapsed,
            "operation exceeded its time limit"
        );
        self.events.send(DocumentEvent::OperationStalled {
            id: self.id,
            context: context.to_string(),
            elapsed,
        });
    }
}

impl<C: FormatCodec> Drop for DocumentInner<C> {
    fn drop(&mut self) {
        self.relay.end_presentation(self.coordinator.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainTextCodec;
    use crate::coordination::LocalCoordinator;

    fn document(dir: &Path, name: &str) -> Document<PlainTextCodec> {
        let coordinator: Arc<dyn CoordinationService> =
            Arc::new(LocalCoordinator::new(dir.join("versions")).unwrap());
        Document::builder(dir.join(name), PlainTextCodec, coordinator)
            .events(EventBus::new())
            .build()
    }

    #[tokio::test]
    async fn save_locations_use_codec_extension() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(dir.path(), "notes.md");
        assert_eq!(doc.preferred_filename(), "notes.md");
        assert_eq!(
            doc.location_for_save_operation(SaveOperation::Save, false),
            dir.path().join("notes.txt")
        );
        assert_eq!(
            doc.location_for_save_operation(SaveOperation::SaveAs, true),
            dir.path().join("Untitled.txt")
        );
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("a/b:c"), "a-b-c");
        assert_eq!(sanitize_file_stem("  .hidden "), "hidden");
        assert_eq!(sanitize_file_stem(""), UNTITLED);
    }

    #[tokio::test]
    async fn closed_document_rejects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(dir.path(), "a.txt");
        let err = doc.update_change_count(DocumentChange::done()).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::InvalidState {
                state: DocumentState::Closed,
                ..
            }
        ));
        assert!(doc.with_content(|c| c.len()).is_err());
    }

    #[tokio::test]
    async fn editing_gate_blocks_registration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let doc = document(dir.path(), "a.txt");
        doc.open().await.unwrap();

        doc.disable_editing();
        assert!(!doc.is_editing_enabled());
        assert!(matches!(
            doc.modify(DocumentChange::done(), |c| c.push('!')),
            Err(DocumentError::EditingDisabled)
        ));
        doc.enable_editing();
        doc.modify(DocumentChange::done(), |c| c.push('!')).unwrap();
        assert_eq!(doc.with_content(|c| c.clone()).unwrap(), "hello!");
        doc.close_immediately();
    }

    #[tokio::test]
    async fn cleared_change_restores_disk_token() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let doc = document(dir.path(), "a.txt");
        doc.open().await.unwrap();
        let opened = doc.change_token().unwrap();

        doc.update_change_count(DocumentChange::done()).unwrap();
        assert!(doc.has_unsaved_changes());
        assert!(!doc.change_token().unwrap().matches(&opened).unwrap());
        assert!(doc.is_autosave_armed());

        doc.update_change_count(DocumentChange::cleared()).unwrap();
        assert!(!doc.has_unsaved_changes());
        assert!(doc.change_token().unwrap().matches(&opened).unwrap());
        assert!(!doc.is_autosave_armed());
        doc.close_immediately();
    }
}
