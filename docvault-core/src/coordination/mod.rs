//! Contract with the file-coordination service.
//!
//! The service arbitrates read/write exclusion on locations, tells registered
//! presenters about changes made by other participants, and keeps the
//! version store (retained and conflicting copies of an item).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

pub mod local;

pub use local::LocalCoordinator;

/// Handle for a registered presenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresenterId(pub u64);

/// A persisted copy of an item known to the version store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: Uuid,
    pub location: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub originating_device: String,
    /// Whether this copy competes with the current one.
    pub conflict: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteIntent {
    Replacing,
    Deleting,
}

/// Observer of external activity on a location.
///
/// Callbacks run on the thread performing the coordinated access and must
/// not block or coordinate themselves.
pub trait FilePresenter: Send + Sync {
    /// The location currently presented, if any.
    fn presented_location(&self) -> Option<PathBuf>;

    fn presented_item_did_change(&self) {}

    /// An item inside the presented package changed.
    fn presented_subitem_did_change(&self, _subitem: &Path) {}

    fn presented_item_did_move(&self, _to: &Path) {}

    /// Another participant is about to delete the presented item.
    fn accommodate_deletion(&self) {}

    fn presented_item_did_gain_version(&self, _version: &FileVersion) {}

    fn presented_item_did_resolve_conflict(&self, _version: &FileVersion) {}
}

/// Accessor run while coordinated access is held.
pub type Accessor<'a> = &'a mut dyn FnMut(&Path) -> Result<()>;

/// Accessor for coordinated moves, given the source and destination.
pub type MoveAccessor<'a> = &'a mut dyn FnMut(&Path, &Path) -> Result<()>;

pub trait CoordinationService: Send + Sync {
    /// Run `reader` with shared access to `location`. `acting` identifies
    /// the caller's own presenter, which is never notified of its access.
    fn coordinate_read(
        &self,
        location: &Path,
        acting: Option<PresenterId>,
        reader: Accessor<'_>,
    ) -> Result<()>;

    /// Run `writer` with exclusive access to `location`.
    fn coordinate_write(
        &self,
        location: &Path,
        intent: WriteIntent,
        acting: Option<PresenterId>,
        writer: Accessor<'_>,
    ) -> Result<()>;

    /// Run `mover` with exclusive access to both locations.
    fn coordinate_move(
        &self,
        from: &Path,
        to: &Path,
        acting: Option<PresenterId>,
        mover: MoveAccessor<'_>,
    ) -> Result<()>;

    fn register_presenter(&self, presenter: Arc<dyn FilePresenter>) -> PresenterId;

    fn unregister_presenter(&self, id: PresenterId);

    fn current_version(&self, location: &Path) -> Option<FileVersion>;

    fn conflict_versions(&self, location: &Path) -> Vec<FileVersion>;

    /// Retain a copy of the item as a new version. Callers hold coordination.
    fn add_version(&self, location: &Path) -> anyhow::Result<FileVersion>;

    /// Publish `version` over the item at `location`. Callers hold write
    /// coordination.
    fn replace_item_with_version(&self, location: &Path, version: &FileVersion) -> anyhow::Result<()>;

    /// Mark every conflict version of `location` as resolved.
    fn resolve_conflicts(&self, location: &Path) -> anyhow::Result<()>;

    /// Whether `location` is replicated to a remote store.
    fn is_remotely_synced(&self, _location: &Path) -> bool {
        false
    }
}
