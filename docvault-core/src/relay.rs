//! Presentation relay between a document and the coordination service.
//!
//! The coordination service keeps strong references to its presenters. The
//! relay is what gets registered: it forwards notifications to its owner
//! through a weak reference, so a registration never keeps a document alive.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::coordination::{CoordinationService, FilePresenter, FileVersion, PresenterId};

pub struct PresentationRelay {
    owner: Weak<dyn FilePresenter>,
    location: Mutex<Option<PathBuf>>,
    registration: Mutex<Option<PresenterId>>,
}

impl PresentationRelay {
    pub fn new(owner: Weak<dyn FilePresenter>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            location: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    /// Register with `coordinator` as the presenter of `location`.
    ///
    /// Callers should hold read coordination on `location`. Beginning twice
    /// without ending is a programming error.
    pub fn begin_presentation(
        self: &Arc<Self>,
        coordinator: &dyn CoordinationService,
        location: &Path,
    ) -> PresenterId {
        let mut registration = self.registration.lock();
        debug_assert!(registration.is_none(), "presentation already begun");
        if let Some(existing) = *registration {
            tracing::warn!(location = %location.display(), "presentation already begun");
            *self.location.lock() = Some(location.to_path_buf());
            return existing;
        }

        *self.location.lock() = Some(location.to_path_buf());
        let presenter: Arc<dyn FilePresenter> = self.clone();
        let id = coordinator.register_presenter(presenter);
        *registration = Some(id);
        id
    }

    /// Unregister from `coordinator`. Ending an inactive presentation does
    /// nothing.
    pub fn end_presentation(&self, coordinator: &dyn CoordinationService) {
        if let Some(id) = self.registration.lock().take() {
            coordinator.unregister_presenter(id);
        }
    }

    pub fn presenter_id(&self) -> Option<PresenterId> {
        *self.registration.lock()
    }

    pub fn is_presenting(&self) -> bool {
        self.registration.lock().is_some()
    }

    pub fn set_location(&self, location: &Path) {
        *self.location.lock() = Some(location.to_path_buf());
    }

    fn forward(&self, notify: impl FnOnce(&dyn FilePresenter)) {
        if let Some(owner) = self.owner.upgrade() {
            notify(owner.as_ref());
        }
    }
}

impl FilePresenter for PresentationRelay {
    fn presented_location(&self) -> Option<PathBuf> {
        self.location.lock().clone()
    }

    fn presented_item_did_change(&self) {
        self.forward(|owner| owner.presented_item_did_change());
    }

    fn presented_subitem_did_change(&self, subitem: &Path) {
        self.forward(|owner| owner.presented_subitem_did_change(subitem));
    }

    fn presented_item_did_move(&self, to: &Path) {
        self.set_location(to);
        self.forward(|owner| owner.presented_item_did_move(to));
    }

    fn accommodate_deletion(&self) {
        self.forward(|owner| owner.accommodate_deletion());
    }

    fn presented_item_did_gain_version(&self, version: &FileVersion) {
        self.forward(|owner| owner.presented_item_did_gain_version(version));
    }

    fn presented_item_did_resolve_conflict(&self, version: &FileVersion) {
        self.forward(|owner| owner.presented_item_did_resolve_conflict(version));
    }
}
