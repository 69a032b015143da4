//! In-process coordination service for a single machine.
//!
//! Exclusion is a reader/writer lock per standardized location. Retained and
//! conflicting versions are snapshots copied into a version directory.

use anyhow::{anyhow, Context};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    Accessor, CoordinationService, FilePresenter, FileVersion, MoveAccessor, PresenterId,
    WriteIntent,
};
use crate::codec::Representation;
use crate::error::{DocumentError, Result};
use crate::fsutil;

const DEFAULT_DEVICE: &str = "local";

struct StoredVersion {
    version: FileVersion,
    snapshot: PathBuf,
}

struct VersionRecord {
    current: FileVersion,
    retained: Vec<StoredVersion>,
    conflicts: Vec<StoredVersion>,
}

pub struct LocalCoordinator {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
    presenters: RwLock<HashMap<PresenterId, Arc<dyn FilePresenter>>>,
    next_presenter: AtomicU64,
    versions: Mutex<HashMap<PathBuf, VersionRecord>>,
    version_dir: PathBuf,
    device: String,
    remote_prefixes: RwLock<Vec<PathBuf>>,
    available: AtomicBool,
}

impl LocalCoordinator {
    pub fn new(version_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let version_dir = version_dir.into();
        std::fs::create_dir_all(&version_dir)
            .with_context(|| format!("creating version store {}", version_dir.display()))?;
        Ok(Self {
            locks: Mutex::new(HashMap::new()),
            presenters: RwLock::new(HashMap::new()),
            next_presenter: AtomicU64::new(1),
            versions: Mutex::new(HashMap::new()),
            version_dir,
            device: DEFAULT_DEVICE.to_string(),
            remote_prefixes: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        })
    }

    /// Name recorded as the originating device of versions written here.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn version_dir(&self) -> &Path {
        &self.version_dir
    }

    /// Treat every location below `prefix` as remotely synced.
    pub fn mark_remotely_synced(&self, prefix: impl AsRef<Path>) {
        self.remote_prefixes
            .write()
            .push(fsutil::standardize(prefix.as_ref()));
    }

    /// Toggle whether coordination can be granted at all. While unavailable,
    /// every coordinated access fails without running its accessor.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn presenter_count(&self) -> usize {
        self.presenters.read().len()
    }

    /// Versions retained by explicit saves, oldest first.
    pub fn retained_versions(&self, location: &Path) -> Vec<FileVersion> {
        let key = fsutil::standardize(location);
        self.versions
            .lock()
            .get(&key)
            .map(|r| r.retained.iter().map(|s| s.version.clone()).collect())
            .unwrap_or_default()
    }

    /// Record a competing copy of `location`, as a sync client would after
    /// concurrent edits on another device, and notify presenters.
    pub fn inject_conflict_version(
        &self,
        location: &Path,
        representation: &Representation,
        device: &str,
    ) -> anyhow::Result<FileVersion> {
        let key = fsutil::standardize(location);
        let version = FileVersion {
            id: Uuid::new_v4(),
            location: location.to_path_buf(),
            modified_at: Utc::now(),
            originating_device: device.to_string(),
            conflict: true,
        };
        let snapshot = self.snapshot_path(version.id);
        fsutil::write_representation_atomically(&snapshot, representation)?;
        {
            let mut versions = self.versions.lock();
            let record = self.record_for(&mut versions, &key, location)?;
            record.conflicts.push(StoredVersion {
                version: version.clone(),
                snapshot,
            });
        }
        tracing::debug!(
            "conflict version {} from {} recorded for {}",
            version.id,
            device,
            location.display()
        );
        for presenter in self.presenters_at(&key, None) {
            presenter.presented_item_did_gain_version(&version);
        }
        Ok(version)
    }

    fn ensure_available(&self, location: &Path) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DocumentError::coordination(
                location,
                anyhow!("coordination service unavailable"),
            ))
        }
    }

    fn lock_for(&self, key: &Path) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn snapshot_path(&self, id: Uuid) -> PathBuf {
        self.version_dir.join(id.to_string())
    }

    fn record_for<'a>(
        &self,
        versions: &'a mut HashMap<PathBuf, VersionRecord>,
        key: &Path,
        location: &Path,
    ) -> anyhow::Result<&'a mut VersionRecord> {
        if !versions.contains_key(key) {
            let modified_at = fsutil::modification_date(location)
                .ok_or_else(|| anyhow!("no item at {}", location.display()))?;
            versions.insert(
                key.to_path_buf(),
                VersionRecord {
                    current: FileVersion {
                        id: Uuid::new_v4(),
                        location: location.to_path_buf(),
                        modified_at,
                        originating_device: self.device.clone(),
                        conflict: false,
                    },
                    retained: Vec::new(),
                    conflicts: Vec::new(),
                },
            );
        }
        versions
            .get_mut(key)
            .ok_or_else(|| anyhow!("version record vanished"))
    }

    /// Presenters whose location equals `key`, excluding `acting`.
    fn presenters_at(&self, key: &Path, acting: Option<PresenterId>) -> Vec<Arc<dyn FilePresenter>> {
        self.presenters_matching(acting, |presented| presented == key)
    }

    fn presenters_matching(
        &self,
        acting: Option<PresenterId>,
        predicate: impl Fn(&Path) -> bool,
    ) -> Vec<Arc<dyn FilePresenter>> {
        // Collected first so callbacks never run under the table lock.
        self.presenters
            .read()
            .iter()
            .filter(|(id, _)| Some(**id) != acting)
            .filter_map(|(_, p)| {
                let presented = fsutil::standardize(&p.presented_location()?);
                predicate(&presented).then(|| p.clone())
            })
            .collect()
    }

    fn did_write(&self, key: &Path, location: &Path, acting: Option<PresenterId>) {
        {
            let mut versions = self.versions.lock();
            let modified_at = fsutil::modification_date(location).unwrap_or_else(Utc::now);
            let fresh = FileVersion {
                id: Uuid::new_v4(),
                location: location.to_path_buf(),
                modified_at,
                originating_device: self.device.clone(),
                conflict: false,
            };
            match versions.get_mut(key) {
                Some(record) => record.current = fresh,
                None => {
                    versions.insert(
                        key.to_path_buf(),
                        VersionRecord {
                            current: fresh,
                            retained: Vec::new(),
                            conflicts: Vec::new(),
                        },
                    );
                }
            }
        }
        for presenter in self.presenters_at(key, acting) {
            presenter.presented_item_did_change();
        }
        // Packages containing the written item.
        for presenter in self.presenters_matching(acting, |p| key != p && key.starts_with(p)) {
            presenter.presented_subitem_did_change(location);
        }
    }

    fn did_delete(&self, key: &Path) {
        if let Some(record) = self.versions.lock().remove(key) {
            for stored in record.retained.into_iter().chain(record.conflicts) {
                let _ = fsutil::remove_item(&stored.snapshot);
            }
        }
    }
}

impl CoordinationService for LocalCoordinator {
    fn coordinate_read(
        &self,
        location: &Path,
        _acting: Option<PresenterId>,
        reader: Accessor<'_>,
    ) -> Result<()> {
        self.ensure_available(location)?;
        let key = fsutil::standardize(location);
        let lock = self.lock_for(&key);
        let _guard = lock.read();
        reader(location)
    }

    fn coordinate_write(
        &self,
        location: &Path,
        intent: WriteIntent,
        acting: Option<PresenterId>,
        writer: Accessor<'_>,
    ) -> Result<()> {
        self.ensure_available(location)?;
        let key = fsutil::standardize(location);
        let lock = self.lock_for(&key);
        let _guard = lock.write();

        if intent == WriteIntent::Deleting {
            for presenter in self.presenters_at(&key, acting) {
                presenter.accommodate_deletion();
            }
        }
        writer(location)?;
        match intent {
            WriteIntent::Replacing => self.did_write(&key, location, acting),
            WriteIntent::Deleting => self.did_delete(&key),
        }
        Ok(())
    }

    fn coordinate_move(
        &self,
        from: &Path,
        to: &Path,
        acting: Option<PresenterId>,
        mover: MoveAccessor<'_>,
    ) -> Result<()> {
        self.ensure_available(from)?;
        let from_key = fsutil::standardize(from);
        let to_key = fsutil::standardize(to);

        let from_lock = self.lock_for(&from_key);
        let to_lock = self.lock_for(&to_key);
        // Stable lock order; a move onto itself takes one lock.
        let (_first, _second) = if from_key == to_key {
            (from_lock.write(), None)
        } else if from_key < to_key {
            let first = from_lock.write();
            (first, Some(to_lock.write()))
        } else {
            let first = to_lock.write();
            (first, Some(from_lock.write()))
        };

        mover(from, to)?;

        if from_key != to_key {
            let mut versions = self.versions.lock();
            if let Some(mut record) = versions.remove(&from_key) {
                record.current.location = to.to_path_buf();
                // versions retained at the destination while moving
                if let Some(arrived) = versions.remove(&to_key) {
                    record.current = arrived.current;
                    record.retained.extend(arrived.retained);
                    record.conflicts.extend(arrived.conflicts);
                }
                versions.insert(to_key.clone(), record);
            }
        }
        for presenter in self.presenters_at(&from_key, acting) {
            presenter.presented_item_did_move(to);
        }
        Ok(())
    }

    fn register_presenter(&self, presenter: Arc<dyn FilePresenter>) -> PresenterId {
        let id = PresenterId(self.next_presenter.fetch_add(1, Ordering::SeqCst));
        self.presenters.write().insert(id, presenter);
        id
    }

    fn unregister_presenter(&self, id: PresenterId) {
        self.presenters.write().remove(&id);
    }

    fn current_version(&self, location: &Path) -> Option<FileVersion> {
        let key = fsutil::standardize(location);
        let mut versions = self.versions.lock();
        self.record_for(&mut versions, &key, location)
            .ok()
            .map(|r| r.current.clone())
    }

    fn conflict_versions(&self, location: &Path) -> Vec<FileVersion> {
        let key = fsutil::standardize(location);
        self.versions
            .lock()
            .get(&key)
            .map(|r| r.conflicts.iter().map(|s| s.version.clone()).collect())
            .unwrap_or_default()
    }

    fn add_version(&self, location: &Path) -> anyhow::Result<FileVersion> {
        let key = fsutil::standardize(location);
        let version = FileVersion {
            id: Uuid::new_v4(),
            location: location.to_path_buf(),
            modified_at: fsutil::modification_date(location).unwrap_or_else(Utc::now),
            originating_device: self.device.clone(),
            conflict: false,
        };
        let snapshot = self.snapshot_path(version.id);
        fsutil::copy_item(location, &snapshot)?;
        let mut versions = self.versions.lock();
        let record = self.record_for(&mut versions, &key, location)?;
        record.retained.push(StoredVersion {
            version: version.clone(),
            snapshot,
        });
        Ok(version)
    }

    fn replace_item_with_version(&self, location: &Path, version: &FileVersion) -> anyhow::Result<()> {
        let key = fsutil::standardize(location);
        let snapshot = {
            let versions = self.versions.lock();
            let record = versions
                .get(&key)
                .ok_or_else(|| anyhow!("no versions known for {}", location.display()))?;
            record
                .conflicts
                .iter()
                .chain(record.retained.iter())
                .find(|s| s.version.id == version.id)
                .map(|s| s.snapshot.clone())
                .ok_or_else(|| anyhow!("unknown version {}", version.id))?
        };
        fsutil::copy_item(&snapshot, location)?;

        let mut versions = self.versions.lock();
        if let Some(record) = versions.get_mut(&key) {
            if let Some(pos) = record.conflicts.iter().position(|s| s.version.id == version.id) {
                let stored = record.conflicts.remove(pos);
                let _ = fsutil::remove_item(&stored.snapshot);
            }
            record.current = FileVersion {
                id: version.id,
                location: location.to_path_buf(),
                modified_at: fsutil::modification_date(location).unwrap_or_else(Utc::now),
                originating_device: version.originating_device.clone(),
                conflict: false,
            };
        }
        Ok(())
    }

    fn resolve_conflicts(&self, location: &Path) -> anyhow::Result<()> {
        let key = fsutil::standardize(location);
        let resolved: Vec<StoredVersion> = match self.versions.lock().get_mut(&key) {
            Some(record) => record.conflicts.drain(..).collect(),
            None => Vec::new(),
        };
        for stored in &resolved {
            fsutil::remove_item(&stored.snapshot).ok();
        }
        let presenters = self.presenters_at(&key, None);
        for stored in &resolved {
            let mut version = stored.version.clone();
            version.conflict = false;
            for presenter in &presenters {
                presenter.presented_item_did_resolve_conflict(&version);
            }
        }
        Ok(())
    }

    fn is_remotely_synced(&self, location: &Path) -> bool {
        let key = fsutil::standardize(location);
        self.remote_prefixes
            .read()
            .iter()
            .any(|prefix| key.starts_with(prefix))
    }
}
