#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use docvault_core::coordination::{Accessor, MoveAccessor, PresenterId, WriteIntent};
use docvault_core::{
    ChangeKind, ChangeRecorder, CoordinationService, Document, DocumentConfig, DocumentEvent,
    EventBus, FilePresenter, FileVersion, FormatCodec, LocalCoordinator, Representation,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config whose timers never fire during a test.
pub fn quiet_config() -> DocumentConfig {
    DocumentConfig {
        autosave_delay_secs: 60.0,
        remote_autosave_delay_secs: 120.0,
        autoversioning_interval_secs: 900.0,
        operation_timeout_secs: 5.0,
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub local: Arc<LocalCoordinator>,
    pub coordinator: Arc<CountingCoordinator>,
    pub bus: EventBus,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalCoordinator::new(dir.path().join(".versions")).unwrap());
        let coordinator = Arc::new(CountingCoordinator::new(local.clone()));
        Self {
            dir,
            local,
            coordinator,
            bus: EventBus::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write_file(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    pub fn document<C: FormatCodec>(&self, name: &str, codec: C, config: DocumentConfig) -> Document<C> {
        let coordinator: Arc<dyn CoordinationService> = self.coordinator.clone();
        Document::builder(self.path(name), codec, coordinator)
            .config(config)
            .events(self.bus.clone())
            .build()
    }

    /// Replace the item as another participant would.
    pub fn external_write(&self, path: &Path, text: &str) {
        self.local
            .coordinate_write(path, WriteIntent::Replacing, None, &mut |p| {
                std::fs::write(p, text).map_err(|e| docvault_core::DocumentError::write(p, e))
            })
            .unwrap();
    }
}

pub async fn wait_for(
    rx: &mut broadcast::Receiver<DocumentEvent>,
    mut matches: impl FnMut(&DocumentEvent) -> bool,
) -> DocumentEvent {
    let waiting = async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("timed out waiting for event")
}

/// Delegating coordinator that measures coordinated accesses.
pub struct CountingCoordinator {
    inner: Arc<LocalCoordinator>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub writes: AtomicUsize,
    pub reads: AtomicUsize,
    delay_ms: AtomicU64,
}

impl CountingCoordinator {
    pub fn new(inner: Arc<LocalCoordinator>) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Hold every coordinated access for `delay` before running it.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn track<T>(&self, access: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let result = access();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl CoordinationService for CountingCoordinator {
    fn coordinate_read(
        &self,
        location: &Path,
        acting: Option<PresenterId>,
        reader: Accessor<'_>,
    ) -> docvault_core::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.track(|| self.inner.coordinate_read(location, acting, reader))
    }

    fn coordinate_write(
        &self,
        location: &Path,
        intent: WriteIntent,
        acting: Option<PresenterId>,
        writer: Accessor<'_>,
    ) -> docvault_core::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.track(|| self.inner.coordinate_write(location, intent, acting, writer))
    }

    fn coordinate_move(
        &self,
        from: &Path,
        to: &Path,
        acting: Option<PresenterId>,
        mover: MoveAccessor<'_>,
    ) -> docvault_core::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.track(|| self.inner.coordinate_move(from, to, acting, mover))
    }

    fn register_presenter(&self, presenter: Arc<dyn FilePresenter>) -> PresenterId {
        self.inner.register_presenter(presenter)
    }

    fn unregister_presenter(&self, id: PresenterId) {
        self.inner.unregister_presenter(id)
    }

    fn current_version(&self, location: &Path) -> Option<FileVersion> {
        self.inner.current_version(location)
    }

    fn conflict_versions(&self, location: &Path) -> Vec<FileVersion> {
        self.inner.conflict_versions(location)
    }

    fn add_version(&self, location: &Path) -> Result<FileVersion> {
        self.inner.add_version(location)
    }

    fn replace_item_with_version(&self, location: &Path, version: &FileVersion) -> Result<()> {
        self.inner.replace_item_with_version(location, version)
    }

    fn resolve_conflicts(&self, location: &Path) -> Result<()> {
        self.inner.resolve_conflicts(location)
    }

    fn is_remotely_synced(&self, location: &Path) -> bool {
        self.inner.is_remotely_synced(location)
    }
}

/// Text codec that can be made lossy, slow to decode or made to fail on write.
#[derive(Clone, Default)]
pub struct TestCodec {
    pub lossy: bool,
    pub fail_writes: Arc<AtomicBool>,
    pub read_delay_ms: Arc<AtomicU64>,
}

impl TestCodec {
    pub fn lossy() -> Self {
        Self {
            lossy: true,
            ..Self::default()
        }
    }
}

impl FormatCodec for TestCodec {
    type Content = String;

    fn file_type(&self) -> &str {
        "test.text"
    }

    fn default_extension(&self) -> &str {
        "txt"
    }

    fn read(&self, representation: Representation) -> Result<String> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(String::from_utf8(representation.into_flat()?.to_vec())?)
    }

    fn write(&self, content: &String) -> Result<Representation> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("encoder refused content");
        }
        let text = if self.lossy {
            content.trim_end().to_string()
        } else {
            content.clone()
        };
        Ok(Representation::flat(text.into_bytes()))
    }

    fn is_round_trip_consistent(&self) -> bool {
        !self.lossy
    }
}

/// Package codec keeping its text in `index.txt`. With `escaping_entries`
/// set it also emits an entry that points outside the package.
#[derive(Clone, Default)]
pub struct IndexPackageCodec {
    pub escaping_entries: Arc<AtomicBool>,
}

impl FormatCodec for IndexPackageCodec {
    type Content = String;

    fn file_type(&self) -> &str {
        "test.package"
    }

    fn default_extension(&self) -> &str {
        "pkg"
    }

    fn read(&self, representation: Representation) -> Result<String> {
        let entries = representation.into_package()?;
        let index = entries
            .get("index.txt")
            .ok_or_else(|| anyhow::anyhow!("package has no index.txt"))?;
        Ok(String::from_utf8(index.to_vec())?)
    }

    fn write(&self, content: &String) -> Result<Representation> {
        let mut entries = BTreeMap::new();
        entries.insert("index.txt".to_string(), Bytes::from(content.clone().into_bytes()));
        if self.escaping_entries.load(Ordering::SeqCst) {
            entries.insert("../escape".to_string(), Bytes::from_static(b"out"));
        }
        Ok(Representation::Package(entries))
    }
}

#[derive(Default)]
pub struct RecordingRecorder {
    pub changes: Mutex<Vec<(ChangeKind, bool)>>,
    pub breaks: AtomicUsize,
}

impl ChangeRecorder for RecordingRecorder {
    fn record(&self, kind: ChangeKind, undoable: bool) {
        self.changes.lock().push((kind, undoable));
    }

    fn break_coalescing(&self) {
        self.breaks.fetch_add(1, Ordering::SeqCst);
    }
}
