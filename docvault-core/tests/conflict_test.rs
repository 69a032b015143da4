//! Competing versions published by other devices.

mod common;

use common::{quiet_config, wait_for, Fixture};
use docvault_core::{CoordinationService, DocumentChange, DocumentEvent, PlainTextCodec, Representation};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gained_conflict_version_is_surfaced() {
    let fx = Fixture::new();
    let path = fx.write_file("a.txt", "mine");
    let mut events = fx.bus.subscribe();
    let doc = fx.document("a.txt", PlainTextCodec, quiet_config());
    doc.open().await.unwrap();
    assert!(!doc.has_conflicts());
    assert!(doc.current_version().is_some());

    let version = fx
        .local
        .inject_conflict_version(&path, &Representation::flat("theirs"), "laptop")
        .unwrap();

    match wait_for(&mut events, |e| matches!(e, DocumentEvent::ConflictDetected { .. })).await {
        DocumentEvent::ConflictDetected { id, conflicts, .. } => {
            assert_eq!(id, doc.id());
            assert_eq!(conflicts, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(doc.has_conflicts());
    let known = doc.conflict_versions();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].id, version.id);
    assert_eq!(known[0].originating_device, "laptop");
    doc.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicts_present_before_open_are_reported_on_open() {
    let fx = Fixture::new();
    let path = fx.write_file("a.txt", "mine");
    fx.local
        .inject_conflict_version(&path, &Representation::flat("theirs"), "phone")
        .unwrap();
    let mut events = fx.bus.subscribe();
    let doc = fx.document("a.txt", PlainTextCodec, quiet_config());

    doc.open().await.unwrap();

    wait_for(&mut events, |e| matches!(e, DocumentEvent::ConflictDetected { .. })).await;
    assert!(doc.has_conflicts());
    assert_eq!(doc.with_content(|c| c.clone()).unwrap(), "mine");
    doc.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saving_does_not_settle_conflicts() {
    let fx = Fixture::new();
    let path = fx.write_file("a.txt", "mine");
    let doc = fx.document("a.txt", PlainTextCodec, quiet_config());
    doc.open().await.unwrap();
    fx.local
        .inject_conflict_version(&path, &Representation::flat("theirs"), "phone")
        .unwrap();

    doc.modify(DocumentChange::done(), |c| c.push('!')).unwrap();
    doc.save().await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "mine!");
    assert!(doc.has_conflicts());
    assert_eq!(doc.conflict_versions().len(), 1);
    doc.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacing_with_conflict_version_adopts_it() {
    let fx = Fixture::new();
    let path = fx.write_file("a.txt", "mine");
    let mut events = fx.bus.subscribe();
    let doc = fx.document("a.txt", PlainTextCodec, quiet_config());
    doc.open().await.unwrap();
    let version = fx
        .local
        .inject_conflict_version(&path, &Representation::flat("theirs"), "phone")
        .unwrap();
    wait_for(&mut events, |e| matches!(e, DocumentEvent::ConflictDetected { .. })).await;

    doc.replace_with_version(version).await.unwrap();

    wait_for(&mut events, |e| matches!(e, DocumentEvent::ConflictResolved { .. })).await;
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "theirs");
    assert_eq!(doc.with_content(|c| c.clone()).unwrap(), "theirs");
    assert!(!doc.has_conflicts());
    assert!(!doc.has_unsaved_changes());
    doc.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_revert_settles_conflicts() {
    let fx = Fixture::new();
    let path = fx.write_file("a.txt", "mine");
    let doc = fx.document("a.txt", PlainTextCodec, quiet_config());
    doc.open().await.unwrap();
    for device in ["phone", "tablet"] {
        fx.local
            .inject_conflict_version(&path, &Representation::flat(device), device)
            .unwrap();
    }
    doc.modify(DocumentChange::done(), |c| c.push('!')).unwrap();

    doc.revert_to(&path).await.unwrap();

    assert!(!doc.has_conflicts());
    assert!(fx.local.conflict_versions(&path).is_empty());
    assert_eq!(doc.with_content(|c| c.clone()).unwrap(), "mine");
    assert!(!doc.has_unsaved_changes());
    doc.close().await.unwrap();
}
