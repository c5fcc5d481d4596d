//! Photos backup tests against the in-memory remote

mod common;

use cloudkeep_core::domain::{
    ExclusionRule, ItemAction, LibrarySelector, ProgressEvent, RemoteItem, RunStatus, SyncPolicy,
};
use cloudkeep_core::ports::SourceError;
use tokio_util::sync::CancellationToken;

use common::{day, item, local_files, rid, Fault, Harness};

const PERSONAL: LibrarySelector = LibrarySelector::Personal;

fn add(h: &Harness, id: &str, filename: &str, date: Option<(i32, u32, u32)>, content: &[u8]) {
    let date = date.map(|(y, m, d)| day(y, m, d));
    h.remote
        .add_item(PERSONAL, item(id, filename, date, content), content);
}

#[tokio::test]
async fn items_are_filed_by_date() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2023, 12, 1)), b"two");
    add(&h, "3", "scan.png", None, b"three");
    h.remote
        .add_item(PERSONAL, RemoteItem::new(rid("4"), ""), b"");

    let report = h.run(&h.photos_plan(SyncPolicy::Keep)).await;

    assert_eq!(report.status, RunStatus::Success);
    let stats = report.photos.unwrap();
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(
        local_files(&h.library_dir()),
        [
            "2023/12/01/IMG_2.JPG",
            "2024/03/15/IMG_1.JPG",
            "unknown_date/scan.png"
        ]
    );
}

#[tokio::test]
async fn second_run_fetches_nothing() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2024, 3, 15)), b"two");
    let plan = h.photos_plan(SyncPolicy::Delete);

    h.run(&plan).await;
    let second = h.run(&plan).await;

    let stats = second.photos.unwrap();
    assert_eq!(stats.fetched, 0);
    assert_eq!(stats.removed, 0);
    assert_eq!(h.remote.total_opens(), 2);
}

#[tokio::test]
async fn same_day_name_collisions_get_stable_suffixes() {
    let h = Harness::new();
    add(&h, "a", "IMG_1.JPG", Some((2024, 3, 15)), b"first");
    add(&h, "b", "IMG_1.JPG", Some((2024, 3, 15)), b"second");
    let plan = h.photos_plan(SyncPolicy::Delete);

    h.run(&plan).await;
    let dir = h.library_dir().join("2024/03/15");
    assert_eq!(std::fs::read(dir.join("IMG_1.JPG")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.join("IMG_1_1.JPG")).unwrap(), b"second");

    h.remote.reverse_items(&PERSONAL);
    let second = h.run(&plan).await;
    assert_eq!(second.photos.unwrap().fetched, 0);
    assert_eq!(std::fs::read(dir.join("IMG_1.JPG")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.join("IMG_1_1.JPG")).unwrap(), b"second");
}

#[tokio::test]
async fn duplicate_content_is_copied_locally() {
    let h = Harness::new();
    add(&h, "a", "IMG_1.JPG", Some((2024, 1, 1)), b"same bytes");
    add(&h, "b", "IMG_1 copy.JPG", Some((2024, 2, 2)), b"same bytes");
    let mut plan = h.photos_plan(SyncPolicy::Keep);
    plan.settings.fetch_concurrency = 1;

    // run once so the first copy is known, then lose the second one
    h.run(&plan).await;
    std::fs::remove_file(h.library_dir().join("2024/02/02/IMG_1 copy.JPG")).unwrap();
    let opens = h.remote.total_opens();

    let report = h.run(&plan).await;
    assert_eq!(h.remote.total_opens(), opens);
    assert_eq!(
        std::fs::read(h.library_dir().join("2024/02/02/IMG_1 copy.JPG")).unwrap(),
        b"same bytes"
    );
    assert!(h.sink.events().iter().any(|e| matches!(
        e,
        ProgressEvent::ItemFinished {
            action: ItemAction::Deduplicated,
            ..
        }
    )));
    assert_eq!(report.photos.unwrap().fetched, 1);
}

#[tokio::test]
async fn changed_fingerprint_is_fetched_again() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    let plan = h.photos_plan(SyncPolicy::Keep);
    h.run(&plan).await;

    h.remote.update_item(&PERSONAL, "1", "fp-edited", b"ONE");
    let report = h.run(&plan).await;

    assert_eq!(report.photos.unwrap().fetched, 1);
    assert_eq!(
        std::fs::read(h.library_dir().join("2024/03/15/IMG_1.JPG")).unwrap(),
        b"ONE"
    );
}

#[tokio::test]
async fn delete_policy_removes_vanished_items() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2024, 4, 1)), b"two");
    let plan = h.photos_plan(SyncPolicy::Delete);
    h.run(&plan).await;

    h.remote.remove_item(&PERSONAL, "2");
    let report = h.run(&plan).await;

    assert_eq!(report.photos.unwrap().removed, 1);
    assert_eq!(local_files(&h.library_dir()), ["2024/03/15/IMG_1.JPG"]);
    assert!(!h.library_dir().join("2024/04").exists());
}

#[tokio::test]
async fn archive_policy_keeps_the_day_layout() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2024, 4, 1)), b"two");
    let plan = h.photos_plan(SyncPolicy::Archive);
    h.run(&plan).await;

    h.remote.remove_item(&PERSONAL, "2");
    let report = h.run(&plan).await;

    assert_eq!(report.photos.unwrap().archived, 1);
    let archived = h.archive_dir().join("photos/library/2024/04/01/IMG_2.JPG");
    assert_eq!(std::fs::read(archived).unwrap(), b"two");
}

#[tokio::test]
async fn interrupted_enumeration_skips_reconciliation() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2024, 4, 1)), b"two");
    let plan = h.photos_plan(SyncPolicy::Delete);
    h.run(&plan).await;

    h.remote
        .fail_enumeration(1, SourceError::Transient("connection reset".into()));
    let report = h.run(&plan).await;

    assert_eq!(report.status, RunStatus::SuccessWithWarnings);
    assert_eq!(report.photos.unwrap().removed, 0);
    assert!(h.library_dir().join("2024/04/01/IMG_2.JPG").exists());
}

#[tokio::test]
async fn cancellation_keeps_fetched_items_and_skips_reconciliation() {
    let h = Harness::new();
    for i in 0..6u32 {
        let id = i.to_string();
        add(&h, &id, &format!("IMG_{i}.JPG"), Some((2024, 3, 15)), id.as_bytes());
    }
    let stale = h.library_dir().join("2020/01/01/old.JPG");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"stale").unwrap();

    let cancel = CancellationToken::new();
    h.sink.cancel_on_first_item(cancel.clone());
    let report = h
        .engine
        .run(&h.photos_plan(SyncPolicy::Delete), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(stale.exists());
    assert!(report.photos.unwrap().fetched >= 1);
    assert!(local_files(&h.library_dir()).len() >= 2);
    assert!(!h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::Reconciled { .. })));
}

#[tokio::test]
async fn empty_enumeration_skips_reconciliation() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    let plan = h.photos_plan(SyncPolicy::Delete);
    h.run(&plan).await;

    h.remote.remove_item(&PERSONAL, "1");
    let report = h.run(&plan).await;

    assert_eq!(report.photos.unwrap().removed, 0);
    assert!(h.library_dir().join("2024/03/15/IMG_1.JPG").exists());
}

#[tokio::test]
async fn excluded_items_are_not_fetched_or_removed() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "clip.MOV", Some((2024, 3, 15)), b"movie");
    let local = h.library_dir().join("2024/03/15/old.MOV");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"local").unwrap();

    let mut plan = h.photos_plan(SyncPolicy::Delete);
    plan.exclusions = vec![ExclusionRule::parse("*/*/*/*.MOV").unwrap()];
    let report = h.run(&plan).await;

    assert_eq!(report.photos.unwrap().fetched, 1);
    assert_eq!(h.remote.opens("2"), 0);
    assert!(local.exists());
}

#[tokio::test]
async fn permanent_item_failure_is_reported() {
    let h = Harness::new();
    add(&h, "1", "IMG_1.JPG", Some((2024, 3, 15)), b"one");
    add(&h, "2", "IMG_2.JPG", Some((2024, 3, 15)), b"two");
    add(&h, "3", "IMG_3.JPG", Some((2024, 3, 15)), b"three");
    h.remote.fault("2", Fault::Permanent);

    let report = h.run(&h.photos_plan(SyncPolicy::Delete)).await;

    assert_eq!(report.status, RunStatus::SuccessWithWarnings);
    let stats = report.photos.unwrap();
    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn shared_library_goes_to_its_own_directory() {
    let h = Harness::new();
    let shared = LibrarySelector::Shared("SharedSync-1234".into());
    h.remote.add_item(
        shared.clone(),
        item("s1", "family.jpg", Some(day(2022, 7, 4)), b"fam"),
        b"fam",
    );
    let mut plan = h.photos_plan(SyncPolicy::Keep);
    plan.photos.as_mut().unwrap().libraries = vec![PERSONAL, shared];

    let report = h.run(&plan).await;

    // the personal library does not exist in this remote
    assert_eq!(report.status, RunStatus::Success);
    let shared_dir = h.backup_dir().join("photos/shared-library");
    assert_eq!(local_files(&shared_dir), ["2022/07/04/family.jpg"]);
}
