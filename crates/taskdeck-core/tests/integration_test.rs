use std::fs;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use tokio::sync::broadcast;

use taskdeck_core::codec;
use taskdeck_core::{DataManager, RecordRepository, StoreConfig, WriteMarks};
use taskdeck_types::{Filter, GroupBy, Record, SortKey, SortSpec, Status, StoreEvent};

fn offline_config(temp: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::at(temp.path());
    config.debounce_ms = 50;
    config.watcher_enabled = false;
    config
}

fn watching_config(temp: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::at(temp.path());
    config.debounce_ms = 50;
    config.watch_suppression_ms = 250;
    config.watcher_enabled = true;
    config
}

async fn next_event_of_kind(
    rx: &mut broadcast::Receiver<StoreEvent>,
    kind: &str,
) -> StoreEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind() == kind => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

#[tokio::test]
async fn call_john_from_capture_to_archive() {
    let temp = TempDir::new().unwrap();
    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();

    // Capture.
    let mut task = Record::new_task("Call John re: contract");
    task.context = Some("phone".to_string());
    task.status = Status::Actionable;
    task.due = Some(Utc::now() + ChronoDuration::days(1));
    let task = manager.create_record(task).await.unwrap();

    // The phone board exists and lists the task without any cache.
    let members = manager.board_records("context-phone").await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, task.id);

    // The task shows up through a filter query as well.
    let groups = manager
        .evaluate(
            &Filter::context("phone"),
            GroupBy::None,
            SortSpec::ascending(SortKey::Due),
        )
        .await;
    assert_eq!(groups[0].records[0].title, "Call John re: contract");

    // The debounced write lands as a frontmatter file under the
    // year/month of creation.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let expected = temp.path().join(format!(
        "tasks/active/{}/{}.md",
        task.created.format("%Y/%m"),
        task.id
    ));
    assert!(expected.exists());
    let (on_disk, warnings) =
        codec::decode_record(&fs::read_to_string(&expected).unwrap()).unwrap();
    assert!(warnings.is_empty());
    assert_eq!(on_disk.title, "Call John re: contract");

    // Completing is a status change; the file stays where it is.
    let completed = manager.complete_record(&task.id).await.unwrap();
    assert_eq!(completed.status, Status::Completed);
    assert!(completed.completed_at.is_some());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(expected.exists());
    assert_eq!(manager.board_records("context-phone").await.unwrap().len(), 1);

    // Archiving moves the file into the archive subtree.
    manager.archive_record(&task.id).await.unwrap();
    let archived_path = temp.path().join(format!(
        "tasks/archive/{}/{}.md",
        task.created.format("%Y/%m"),
        task.id
    ));
    assert!(!expected.exists());
    assert!(archived_path.exists());

    // A fresh manager sees the archived record but keeps it out of the
    // active collection.
    assert!(manager.shutdown().await.is_empty());
    let reopened = DataManager::initialize(offline_config(&temp)).await.unwrap();
    assert_eq!(reopened.load_summary().loaded, 1);
    let record = reopened.records().get(&task.id).await.unwrap();
    assert!(record.archived);
    assert!(reopened.records().active().await.is_empty());
}

#[tokio::test]
async fn one_corrupt_file_does_not_poison_the_load() {
    let temp = TempDir::new().unwrap();
    {
        let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();
        for n in 0..9 {
            manager
                .create_record(Record::new_task(format!("task {n}")))
                .await
                .unwrap();
        }
        assert!(manager.shutdown().await.is_empty());
    }

    let rogue_dir = temp.path().join("tasks/active/2019/12");
    fs::create_dir_all(&rogue_dir).unwrap();
    fs::write(rogue_dir.join("mangled.md"), "no frontmatter here").unwrap();

    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();
    assert_eq!(manager.load_summary().loaded, 9);
    assert_eq!(manager.load_summary().failures.len(), 1);
    assert_eq!(manager.records().active().await.len(), 9);
}

#[tokio::test]
async fn unknown_frontmatter_keys_survive_a_full_round_trip() {
    let temp = TempDir::new().unwrap();
    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();

    let mut record = Record::new_task("carries baggage");
    record.body = "Line one.\n\nLine two with trailing spaces.  \n".to_string();
    record
        .extra
        .insert("x_legacy_rank".to_string(), serde_yaml::Value::from(7));
    let record = manager.create_record(record).await.unwrap();

    let bytes = manager.export_record(&record.id).await.unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.contains("x_legacy_rank"));
    assert!(text.ends_with("Line one.\n\nLine two with trailing spaces.  \n"));

    let imported = manager.import_record(&bytes).await.unwrap();
    assert_ne!(imported.id, record.id);
    assert_eq!(imported.body, record.body);
    assert_eq!(imported.extra, record.extra);
}

#[tokio::test]
async fn boards_are_live_predicates_over_the_collection() {
    let temp = TempDir::new().unwrap();
    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();

    let mut record = Record::new_task("reconcile invoices");
    record.context = Some("office".to_string());
    let mut record = manager.create_record(record).await.unwrap();

    assert_eq!(manager.board_records("context-office").await.unwrap().len(), 1);

    // Moving the record to another context changes membership on the next
    // evaluation, with no refresh step in between.
    record.context = Some("home".to_string());
    manager.update_record(record).await.unwrap();

    assert!(manager.board_records("context-office").await.unwrap().is_empty());
    assert_eq!(manager.board_records("context-home").await.unwrap().len(), 1);
}

#[tokio::test]
async fn rapid_edits_survive_shutdown_as_the_final_state() {
    let temp = TempDir::new().unwrap();
    let id;
    {
        let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();
        let mut record = manager
            .create_record(Record::new_task("draft 0"))
            .await
            .unwrap();
        id = record.id.clone();
        for n in 1..=20 {
            record.title = format!("draft {n}");
            record = manager.update_record(record).await.unwrap();
        }
        assert!(manager.shutdown().await.is_empty());
    }

    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();
    assert_eq!(manager.records().get(&id).await.unwrap().title, "draft 20");
}

#[tokio::test]
async fn watcher_folds_in_external_edits() {
    let temp = TempDir::new().unwrap();
    let manager = DataManager::initialize(watching_config(&temp)).await.unwrap();

    let record = manager
        .create_record(Record::new_task("shared with another app"))
        .await
        .unwrap();
    assert!(manager.save_all().await.is_empty());

    // Let our own write marks expire before editing from outside.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut rx = manager.subscribe();
    let outside = RecordRepository::new(temp.path(), WriteMarks::new());
    let mut theirs = manager.records().get(&record.id).await.unwrap();
    theirs.title = "retitled by another app".to_string();
    theirs.modified = Utc::now() + ChronoDuration::seconds(3);
    outside.write_record(&theirs).unwrap();

    let event = next_event_of_kind(&mut rx, "record_reloaded").await;
    match event {
        StoreEvent::RecordReloaded { record: reloaded } => {
            assert_eq!(reloaded.title, "retitled by another app");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        manager.records().get(&record.id).await.unwrap().title,
        "retitled by another app"
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_edits_surface_as_a_conflict_with_both_versions() {
    let temp = TempDir::new().unwrap();
    let mut config = watching_config(&temp);
    // Keep the local edit unsaved while the external edit arrives.
    config.debounce_ms = 30_000;
    let manager = DataManager::initialize(config).await.unwrap();

    let record = manager
        .create_record(Record::new_task("the original"))
        .await
        .unwrap();
    assert!(manager.save_all().await.is_empty());
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut local = manager.records().get(&record.id).await.unwrap();
    local.title = "our unsaved edit".to_string();
    manager.update_record(local).await.unwrap();
    assert!(manager.records().has_pending_write(&record.id));

    let mut rx = manager.subscribe();
    let outside = RecordRepository::new(temp.path(), WriteMarks::new());
    let mut theirs = record.clone();
    theirs.title = "their conflicting edit".to_string();
    theirs.modified = Utc::now() + ChronoDuration::seconds(3);
    outside.write_record(&theirs).unwrap();

    let event = next_event_of_kind(&mut rx, "record_conflicted").await;
    match event {
        StoreEvent::RecordConflicted { ours, theirs } => {
            assert_eq!(ours.title, "our unsaved edit");
            assert_eq!(theirs.unwrap().title, "their conflicting edit");
        }
        other => panic!("unexpected event {other:?}"),
    }
    // Nothing was auto-discarded.
    assert_eq!(
        manager.records().get(&record.id).await.unwrap().title,
        "our unsaved edit"
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn auto_hide_is_a_policy_not_a_deletion() {
    let temp = TempDir::new().unwrap();
    let manager = DataManager::initialize(offline_config(&temp)).await.unwrap();

    let mut record = Record::new_task("final punch list");
    record.project = Some("Kitchen Remodel".to_string());
    let record = manager.create_record(record).await.unwrap();

    // An open record keeps the project visible through any sweep.
    let future = Utc::now() + ChronoDuration::days(60);
    assert!(manager.apply_auto_hide_at(future).await.unwrap().is_empty());

    // With everything completed the project goes idle and hides.
    manager.complete_record(&record.id).await.unwrap();
    let hidden = manager.apply_auto_hide_at(future).await.unwrap();
    assert_eq!(hidden, vec!["project-kitchen-remodel".to_string()]);

    // Hidden, not gone: the board still evaluates.
    let board = manager.boards().board("project-kitchen-remodel").await.unwrap();
    assert!(board.hidden);
    assert_eq!(
        manager
            .board_records("project-kitchen-remodel")
            .await
            .unwrap()
            .len(),
        1
    );

    // A new open record in the project resurfaces it.
    let mut revival = Record::new_task("warranty follow-up");
    revival.project = Some("Kitchen Remodel".to_string());
    manager.create_record(revival).await.unwrap();
    let board = manager.boards().board("project-kitchen-remodel").await.unwrap();
    assert!(!board.hidden);
}
