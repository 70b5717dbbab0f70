//! Top-level coordinator. Owns the repository, both stores, and the
//! change watcher, and keeps derived boards in step with record fields.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskdeck_types::{Filter, GroupBy, Record, SortSpec, Status, StoreEvent};

use crate::boards::BoardStore;
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::event_bus::EventBus;
use crate::records::{LoadSummary, RecordStore};
use crate::repository::{RecordRepository, WriteMarks};
use crate::views::{self, ViewGroup};
use crate::watcher::ChangeWatcher;

pub struct DataManager {
    config: StoreConfig,
    repository: RecordRepository,
    records: RecordStore,
    boards: BoardStore,
    bus: EventBus,
    watcher: Mutex<Option<ChangeWatcher>>,
    sync_cancel: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    load_summary: LoadSummary,
}

impl DataManager {
    /// Bring the store up: validate config, create the directory skeleton,
    /// load records and boards, materialize derived boards, run one
    /// auto-hide sweep, and start watching for external changes.
    pub async fn initialize(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let repository = RecordRepository::new(&config.root_dir, WriteMarks::new());
        repository.bootstrap()?;

        let bus = EventBus::new();
        let records = RecordStore::new(repository.clone(), bus.clone(), config.debounce());
        let boards = BoardStore::new(repository.clone(), bus.clone());

        let load_summary = records.load().await?;
        info!(
            loaded = load_summary.loaded,
            failed = load_summary.failures.len(),
            root = %config.root_dir.display(),
            "record store loaded"
        );
        for (path, err) in &load_summary.failures {
            warn!(path = %path.display(), error = %err, "record failed to load");
        }
        boards.load().await?;

        let manager = Self {
            config,
            repository,
            records,
            boards,
            bus,
            watcher: Mutex::new(None),
            sync_cancel: CancellationToken::new(),
            sync_task: Mutex::new(None),
            load_summary,
        };
        manager.materialize_derived_boards().await?;
        manager.apply_auto_hide().await?;

        // Derived boards track record events from any origin, watcher
        // adoptions included, not just the mutation methods below.
        *manager.sync_task.lock().await = Some(spawn_derived_sync(
            manager.boards.clone(),
            manager.bus.subscribe(),
            manager.sync_cancel.clone(),
        ));

        if manager.config.watcher_enabled {
            let watcher = ChangeWatcher::start(
                manager.repository.clone(),
                manager.records.clone(),
                manager.config.watch_suppression(),
            )?;
            *manager.watcher.lock().await = Some(watcher);
        }
        Ok(manager)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn boards(&self) -> &BoardStore {
        &self.boards
    }

    /// Per-file outcome of the initial bulk load.
    pub fn load_summary(&self) -> &LoadSummary {
        &self.load_summary
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.bus.subscribe()
    }

    pub async fn create_record(&self, record: Record) -> StoreResult<Record> {
        self.records.create(record.clone()).await?;
        self.ensure_boards_for(&record).await;
        Ok(record)
    }

    pub async fn update_record(&self, record: Record) -> StoreResult<Record> {
        let id = record.id.clone();
        self.records.update(record).await?;
        let Some(stored) = self.records.get(&id).await else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        self.ensure_boards_for(&stored).await;
        Ok(stored)
    }

    pub async fn delete_record(&self, id: &str) -> StoreResult<()> {
        self.records.delete(id).await
    }

    pub async fn archive_record(&self, id: &str) -> StoreResult<()> {
        self.records.archive(id).await
    }

    pub async fn unarchive_record(&self, id: &str) -> StoreResult<()> {
        self.records.unarchive(id).await
    }

    /// Move a record to a new status, keeping the completion timestamp
    /// consistent in both directions.
    pub async fn set_status(&self, id: &str, status: Status) -> StoreResult<Record> {
        let Some(mut record) = self.records.get(id).await else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        record.set_status(status);
        self.update_record(record).await
    }

    /// Completion is a status change; the record stays where it is until
    /// it is archived.
    pub async fn complete_record(&self, id: &str) -> StoreResult<Record> {
        self.set_status(id, Status::Completed).await
    }

    /// Serialize one record to its on-disk representation.
    pub async fn export_record(&self, id: &str) -> StoreResult<Vec<u8>> {
        let Some(record) = self.records.get(id).await else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        Ok(codec::encode_record(&record)?.into_bytes())
    }

    /// Decode an exported record and add it under a fresh identity.
    /// Identifiers are never reused, so importing the same bytes twice
    /// yields two independent records.
    pub async fn import_record(&self, bytes: &[u8]) -> StoreResult<Record> {
        let content = std::str::from_utf8(bytes)
            .map_err(|_| StoreError::Validation("import payload is not valid UTF-8".into()))?;
        let (mut record, warnings) = codec::decode_record(content)?;
        for warning in warnings {
            debug!(warning, "import warning");
        }
        record.id = uuid::Uuid::new_v4().to_string();
        record.touch();
        self.create_record(record).await
    }

    /// Filter, sort, and group the active records at this instant.
    pub async fn evaluate(
        &self,
        filter: &Filter,
        group_by: GroupBy,
        sort: SortSpec,
    ) -> Vec<ViewGroup> {
        let snapshot = self.records.active().await;
        views::evaluate(&snapshot, filter, group_by, sort, Utc::now())
    }

    pub async fn evaluate_perspective(&self, id: &str) -> StoreResult<Vec<ViewGroup>> {
        let Some(perspective) = self.boards.perspective(id).await else {
            return Err(StoreError::NotFound(format!("perspective {id}")));
        };
        let snapshot = self.records.active().await;
        Ok(views::evaluate_perspective(
            &snapshot,
            &perspective,
            Utc::now(),
        ))
    }

    /// Current membership of a board. Evaluated live; nothing is cached.
    pub async fn board_records(&self, id: &str) -> StoreResult<Vec<Record>> {
        let Some(board) = self.boards.board(id).await else {
            return Err(StoreError::NotFound(format!("board {id}")));
        };
        let snapshot = self.records.active().await;
        Ok(views::board_members(&snapshot, &board, Utc::now()))
    }

    /// Make sure every context and project in use has its derived board.
    pub async fn materialize_derived_boards(&self) -> StoreResult<()> {
        for context in self.records.contexts().await {
            self.boards.ensure_context_board(&context).await?;
        }
        for project in self.records.projects().await {
            self.boards.ensure_project_board(&project).await?;
        }
        Ok(())
    }

    /// One auto-hide sweep anchored at the current instant.
    pub async fn apply_auto_hide(&self) -> StoreResult<Vec<String>> {
        self.apply_auto_hide_at(Utc::now()).await
    }

    /// Hide auto-hide boards whose projects have wound down, and resurface
    /// hidden ones that have live records again.
    ///
    /// A board with any non-completed matching record never hides. Once
    /// every match is completed, the idle clock anchors on the newest of
    /// board creation, the newest matching `modified` (completion bumps
    /// it, so this marks when activity ceased), and the last manual
    /// un-hide. Anchored at `now` so sweeps are reproducible.
    pub async fn apply_auto_hide_at(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let active = self.records.active().await;
        let mut hidden_now = Vec::new();
        for board in self.boards.boards().await {
            if !board.auto_hide || board.built_in {
                continue;
            }
            let matching: Vec<&Record> = active
                .iter()
                .filter(|record| board.filter.matches(record, now))
                .collect();
            let has_live = matching.iter().any(|record| record.is_active());

            if board.hidden {
                if has_live {
                    self.boards.unhide_board(&board.id).await?;
                }
                continue;
            }
            if has_live {
                continue;
            }

            let days = board
                .auto_hide_days
                .unwrap_or(self.config.default_auto_hide_days);
            let mut anchor = board.created;
            if let Some(at) = matching.iter().map(|record| record.modified).max() {
                anchor = anchor.max(at);
            }
            if let Some(at) = board.unhidden_at {
                anchor = anchor.max(at);
            }
            if now - anchor > Duration::days(days as i64) {
                debug!(id = %board.id, "auto-hiding idle board");
                self.boards.hide_board(&board.id).await?;
                hidden_now.push(board.id);
            }
        }
        Ok(hidden_now)
    }

    /// Flush every record to disk. Failures are returned per record and
    /// never interrupt the rest of the flush.
    pub async fn save_all(&self) -> Vec<(String, StoreError)> {
        self.records.save_all().await
    }

    /// Stop watching and flush everything. The manager is inert afterwards
    /// apart from reads.
    pub async fn shutdown(&self) -> Vec<(String, StoreError)> {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        self.sync_cancel.cancel();
        if let Some(task) = self.sync_task.lock().await.take() {
            let _ = task.await;
        }
        let failures = self.save_all().await;
        info!(failed = failures.len(), "store shut down");
        failures
    }

    /// Inline companion to the event-driven sync: the board is already
    /// there when the mutation returns. A board write failure is logged,
    /// not propagated; the record mutation it trails has already stuck.
    async fn ensure_boards_for(&self, record: &Record) {
        if let Err(err) = sync_derived_boards(&self.boards, record).await {
            warn!(id = %record.id, error = %err, "derived board sync failed");
        }
    }
}

/// Derived boards exist for values in use; a live record reactivates a
/// hidden project board on sight. Edits to completed records do not.
async fn sync_derived_boards(boards: &BoardStore, record: &Record) -> StoreResult<()> {
    if let Some(context) = &record.context {
        boards.ensure_context_board(context).await?;
    }
    if let Some(project) = &record.project {
        let board = boards.ensure_project_board(project).await?;
        if board.hidden && board.auto_hide && record.is_active() {
            boards.unhide_board(&board.id).await?;
        }
    }
    Ok(())
}

/// Follow record events on the bus and keep derived boards in step, so
/// externally adopted records surface their contexts and projects too.
fn spawn_derived_sync(
    boards: BoardStore,
    mut rx: broadcast::Receiver<StoreEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Ok(
                    StoreEvent::RecordAdded { record }
                    | StoreEvent::RecordUpdated { record }
                    | StoreEvent::RecordReloaded { record }
                    | StoreEvent::RecordRestored { record },
                ) => {
                    if let Err(err) = sync_derived_boards(&boards, &record).await {
                        warn!(id = %record.id, error = %err, "derived board sync failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "derived board sync fell behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("derived board sync stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> StoreConfig {
        let mut config = StoreConfig::at(temp.path());
        config.debounce_ms = 50;
        config.watcher_enabled = false;
        config
    }

    #[tokio::test]
    async fn initialize_creates_the_skeleton_and_builtins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        assert!(temp.path().join("tasks/active").is_dir());
        assert!(temp.path().join("tasks/archive").is_dir());
        assert!(temp.path().join("boards").is_dir());
        assert!(temp.path().join("perspectives").is_dir());

        assert!(manager.boards().board("status-board").await.is_some());
        assert!(manager.boards().perspective("inbox").await.is_some());
        assert_eq!(manager.load_summary().loaded, 0);
    }

    #[tokio::test]
    async fn creating_records_materializes_derived_boards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let mut record = Record::new_task("Fix the gutters");
        record.context = Some("home".to_string());
        record.project = Some("House Maintenance".to_string());
        manager.create_record(record).await.expect("create");

        let context_board = manager
            .boards()
            .board("context-home")
            .await
            .expect("context board");
        assert!(!context_board.auto_hide);

        let project_board = manager
            .boards()
            .board("project-house-maintenance")
            .await
            .expect("project board");
        assert!(project_board.auto_hide);
        assert!(temp
            .path()
            .join("boards/project-house-maintenance.json")
            .exists());
    }

    #[tokio::test]
    async fn export_then_import_yields_a_fresh_identity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let mut original = Record::new_task("Call John about the contract");
        original.body = "He prefers mornings.".to_string();
        let original = manager.create_record(original).await.expect("create");

        let bytes = manager.export_record(&original.id).await.expect("export");
        let imported = manager.import_record(&bytes).await.expect("import");

        assert_ne!(imported.id, original.id);
        assert_eq!(imported.title, original.title);
        assert_eq!(imported.body, original.body);
        assert!(manager.records().get(&original.id).await.is_some());
        assert!(manager.records().get(&imported.id).await.is_some());
    }

    #[tokio::test]
    async fn perspectives_mask_completed_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let mut open = Record::new_task("still open");
        open.flagged = true;
        manager.create_record(open).await.expect("create");
        let mut done = Record::new_task("already done");
        done.flagged = true;
        let done = manager.create_record(done).await.expect("create");
        manager.complete_record(&done.id).await.expect("complete");

        let groups = manager
            .evaluate_perspective("flagged")
            .await
            .expect("evaluate");
        let titles: Vec<&str> = groups
            .iter()
            .flat_map(|g| g.records.iter().map(|r| r.title.as_str()))
            .collect();
        assert_eq!(titles, vec!["still open"]);

        let completed = manager
            .evaluate_perspective("completed")
            .await
            .expect("evaluate");
        assert_eq!(completed[0].records[0].id, done.id);
    }

    #[tokio::test]
    async fn idle_project_boards_hide_and_resurface() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let mut record = Record::new_task("ship the redesign");
        record.project = Some("Website".to_string());
        let record = manager.create_record(record).await.expect("create");

        // A project with an open record never hides, however stale.
        let future = Utc::now() + Duration::days(30);
        assert!(manager.apply_auto_hide_at(future).await.expect("sweep").is_empty());

        // Completing the last record starts the idle clock.
        manager.complete_record(&record.id).await.expect("complete");
        let hidden = manager.apply_auto_hide_at(future).await.expect("sweep");
        assert_eq!(hidden, vec!["project-website".to_string()]);
        assert!(!manager
            .boards()
            .visible_boards()
            .await
            .iter()
            .any(|b| b.id == "project-website"));

        // A fresh open record in the project brings the board back.
        let mut revival = Record::new_task("follow-up fixes");
        revival.project = Some("Website".to_string());
        manager.create_record(revival).await.expect("create");
        assert!(manager
            .boards()
            .visible_boards()
            .await
            .iter()
            .any(|b| b.id == "project-website"));
    }

    #[tokio::test]
    async fn sweep_resurfaces_boards_with_live_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let mut record = Record::new_task("wrap up");
        record.project = Some("Garage".to_string());
        let record = manager.create_record(record).await.expect("create");
        manager.complete_record(&record.id).await.expect("complete");

        let future = Utc::now() + Duration::days(30);
        assert_eq!(
            manager.apply_auto_hide_at(future).await.expect("sweep"),
            vec!["project-garage".to_string()]
        );

        // Reopened through the store layer, below the facade; the sweep
        // still notices the live record.
        let mut reopened = manager.records().get(&record.id).await.expect("present");
        reopened.set_status(Status::Actionable);
        manager.records().update(reopened).await.expect("update");

        assert!(manager.apply_auto_hide_at(future).await.expect("sweep").is_empty());
        assert!(!manager
            .boards()
            .board("project-garage")
            .await
            .expect("board")
            .hidden);
    }

    #[tokio::test]
    async fn externally_adopted_records_get_their_boards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        // A file written by another process, noticed after startup.
        let outside = RecordRepository::new(temp.path(), WriteMarks::new());
        let mut record = Record::new_task("from another machine");
        record.project = Some("Side Quest".to_string());
        let path = outside.write_record(&record).expect("write");

        manager
            .records()
            .reconcile_external_change(&path)
            .await
            .expect("reconcile");

        let mut found = false;
        for _ in 0..100 {
            if manager.boards().board("project-side-quest").await.is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(found, "derived board never materialized");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        let record = manager
            .create_record(Record::new_task("almost lost"))
            .await
            .expect("create");
        assert!(manager.records().has_pending_write(&record.id));

        let failures = manager.shutdown().await;
        assert!(failures.is_empty());

        let reopened = DataManager::initialize(test_config(&temp))
            .await
            .expect("reopen");
        assert_eq!(reopened.load_summary().loaded, 1);
        assert!(reopened.records().get(&record.id).await.is_some());
    }

    #[tokio::test]
    async fn missing_ids_surface_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = DataManager::initialize(test_config(&temp))
            .await
            .expect("initialize");

        assert!(matches!(
            manager.board_records("no-such-board").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            manager.export_record("no-such-record").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            manager.evaluate_perspective("no-such-view").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
