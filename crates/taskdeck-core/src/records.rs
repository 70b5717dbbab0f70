//! The live record collection: authoritative in-memory state, synchronous
//! mutation, and debounced write-back.
//!
//! Mutations update the map first and schedule persistence second, so a
//! read issued right after a write always sees the new state. Disk is a
//! trailing copy; a failed write never rolls back memory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskdeck_types::{Filter, Record, Status, StoreEvent, StoreStats};

use crate::error::{StoreError, StoreResult};
use crate::event_bus::EventBus;
use crate::repository::RecordRepository;

/// Outcome of a bulk load. Failures are per-file and never abort the rest
/// of the directory.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failures: Vec<(PathBuf, StoreError)>,
}

struct PendingWrite {
    generation: u64,
    cancel: CancellationToken,
}

/// Debounce slots keyed by record id. Arming a slot cancels and replaces
/// any previous one; a fire must claim its slot (same generation) before
/// writing, so cancel-versus-fire races resolve one way: once a fire has
/// claimed, nothing can stop its write.
#[derive(Clone, Default)]
struct PendingWrites {
    inner: Arc<Mutex<HashMap<String, PendingWrite>>>,
    generations: Arc<AtomicU64>,
}

impl PendingWrites {
    fn arm(&self, id: &str) -> (u64, CancellationToken) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let mut slots = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slots.insert(
            id.to_string(),
            PendingWrite {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }
        (generation, cancel)
    }

    fn claim(&self, id: &str, generation: u64) -> bool {
        let mut slots = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match slots.get(id) {
            Some(slot) if slot.generation == generation => {
                slots.remove(id);
                true
            }
            _ => false,
        }
    }

    fn cancel(&self, id: &str) {
        let mut slots = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.remove(id) {
            slot.cancel.cancel();
        }
    }

    fn drain(&self) -> Vec<String> {
        let mut slots = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let ids = slots.keys().cloned().collect();
        for slot in slots.values() {
            slot.cancel.cancel();
        }
        slots.clear();
        ids
    }

    fn contains(&self, id: &str) -> bool {
        let slots = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        slots.contains_key(id)
    }
}

#[derive(Clone)]
pub struct RecordStore {
    repository: RecordRepository,
    records: Arc<RwLock<HashMap<String, Record>>>,
    pending: PendingWrites,
    /// Ids deleted this session. Ids are never reused, so a late fire or a
    /// watcher event for one of these is always stale.
    removed: Arc<Mutex<HashSet<String>>>,
    /// Per id, the `modified` stamp of the version last seen on disk.
    /// The conflict check compares external edits against this.
    last_synced: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    bus: EventBus,
    debounce: Duration,
}

impl RecordStore {
    pub fn new(repository: RecordRepository, bus: EventBus, debounce: Duration) -> Self {
        Self {
            repository,
            records: Arc::new(RwLock::new(HashMap::new())),
            pending: PendingWrites::default(),
            removed: Arc::new(Mutex::new(HashSet::new())),
            last_synced: Arc::new(RwLock::new(HashMap::new())),
            bus: bus.clone(),
            debounce,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.bus.subscribe()
    }

    /// Bulk-read every record file into memory. Files that fail to parse
    /// are logged and reported, never fatal.
    pub async fn load(&self) -> StoreResult<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut loaded: HashMap<String, Record> = HashMap::new();
        let mut synced = HashMap::new();
        for path in self.repository.list_record_paths()? {
            match self.repository.read_record(&path) {
                Ok((record, warnings)) => {
                    for warning in warnings {
                        debug!(path = %path.display(), warning, "record loaded with warning");
                    }
                    // A torn move can leave a copy in both subtrees; the
                    // newer one wins.
                    match loaded.get(&record.id) {
                        Some(existing) if existing.modified >= record.modified => {
                            debug!(id = %record.id, path = %path.display(), "older duplicate skipped");
                        }
                        _ => {
                            synced.insert(record.id.clone(), record.modified);
                            loaded.insert(record.id.clone(), record);
                        }
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable record");
                    summary.failures.push((path, err));
                }
            }
        }
        summary.loaded = loaded.len();
        *self.records.write().await = loaded;
        *self.last_synced.write().await = synced;
        Ok(summary)
    }

    pub async fn get(&self, id: &str) -> Option<Record> {
        self.records.read().await.get(id).cloned()
    }

    /// Every record in memory, archived ones included.
    pub async fn list_all(&self) -> Vec<Record> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn active(&self) -> Vec<Record> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.archived)
            .cloned()
            .collect()
    }

    pub async fn archived(&self) -> Vec<Record> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.archived)
            .cloned()
            .collect()
    }

    /// Evaluate a filter verbatim against everything in memory, archived
    /// records included. View surfaces that want only the working set pass
    /// an `active()` snapshot to the filter engine instead.
    pub async fn query(&self, filter: &Filter) -> Vec<Record> {
        let now = Utc::now();
        self.records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r, now))
            .cloned()
            .collect()
    }

    pub async fn by_status(&self, status: Status) -> Vec<Record> {
        self.filtered(|r, _| r.status == status).await
    }

    pub async fn by_context(&self, context: &str) -> Vec<Record> {
        self.filtered(|r, _| r.context.as_deref() == Some(context))
            .await
    }

    pub async fn by_project(&self, project: &str) -> Vec<Record> {
        self.filtered(|r, _| r.project.as_deref() == Some(project))
            .await
    }

    pub async fn overdue(&self) -> Vec<Record> {
        self.filtered(|r, now| r.is_overdue(now)).await
    }

    pub async fn due_today(&self) -> Vec<Record> {
        self.filtered(|r, now| r.is_due_today(now)).await
    }

    pub async fn flagged(&self) -> Vec<Record> {
        self.filtered(|r, _| r.flagged).await
    }

    /// Case-insensitive substring search over titles and bodies.
    pub async fn search(&self, text: &str) -> Vec<Record> {
        let needle = text.to_lowercase();
        self.filtered(|r, _| {
            r.title.to_lowercase().contains(&needle) || r.body.to_lowercase().contains(&needle)
        })
        .await
    }

    async fn filtered<F>(&self, keep: F) -> Vec<Record>
    where
        F: Fn(&Record, DateTime<Utc>) -> bool,
    {
        let now = Utc::now();
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.archived && keep(r, now))
            .cloned()
            .collect()
    }

    /// Distinct context labels over active records, sorted.
    pub async fn contexts(&self) -> Vec<String> {
        self.labels(|r| r.context.clone()).await
    }

    /// Distinct project labels over active records, sorted.
    pub async fn projects(&self) -> Vec<String> {
        self.labels(|r| r.project.clone()).await
    }

    async fn labels<F>(&self, label_of: F) -> Vec<String>
    where
        F: Fn(&Record) -> Option<String>,
    {
        let mut labels: Vec<String> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.archived)
            .filter_map(&label_of)
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }

    pub async fn stats(&self) -> StoreStats {
        let now = Utc::now();
        let records = self.records.read().await;
        let mut stats = StoreStats {
            total: records.len(),
            ..StoreStats::default()
        };
        for record in records.values() {
            if record.archived {
                stats.archived += 1;
                continue;
            }
            match record.kind {
                taskdeck_types::RecordKind::Note => stats.notes += 1,
                taskdeck_types::RecordKind::Task => stats.tasks += 1,
            }
            match record.status {
                Status::Inbox => stats.inbox += 1,
                Status::Actionable => stats.actionable += 1,
                Status::Blocked => stats.blocked += 1,
                Status::Deferred => stats.deferred += 1,
                Status::Completed => stats.completed += 1,
            }
            if record.flagged {
                stats.flagged += 1;
            }
            if record.is_overdue(now) {
                stats.overdue += 1;
            }
        }
        stats
    }

    pub async fn create(&self, record: Record) -> StoreResult<()> {
        if record.id.trim().is_empty() {
            return Err(StoreError::Validation("record id must not be empty".into()));
        }
        {
            let mut records = self.records.write().await;
            if records.contains_key(&record.id) {
                return Err(StoreError::Validation(format!(
                    "record id already exists: {}",
                    record.id
                )));
            }
            records.insert(record.id.clone(), record.clone());
        }
        self.removed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&record.id);
        self.bus.publish(StoreEvent::RecordAdded {
            record: record.clone(),
        });
        self.schedule_write(&record.id);
        Ok(())
    }

    pub async fn update(&self, mut record: Record) -> StoreResult<()> {
        record.touch();
        {
            let mut records = self.records.write().await;
            let Some(stored) = records.get(&record.id) else {
                return Err(StoreError::NotFound(format!("record {}", record.id)));
            };
            // The archive flag belongs to archive()/unarchive(), which move
            // the file between subtrees. A plain update must not flip it.
            record.archived = stored.archived;
            records.insert(record.id.clone(), record.clone());
        }
        self.bus.publish(StoreEvent::RecordUpdated {
            record: record.clone(),
        });
        self.schedule_write(&record.id);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let Some(record) = self.records.write().await.remove(id) else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        {
            let mut removed = self.removed.lock().unwrap_or_else(|p| p.into_inner());
            removed.insert(id.to_string());
        }
        self.pending.cancel(id);
        self.last_synced.write().await.remove(id);
        self.bus.publish(StoreEvent::RecordRemoved {
            id: id.to_string(),
        });
        // Memory already dropped the record; a failed unlink only leaves a
        // stale file behind, and the tombstone keeps it from being re-adopted.
        self.repository.remove_record(&record)?;
        Ok(())
    }

    /// Move a record into the archive subtree. This is a file move, so it
    /// bypasses the debounce and persists right away.
    pub async fn archive(&self, id: &str) -> StoreResult<()> {
        self.relocate(id, true).await
    }

    pub async fn unarchive(&self, id: &str) -> StoreResult<()> {
        self.relocate(id, false).await
    }

    async fn relocate(&self, id: &str, archived: bool) -> StoreResult<()> {
        let Some(old) = self.get(id).await else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        if old.archived == archived {
            return Ok(());
        }
        self.pending.cancel(id);

        let mut record = old.clone();
        record.archived = archived;
        record.touch();
        self.records
            .write()
            .await
            .insert(id.to_string(), record.clone());
        self.bus.publish(if archived {
            StoreEvent::RecordArchived {
                record: record.clone(),
            }
        } else {
            StoreEvent::RecordRestored {
                record: record.clone(),
            }
        });

        // Disk trails memory here too: the new home is written before the
        // old one is unlinked, so a failure strands at worst a stale
        // duplicate for the next load to supersede.
        self.repository.write_record(&record)?;
        self.repository.remove_record(&old)?;
        self.last_synced
            .write()
            .await
            .insert(id.to_string(), record.modified);
        Ok(())
    }

    /// True while a debounced write for this id is armed but has not fired.
    pub fn has_pending_write(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    /// Write one record now, cancelling any armed debounce slot first.
    pub async fn save_immediately(&self, id: &str) -> StoreResult<()> {
        self.pending.cancel(id);
        self.persist(id).await
    }

    /// Flush every record to disk, draining all pending debounce slots.
    /// Returns the records that could not be written; memory keeps the
    /// authoritative state either way.
    pub async fn save_all(&self) -> Vec<(String, StoreError)> {
        self.pending.drain();
        let snapshot = self.list_all().await;
        let mut failures = Vec::new();
        for record in snapshot {
            match self.repository.write_record(&record) {
                Ok(_) => {
                    self.last_synced
                        .write()
                        .await
                        .insert(record.id.clone(), record.modified);
                }
                Err(err) => {
                    warn!(id = %record.id, error = %err, "save_all: write failed");
                    failures.push((record.id, err));
                }
            }
        }
        failures
    }

    fn schedule_write(&self, id: &str) {
        let (generation, cancel) = self.pending.arm(id);
        let store = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(store.debounce) => {}
            }
            if !store.pending.claim(&id, generation) {
                return;
            }
            if let Err(err) = store.persist(&id).await {
                warn!(id = %id, error = %err, "debounced write failed");
            }
        });
    }

    async fn persist(&self, id: &str) -> StoreResult<()> {
        {
            let removed = self.removed.lock().unwrap_or_else(|p| p.into_inner());
            if removed.contains(id) {
                return Ok(());
            }
        }
        let Some(record) = self.get(id).await else {
            return Err(StoreError::NotFound(format!("record {id}")));
        };
        self.repository.write_record(&record)?;
        self.last_synced
            .write()
            .await
            .insert(id.to_string(), record.modified);
        Ok(())
    }

    /// Fold an externally created or modified file into memory.
    ///
    /// External-newer with no local pending edits replaces the in-memory
    /// copy. External change on top of unsaved local edits is a true
    /// conflict: both versions travel on a `RecordConflicted` event, neither
    /// is discarded, and the call returns `StoreError::Conflict`.
    pub async fn reconcile_external_change(&self, path: &Path) -> StoreResult<()> {
        let (theirs, warnings) = self.repository.read_record(path)?;
        for warning in warnings {
            debug!(path = %path.display(), warning, "external record warning");
        }
        let id = theirs.id.clone();
        {
            let removed = self.removed.lock().unwrap_or_else(|p| p.into_inner());
            if removed.contains(&id) {
                debug!(id, "ignoring external change for deleted record");
                return Ok(());
            }
        }

        let ours = self.get(&id).await;
        let Some(ours) = ours else {
            self.records
                .write()
                .await
                .insert(id.clone(), theirs.clone());
            self.last_synced
                .write()
                .await
                .insert(id, theirs.modified);
            self.bus.publish(StoreEvent::RecordAdded { record: theirs });
            return Ok(());
        };

        let last_synced = self
            .last_synced
            .read()
            .await
            .get(&id)
            .copied()
            .unwrap_or(ours.modified);
        let pending = self.pending.contains(&id);

        if pending && theirs.modified > last_synced {
            self.bus.publish(StoreEvent::RecordConflicted {
                ours,
                theirs: Some(theirs),
            });
            return Err(StoreError::Conflict { id });
        }
        if theirs.modified > ours.modified {
            self.records
                .write()
                .await
                .insert(id.clone(), theirs.clone());
            self.last_synced
                .write()
                .await
                .insert(id, theirs.modified);
            self.bus
                .publish(StoreEvent::RecordReloaded { record: theirs });
            return Ok(());
        }
        if theirs.archived != ours.archived && !pending {
            // Same content, moved between subtrees by an external actor.
            self.records
                .write()
                .await
                .insert(id.clone(), theirs.clone());
            self.last_synced.write().await.insert(id, theirs.modified);
            self.bus.publish(if theirs.archived {
                StoreEvent::RecordArchived { record: theirs }
            } else {
                StoreEvent::RecordRestored { record: theirs }
            });
            return Ok(());
        }
        debug!(id, "external change is not newer, ignoring");
        Ok(())
    }

    /// Fold an external file deletion into memory. A move to the other
    /// subtree is not a deletion; the record is reloaded from its new
    /// home instead.
    pub async fn reconcile_external_removal(&self, path: &Path) -> StoreResult<()> {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            return Ok(());
        };
        let Some(ours) = self.get(&id).await else {
            return Ok(());
        };

        // The probe side comes from the removed path, not the in-memory
        // flag: when a move's create event arrived first, the flag already
        // points at the new home and its negation would probe the side
        // that was just removed.
        let mut relocated = ours.clone();
        relocated.archived = !self.repository.is_archive_path(path);
        let other_home = self.repository.record_path(&relocated);
        if other_home.exists() {
            return self.reconcile_external_change(&other_home).await;
        }

        if self.pending.contains(&id) {
            self.bus.publish(StoreEvent::RecordConflicted {
                ours,
                theirs: None,
            });
            return Err(StoreError::Conflict { id });
        }

        self.records.write().await.remove(&id);
        self.last_synced.write().await.remove(&id);
        self.bus.publish(StoreEvent::RecordRemoved { id });
        Ok(())
    }
}
