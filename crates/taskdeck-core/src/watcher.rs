//! Filesystem watcher that folds external edits into the live store.
//!
//! Notify's callback runs on its own thread, so events cross into the
//! async world over a channel bridge. Paths we wrote ourselves carry a
//! recent write mark and are dropped before they reach the store.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::records::RecordStore;
use crate::repository::{RecordRepository, WriteMarks};

pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Watch the storage tree recursively and dispatch external changes
    /// into the record store. Non-record paths (board JSON, temp files)
    /// are filtered out at dispatch.
    pub fn start(
        repository: RecordRepository,
        records: RecordStore,
        suppression: Duration,
    ) -> StoreResult<Self> {
        let root = repository.root().to_path_buf();
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Result<Event, notify::Error>>();
        let mut watcher = RecommendedWatcher::new(raw_tx, notify::Config::default())?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(path = %root.display(), "watching storage tree");

        // Bridge from notify's sync channel into the async loop. The thread
        // exits when the watcher drops (sender closed) or the loop drops
        // its receiver.
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for result in raw_rx {
                if tx.send(result).is_err() {
                    break;
                }
            }
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            repository,
            records,
            suppression,
            rx,
            cancel.clone(),
        ));
        Ok(Self {
            _watcher: watcher,
            cancel,
            handle,
        })
    }

    /// Stop dispatching and wait for the loop to wind down. Queued events
    /// are dropped; the shutdown flush persists memory regardless.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_loop(
    repository: RecordRepository,
    records: RecordStore,
    suppression: Duration,
    mut rx: mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
    cancel: CancellationToken,
) {
    let marks = repository.marks();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        match next {
            None => break,
            Some(Err(err)) => warn!(error = %err, "watch error"),
            Some(Ok(event)) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                for path in event.paths {
                    dispatch(&repository, &records, &marks, suppression, path).await;
                }
            }
        }
    }
    debug!("change watcher stopped");
}

/// Route one event path. Whether a path is a change or a removal is read
/// from the filesystem, not the event kind; notify's kind taxonomy varies
/// by platform and rename events arrive as both.
async fn dispatch(
    repository: &RecordRepository,
    records: &RecordStore,
    marks: &WriteMarks,
    suppression: Duration,
    path: PathBuf,
) {
    if !repository.is_record_path(&path) {
        return;
    }
    if marks.is_recent(&path, suppression) {
        debug!(path = %path.display(), "own write echoed back, ignoring");
        return;
    }
    let result = if path.exists() {
        records.reconcile_external_change(&path).await
    } else {
        records.reconcile_external_removal(&path).await
    };
    match result {
        Ok(()) => {}
        Err(StoreError::Conflict { id }) => {
            warn!(id, path = %path.display(), "external change collides with unsaved edits");
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to reconcile external event");
        }
    }
}
