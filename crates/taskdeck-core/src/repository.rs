//! File layout and atomic I/O for records and view specs.
//!
//! Records live under `tasks/active/YYYY/MM/<id>.md` and move to
//! `tasks/archive/YYYY/MM/<id>.md` on archival, so archival is a file move.
//! Custom boards and perspectives persist as JSON, one file per id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use taskdeck_types::{Board, Perspective, Record};
use walkdir::WalkDir;

use crate::codec;
use crate::error::{StoreError, StoreResult};

pub const TASKS_DIR: &str = "tasks";
pub const ACTIVE_DIR: &str = "active";
pub const ARCHIVE_DIR: &str = "archive";
pub const BOARDS_DIR: &str = "boards";
pub const PERSPECTIVES_DIR: &str = "perspectives";
pub const RECORD_EXT: &str = "md";

/// Paths the repository has written recently, so the watcher can tell the
/// store's own writes apart from external ones.
#[derive(Debug, Clone, Default)]
pub struct WriteMarks {
    inner: Arc<Mutex<HashMap<PathBuf, Instant>>>,
}

impl WriteMarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, path: &Path) {
        let mut marks = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        marks.insert(path.to_path_buf(), Instant::now());
    }

    /// True when `path` was written by us within `window`. Expired entries
    /// are pruned as a side effect.
    pub fn is_recent(&self, path: &Path, window: Duration) -> bool {
        let mut marks = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        marks.retain(|_, stamp| stamp.elapsed() < window);
        marks.contains_key(path)
    }
}

#[derive(Debug, Clone)]
pub struct RecordRepository {
    root: PathBuf,
    marks: WriteMarks,
}

impl RecordRepository {
    pub fn new(root: impl Into<PathBuf>, marks: WriteMarks) -> Self {
        Self {
            root: root.into(),
            marks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle to the write marks shared with the change watcher.
    pub fn marks(&self) -> WriteMarks {
        self.marks.clone()
    }

    pub fn tasks_root(&self) -> PathBuf {
        self.root.join(TASKS_DIR)
    }

    /// Creates the top-level directory skeleton. Idempotent; deeper
    /// year/month directories appear lazily on first write.
    pub fn bootstrap(&self) -> StoreResult<()> {
        for dir in [
            self.tasks_root().join(ACTIVE_DIR),
            self.tasks_root().join(ARCHIVE_DIR),
            self.root.join(BOARDS_DIR),
            self.root.join(PERSPECTIVES_DIR),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Canonical location of a record, a pure function of its identity,
    /// creation month, and archived flag.
    pub fn record_path(&self, record: &Record) -> PathBuf {
        let bucket = if record.archived { ARCHIVE_DIR } else { ACTIVE_DIR };
        self.tasks_root()
            .join(bucket)
            .join(record.created.format("%Y").to_string())
            .join(record.created.format("%m").to_string())
            .join(format!("{}.{RECORD_EXT}", record.id))
    }

    /// Encode and write a record atomically, creating parent directories
    /// as needed. Returns the path written.
    pub fn write_record(&self, record: &Record) -> StoreResult<PathBuf> {
        let path = self.record_path(record);
        let content = codec::encode_record(record)?;
        self.write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Read and decode one record file. The filename supplies the id when
    /// the frontmatter lacks one; the subtree supplies the archived flag.
    pub fn read_record(&self, path: &Path) -> StoreResult<(Record, Vec<String>)> {
        let content = fs::read_to_string(path)?;
        let (mut record, mut warnings) = codec::decode_record(&content).map_err(|err| match err {
            StoreError::Parse { reason, .. } => StoreError::parse(path, reason),
            other => other,
        })?;
        if record.id.is_empty() {
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => {
                    record.id = stem.to_string();
                    warnings.push(format!("id recovered from filename: {stem}"));
                }
                None => {
                    return Err(StoreError::parse(path, "no id in frontmatter or filename"))
                }
            }
        }
        record.archived = self.is_archive_path(path);
        Ok((record, warnings))
    }

    /// Delete a record's file. Missing files are fine; the caller's intent
    /// is "this record has no file", which already holds.
    pub fn remove_record(&self, record: &Record) -> StoreResult<()> {
        let path = self.record_path(record);
        self.marks.mark(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Every record file under the tasks tree, in stable path order.
    pub fn list_record_paths(&self) -> StoreResult<Vec<PathBuf>> {
        let root = self.tasks_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
            {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    pub fn is_archive_path(&self, path: &Path) -> bool {
        path.strip_prefix(self.tasks_root())
            .ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str() == ARCHIVE_DIR)
            .unwrap_or(false)
    }

    /// True for paths the watcher should interpret as record files.
    pub fn is_record_path(&self, path: &Path) -> bool {
        path.starts_with(self.tasks_root())
            && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
    }

    pub fn board_path(&self, id: &str) -> PathBuf {
        self.root.join(BOARDS_DIR).join(format!("{id}.json"))
    }

    pub fn perspective_path(&self, id: &str) -> PathBuf {
        self.root.join(PERSPECTIVES_DIR).join(format!("{id}.json"))
    }

    pub fn write_board(&self, board: &Board) -> StoreResult<PathBuf> {
        let path = self.board_path(&board.id);
        self.write_json(&path, board)?;
        Ok(path)
    }

    pub fn write_perspective(&self, perspective: &Perspective) -> StoreResult<PathBuf> {
        let path = self.perspective_path(&perspective.id);
        self.write_json(&path, perspective)?;
        Ok(path)
    }

    pub fn read_board(&self, path: &Path) -> StoreResult<Board> {
        self.read_json(path)
    }

    pub fn read_perspective(&self, path: &Path) -> StoreResult<Perspective> {
        self.read_json(path)
    }

    pub fn remove_board(&self, id: &str) -> StoreResult<()> {
        self.remove_json(self.board_path(id))
    }

    pub fn remove_perspective(&self, id: &str) -> StoreResult<()> {
        self.remove_json(self.perspective_path(id))
    }

    pub fn list_board_paths(&self) -> StoreResult<Vec<PathBuf>> {
        self.list_json(self.root.join(BOARDS_DIR))
    }

    pub fn list_perspective_paths(&self) -> StoreResult<Vec<PathBuf>> {
        self.list_json(self.root.join(PERSPECTIVES_DIR))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.write_atomic(path, format!("{text}\n").as_bytes())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<T> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| StoreError::parse(path, e.to_string()))
    }

    fn remove_json(&self, path: PathBuf) -> StoreResult<()> {
        self.marks.mark(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list_json(&self, dir: PathBuf) -> StoreResult<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Write to a sibling temp file and rename into place, so a crash
    /// mid-write never leaves a truncated file at the canonical path.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Validation(format!("path has no parent: {path:?}")))?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("record")
        ));
        fs::write(&tmp, bytes)?;
        self.marks.mark(path);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
