//! Registry for boards and perspectives.
//!
//! Unlike records, these are small and edited rarely, so every mutation
//! persists immediately instead of going through the debounce. As with
//! records, memory changes first and the event follows it; a failed
//! write still surfaces its error. Built-in entries exist only in
//! memory and reject edits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use taskdeck_types::{
    Board, BoardLayout, Filter, GroupBy, Perspective, SortKey, SortSpec, Status, StoreEvent,
};

use crate::error::{StoreError, StoreResult};
use crate::event_bus::EventBus;
use crate::repository::RecordRepository;

/// Stable id of the built-in status board.
pub const STATUS_BOARD_ID: &str = "status-board";

#[derive(Clone)]
pub struct BoardStore {
    repository: RecordRepository,
    boards: Arc<RwLock<HashMap<String, Board>>>,
    perspectives: Arc<RwLock<HashMap<String, Perspective>>>,
    bus: EventBus,
}

impl BoardStore {
    pub fn new(repository: RecordRepository, bus: EventBus) -> Self {
        let mut boards = HashMap::new();
        for board in builtin_boards() {
            boards.insert(board.id.clone(), board);
        }
        let mut perspectives = HashMap::new();
        for perspective in builtin_perspectives() {
            perspectives.insert(perspective.id.clone(), perspective);
        }
        Self {
            repository,
            boards: Arc::new(RwLock::new(boards)),
            perspectives: Arc::new(RwLock::new(perspectives)),
            bus,
        }
    }

    /// Read every saved board and perspective from disk. Unreadable files
    /// are logged and skipped; built-ins are never overwritten by files.
    pub async fn load(&self) -> StoreResult<()> {
        for path in self.repository.list_board_paths()? {
            match self.repository.read_board(&path) {
                Ok(board) => {
                    let mut boards = self.boards.write().await;
                    match boards.get(&board.id) {
                        Some(existing) if existing.built_in => {
                            warn!(id = %board.id, "board file shadows a built-in, skipping");
                        }
                        _ => {
                            boards.insert(board.id.clone(), board);
                        }
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable board");
                }
            }
        }
        for path in self.repository.list_perspective_paths()? {
            match self.repository.read_perspective(&path) {
                Ok(perspective) => {
                    let mut perspectives = self.perspectives.write().await;
                    match perspectives.get(&perspective.id) {
                        Some(existing) if existing.built_in => {
                            warn!(id = %perspective.id, "perspective file shadows a built-in, skipping");
                        }
                        _ => {
                            perspectives.insert(perspective.id.clone(), perspective);
                        }
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable perspective");
                }
            }
        }
        Ok(())
    }

    pub async fn board(&self, id: &str) -> Option<Board> {
        self.boards.read().await.get(id).cloned()
    }

    /// Every board, hidden ones included, sorted by name for stable output.
    pub async fn boards(&self) -> Vec<Board> {
        let mut boards: Vec<Board> = self.boards.read().await.values().cloned().collect();
        boards.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        boards
    }

    pub async fn visible_boards(&self) -> Vec<Board> {
        self.boards().await.into_iter().filter(|b| !b.hidden).collect()
    }

    pub async fn perspective(&self, id: &str) -> Option<Perspective> {
        self.perspectives.read().await.get(id).cloned()
    }

    /// Every perspective, built-ins first, each group sorted by name.
    pub async fn perspectives(&self) -> Vec<Perspective> {
        let mut perspectives: Vec<Perspective> =
            self.perspectives.read().await.values().cloned().collect();
        perspectives.sort_by(|a, b| {
            b.built_in
                .cmp(&a.built_in)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        perspectives
    }

    pub async fn create_board(&self, board: Board) -> StoreResult<()> {
        if board.id.trim().is_empty() {
            return Err(StoreError::Validation("board id must not be empty".into()));
        }
        if board.name.trim().is_empty() {
            return Err(StoreError::Validation("board name must not be empty".into()));
        }
        {
            let mut boards = self.boards.write().await;
            if boards.contains_key(&board.id) {
                return Err(StoreError::Validation(format!(
                    "board id already exists: {}",
                    board.id
                )));
            }
            boards.insert(board.id.clone(), board.clone());
        }
        self.bus.publish(StoreEvent::BoardAdded {
            board: board.clone(),
        });
        self.repository.write_board(&board)?;
        Ok(())
    }

    pub async fn update_board(&self, mut board: Board) -> StoreResult<()> {
        {
            let mut boards = self.boards.write().await;
            match boards.get(&board.id) {
                None => return Err(StoreError::NotFound(format!("board {}", board.id))),
                Some(existing) if existing.built_in => {
                    return Err(StoreError::Validation(format!(
                        "built-in board cannot be modified: {}",
                        board.id
                    )));
                }
                Some(_) => {}
            }
            board.touch();
            boards.insert(board.id.clone(), board.clone());
        }
        self.bus.publish(StoreEvent::BoardUpdated {
            board: board.clone(),
        });
        self.repository.write_board(&board)?;
        Ok(())
    }

    pub async fn delete_board(&self, id: &str) -> StoreResult<()> {
        {
            let mut boards = self.boards.write().await;
            match boards.get(id) {
                None => return Err(StoreError::NotFound(format!("board {id}"))),
                Some(existing) if existing.built_in => {
                    return Err(StoreError::Validation(format!(
                        "built-in board cannot be deleted: {id}"
                    )));
                }
                Some(_) => {}
            }
            boards.remove(id);
        }
        self.bus.publish(StoreEvent::BoardRemoved { id: id.to_string() });
        self.repository.remove_board(id)?;
        Ok(())
    }

    pub async fn hide_board(&self, id: &str) -> StoreResult<()> {
        self.set_hidden(id, true).await
    }

    /// Un-hide and stamp the moment, so the auto-hide policy treats the
    /// board as recently touched even if its records stay idle.
    pub async fn unhide_board(&self, id: &str) -> StoreResult<()> {
        self.set_hidden(id, false).await
    }

    async fn set_hidden(&self, id: &str, hidden: bool) -> StoreResult<()> {
        let Some(mut board) = self.board(id).await else {
            return Err(StoreError::NotFound(format!("board {id}")));
        };
        if board.hidden == hidden {
            return Ok(());
        }
        board.hidden = hidden;
        if !hidden {
            board.unhidden_at = Some(Utc::now());
        }
        self.update_board(board).await
    }

    /// Make sure a derived board exists for the context. Returns the board,
    /// creating and persisting it on first sight of the value.
    pub async fn ensure_context_board(&self, context: &str) -> StoreResult<Board> {
        self.ensure_derived(Board::for_context(context)).await
    }

    /// Make sure a derived board exists for the project.
    pub async fn ensure_project_board(&self, project: &str) -> StoreResult<Board> {
        self.ensure_derived(Board::for_project(project)).await
    }

    /// Check-and-insert under one lock: concurrent callers racing on the
    /// same value agree on a single board and a single BoardAdded event.
    /// Distinct labels can slug to the same id; the later arrival gets a
    /// numbered id, so every label keeps a board whose filter matches it.
    async fn ensure_derived(&self, template: Board) -> StoreResult<Board> {
        let board = {
            let mut boards = self.boards.write().await;
            let base = template.id.clone();
            let mut candidate = base.clone();
            let mut n = 1;
            loop {
                match boards.get(&candidate) {
                    Some(existing) if existing.filter == template.filter => {
                        return Ok(existing.clone());
                    }
                    Some(_) => {
                        n += 1;
                        candidate = format!("{base}-{n}");
                    }
                    None => break,
                }
            }
            let mut board = template;
            board.id = candidate;
            boards.insert(board.id.clone(), board.clone());
            board
        };
        self.bus.publish(StoreEvent::BoardAdded {
            board: board.clone(),
        });
        self.repository.write_board(&board)?;
        Ok(board)
    }

    pub async fn create_perspective(&self, perspective: Perspective) -> StoreResult<()> {
        if perspective.id.trim().is_empty() {
            return Err(StoreError::Validation(
                "perspective id must not be empty".into(),
            ));
        }
        if perspective.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "perspective name must not be empty".into(),
            ));
        }
        {
            let mut perspectives = self.perspectives.write().await;
            if perspectives.contains_key(&perspective.id) {
                return Err(StoreError::Validation(format!(
                    "perspective id already exists: {}",
                    perspective.id
                )));
            }
            perspectives.insert(perspective.id.clone(), perspective.clone());
        }
        self.bus.publish(StoreEvent::PerspectiveAdded {
            perspective: perspective.clone(),
        });
        self.repository.write_perspective(&perspective)?;
        Ok(())
    }

    pub async fn update_perspective(&self, mut perspective: Perspective) -> StoreResult<()> {
        {
            let mut perspectives = self.perspectives.write().await;
            match perspectives.get(&perspective.id) {
                None => {
                    return Err(StoreError::NotFound(format!(
                        "perspective {}",
                        perspective.id
                    )))
                }
                Some(existing) if existing.built_in => {
                    return Err(StoreError::Validation(format!(
                        "built-in perspective cannot be modified: {}",
                        perspective.id
                    )));
                }
                Some(_) => {}
            }
            perspective.touch();
            perspectives.insert(perspective.id.clone(), perspective.clone());
        }
        self.bus.publish(StoreEvent::PerspectiveUpdated {
            perspective: perspective.clone(),
        });
        self.repository.write_perspective(&perspective)?;
        Ok(())
    }

    pub async fn delete_perspective(&self, id: &str) -> StoreResult<()> {
        {
            let mut perspectives = self.perspectives.write().await;
            match perspectives.get(id) {
                None => return Err(StoreError::NotFound(format!("perspective {id}"))),
                Some(existing) if existing.built_in => {
                    return Err(StoreError::Validation(format!(
                        "built-in perspective cannot be deleted: {id}"
                    )));
                }
                Some(_) => {}
            }
            perspectives.remove(id);
        }
        self.bus
            .publish(StoreEvent::PerspectiveRemoved { id: id.to_string() });
        self.repository.remove_perspective(id)?;
        Ok(())
    }
}

/// The ships-with-the-store board: one column per status over every
/// active record.
fn builtin_boards() -> Vec<Board> {
    let mut status_board = Board::new_custom("Status Board", Filter::all(vec![]));
    status_board.id = STATUS_BOARD_ID.to_string();
    status_board.layout = BoardLayout::Columns;
    status_board.columns = Status::ALL.iter().map(|s| s.as_str().to_string()).collect();
    status_board.built_in = true;
    vec![status_board]
}

fn builtin_perspectives() -> Vec<Perspective> {
    let mut completed = Perspective::builtin(
        "completed",
        "Completed",
        Filter::status(Status::Completed),
    );
    completed.show_completed = true;
    completed.sort = SortSpec::descending(SortKey::CompletedAt);

    let mut next_actions = Perspective::builtin(
        "next-actions",
        "Next Actions",
        Filter::all(vec![Filter::status(Status::Actionable), Filter::Available]),
    );
    next_actions.group_by = GroupBy::Context;
    next_actions.sort = SortSpec::ascending(SortKey::Due);

    let mut deferred = Perspective::builtin(
        "deferred",
        "Deferred",
        Filter::status(Status::Deferred),
    );
    deferred.sort = SortSpec::ascending(SortKey::DeferUntil);

    let mut due_soon = Perspective::builtin(
        "due-soon",
        "Due Soon",
        Filter::DueWithinDays { days: 7 },
    );
    due_soon.group_by = GroupBy::DueBucket;
    due_soon.sort = SortSpec::ascending(SortKey::Due);

    vec![
        Perspective::builtin("inbox", "Inbox", Filter::status(Status::Inbox)),
        next_actions,
        Perspective::builtin("waiting", "Waiting", Filter::status(Status::Blocked)),
        deferred,
        due_soon,
        Perspective::builtin("flagged", "Flagged", Filter::Flagged),
        completed,
    ]
}
