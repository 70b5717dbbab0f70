use serde::{Deserialize, Serialize};

use crate::board::{Board, Perspective};
use crate::record::Record;

/// Broadcast notification of a change to the live collection.
///
/// Events describe state that has already been applied in memory; consumers
/// must not treat them as requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    RecordAdded { record: Record },
    RecordUpdated { record: Record },
    RecordRemoved { id: String },
    RecordArchived { record: Record },
    RecordRestored { record: Record },
    /// An external edit was accepted and replaced the in-memory version.
    RecordReloaded { record: Record },
    /// Disk and memory diverged while local edits were unsaved. `ours`
    /// stays authoritative; `theirs` is `None` when the file disappeared.
    RecordConflicted {
        ours: Record,
        theirs: Option<Record>,
    },
    BoardAdded { board: Board },
    BoardUpdated { board: Board },
    BoardRemoved { id: String },
    PerspectiveAdded { perspective: Perspective },
    PerspectiveUpdated { perspective: Perspective },
    PerspectiveRemoved { id: String },
}

impl StoreEvent {
    /// Stable label for log lines and event counters.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::RecordAdded { .. } => "record_added",
            StoreEvent::RecordUpdated { .. } => "record_updated",
            StoreEvent::RecordRemoved { .. } => "record_removed",
            StoreEvent::RecordArchived { .. } => "record_archived",
            StoreEvent::RecordRestored { .. } => "record_restored",
            StoreEvent::RecordReloaded { .. } => "record_reloaded",
            StoreEvent::RecordConflicted { .. } => "record_conflicted",
            StoreEvent::BoardAdded { .. } => "board_added",
            StoreEvent::BoardUpdated { .. } => "board_updated",
            StoreEvent::BoardRemoved { .. } => "board_removed",
            StoreEvent::PerspectiveAdded { .. } => "perspective_added",
            StoreEvent::PerspectiveUpdated { .. } => "perspective_updated",
            StoreEvent::PerspectiveRemoved { .. } => "perspective_removed",
        }
    }
}
