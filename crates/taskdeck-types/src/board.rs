use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::{Filter, GroupBy, SortSpec};
use crate::record::Status;

/// What a board is bound to. Context, project, and status boards are
/// derived from record fields; custom boards are user-defined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BoardKind {
    Context,
    Project,
    Status,
    Custom,
}

/// Visual arrangement of a board's results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoardLayout {
    /// Cards placed at stored per-record positions.
    Freeform,
    #[default]
    Columns,
    Grid,
}

/// A named view specification with a layout. Membership is recomputed from
/// the filter on every evaluation; a board never stores record ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub kind: BoardKind,
    #[serde(default)]
    pub layout: BoardLayout,
    pub filter: Filter,
    /// Ordered column or section names for column and grid layouts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// When set, the board hides itself after its matching records go idle.
    #[serde(default)]
    pub auto_hide: bool,
    /// Idle threshold in days. `None` falls back to the store-wide default.
    pub auto_hide_days: Option<u32>,
    #[serde(default)]
    pub hidden: bool,
    /// Stamped on manual un-hide so the board counts as recently touched
    /// even while its records stay idle.
    pub unhidden_at: Option<DateTime<Utc>>,
    /// Built-in boards live in memory only and reject edits.
    #[serde(skip)]
    pub built_in: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Board {
    pub fn new_custom(name: impl Into<String>, filter: Filter) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: BoardKind::Custom,
            layout: BoardLayout::default(),
            filter,
            columns: Vec::new(),
            auto_hide: false,
            auto_hide_days: None,
            hidden: false,
            unhidden_at: None,
            built_in: false,
            created: now,
            modified: now,
        }
    }

    /// Board for every record carrying the given context value.
    pub fn for_context(context: &str) -> Self {
        let mut board = Self::new_custom(format!("@{context}"), Filter::context(context));
        board.id = format!("context-{}", slug(context));
        board.kind = BoardKind::Context;
        board
    }

    /// Board for every record filed under the given project. Project boards
    /// participate in the auto-hide policy.
    pub fn for_project(project: &str) -> Self {
        let mut board = Self::new_custom(project, Filter::project(project));
        board.id = format!("project-{}", slug(project));
        board.kind = BoardKind::Project;
        board.auto_hide = true;
        board
    }

    /// Board for every record in the given status.
    pub fn for_status(status: Status) -> Self {
        let mut board = Self::new_custom(status.as_str(), Filter::status(status));
        board.id = format!("status-{}", status.as_str());
        board.kind = BoardKind::Status;
        board
    }

    /// Derived boards are owned by the materializer, not the user.
    pub fn is_derived(&self) -> bool {
        matches!(
            self.kind,
            BoardKind::Context | BoardKind::Project | BoardKind::Status
        )
    }

    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }
}

/// A saved list view: filter, grouping, and one sort stage over the live
/// collection. Structurally a board without layout concerns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Perspective {
    pub id: String,
    pub name: String,
    pub filter: Filter,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub sort: SortSpec,
    /// Completed records are masked out of the result unless set.
    #[serde(default)]
    pub show_completed: bool,
    /// Built-in perspectives live in memory only and reject edits.
    #[serde(skip)]
    pub built_in: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Perspective {
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            filter,
            group_by: GroupBy::default(),
            sort: SortSpec::default(),
            show_completed: false,
            built_in: false,
            created: now,
            modified: now,
        }
    }

    /// Built-in views carry stable ids so the UI can pin them.
    pub fn builtin(id: &str, name: &str, filter: Filter) -> Self {
        let mut perspective = Self::new(name, filter);
        perspective.id = id.to_string();
        perspective.built_in = true;
        perspective
    }

    pub fn touch(&mut self) {
        self.modified = Utc::now();
    }
}

/// Lowercase a label into a filesystem- and id-safe slug. Runs of
/// non-alphanumeric characters collapse to single hyphens.
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_hyphen = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            out.push('-');
            last_hyphen = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}
