use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which flavor of record a file holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Lightweight capture: title and body, minimal metadata.
    Note,
    /// Full task with scheduling metadata.
    Task,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Note => "note",
            RecordKind::Task => "task",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "note" => Some(RecordKind::Note),
            "task" => Some(RecordKind::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a record. Completion is a status change, not a delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Inbox,
    Actionable,
    Blocked,
    Deferred,
    Completed,
}

impl Status {
    /// Domain display order, used when grouping by status.
    pub const ALL: [Status; 5] = [
        Status::Inbox,
        Status::Actionable,
        Status::Blocked,
        Status::Deferred,
        Status::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Inbox => "inbox",
            Status::Actionable => "actionable",
            Status::Blocked => "blocked",
            Status::Deferred => "deferred",
            Status::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inbox" => Some(Status::Inbox),
            "actionable" => Some(Status::Actionable),
            "blocked" => Some(Status::Blocked),
            "deferred" => Some(Status::Deferred),
            "completed" => Some(Status::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record priority. Variant order is the scale, so `Ord` compares severity.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Grouping order, most urgent first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record sits on a freeform board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single task or note, the atomic persisted unit.
///
/// One record maps to one frontmatter-plus-body text file on disk; the body
/// is free text owned by the user and carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub status: Status,
    pub project: Option<String>,
    pub context: Option<String>,
    pub due: Option<DateTime<Utc>>,
    pub defer_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_minutes: Option<u32>,
    /// Board id → 2D position; only freeform boards read this.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub positions: HashMap<String, Position>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Derived from the storage location (active vs archive subtree),
    /// never written into the file's frontmatter. Serialized here so
    /// events carry which subtree a record lives in.
    #[serde(default)]
    pub archived: bool,
    /// Frontmatter keys this version does not understand, preserved so a
    /// rewrite never drops them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Record {
    pub fn new(kind: RecordKind, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            body: String::new(),
            status: Status::Inbox,
            project: None,
            context: None,
            due: None,
            defer_until: None,
            flagged: false,
            priority: Priority::default(),
            estimated_minutes: None,
            positions: HashMap::new(),
            created: now,
            modified: now,
            completed_at: None,
            archived: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn new_task(title: impl Into<String>) -> Self {
        Self::new(RecordKind::Task, title)
    }

    pub fn new_note(title: impl Into<String>) -> Self {
        Self::new(RecordKind::Note, title)
    }

    /// Change the lifecycle status, keeping `completed_at` in step: entering
    /// `Completed` stamps it, leaving `Completed` clears it.
    pub fn set_status(&mut self, status: Status) {
        if status == Status::Completed {
            if self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        } else {
            self.completed_at = None;
        }
        self.status = status;
        self.touch();
    }

    /// Bump the modification timestamp, never letting it fall behind
    /// `created`.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.modified = if now >= self.created { now } else { self.created };
    }

    /// A record still counts toward a project's activity until completed.
    pub fn is_active(&self) -> bool {
        self.status != Status::Completed
    }

    /// Deferred records become available once `defer_until` passes.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.defer_until {
            Some(defer) => defer <= now,
            None => true,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.due.is_some_and(|due| due < now)
    }

    pub fn is_due_today(&self, now: DateTime<Utc>) -> bool {
        self.due
            .is_some_and(|due| due.date_naive() == now.date_naive())
    }
}

/// Collection counts surfaced to UI badges.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub total: usize,
    pub notes: usize,
    pub tasks: usize,
    pub inbox: usize,
    pub actionable: usize,
    pub blocked: usize,
    pub deferred: usize,
    pub completed: usize,
    pub flagged: usize,
    pub overdue: usize,
    pub archived: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn completion_stamps_and_clears_timestamp() {
        let mut record = Record::new_task("write report");
        assert!(record.completed_at.is_none());

        record.set_status(Status::Completed);
        assert!(record.completed_at.is_some());
        assert!(record.modified >= record.created);

        record.set_status(Status::Actionable);
        assert!(record.completed_at.is_none());
        assert_eq!(record.status, Status::Actionable);
    }

    #[test]
    fn deferred_record_becomes_available_after_defer_date() {
        let now = Utc::now();
        let mut record = Record::new_task("later");
        record.defer_until = Some(now + Duration::days(2));
        assert!(!record.is_available(now));
        assert!(record.is_available(now + Duration::days(3)));
    }

    #[test]
    fn overdue_requires_active_status() {
        let now = Utc::now();
        let mut record = Record::new_task("ship it");
        record.due = Some(now - Duration::hours(1));
        assert!(record.is_overdue(now));

        record.set_status(Status::Completed);
        assert!(!record.is_overdue(now));
    }

    #[test]
    fn priority_scale_orders_by_severity() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
