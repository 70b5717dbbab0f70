use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Priority, Record, RecordKind, Status};

/// A serializable predicate over records.
///
/// Filters are stored inside perspective files and re-evaluated against the
/// live collection on every read, so a perspective never holds a stale
/// member list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches when every child matches. An empty list matches everything.
    All { filters: Vec<Filter> },
    /// Matches when at least one child matches. An empty list matches nothing.
    Any { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
    StatusIs { status: Status },
    StatusIn { statuses: Vec<Status> },
    KindIs { kind: RecordKind },
    /// `project: None` matches records with no project assigned.
    ProjectIs { project: Option<String> },
    /// `context: None` matches records with no context assigned.
    ContextIs { context: Option<String> },
    Flagged,
    PriorityIs { priority: Priority },
    PriorityAtLeast { priority: Priority },
    HasDue,
    DueBefore { when: DateTime<Utc> },
    DueAfter { when: DateTime<Utc> },
    /// Due between now and now plus `days`, inclusive of overdue items.
    DueWithinDays { days: i64 },
    Overdue,
    /// Due on the evaluation instant's calendar day.
    DueToday,
    /// Active and not deferred past the evaluation instant.
    Available,
    /// Case-insensitive substring search over title and body.
    TextContains { text: String },
    IsArchived,
}

impl Filter {
    pub fn all(filters: Vec<Filter>) -> Self {
        Filter::All { filters }
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Filter::Any { filters }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    pub fn status(status: Status) -> Self {
        Filter::StatusIs { status }
    }

    pub fn project(project: impl Into<String>) -> Self {
        Filter::ProjectIs {
            project: Some(project.into()),
        }
    }

    pub fn context(context: impl Into<String>) -> Self {
        Filter::ContextIs {
            context: Some(context.into()),
        }
    }

    /// Evaluate against one record at a fixed instant. Passing `now`
    /// explicitly keeps time-relative operators deterministic under test.
    pub fn matches(&self, record: &Record, now: DateTime<Utc>) -> bool {
        match self {
            Filter::All { filters } => filters.iter().all(|f| f.matches(record, now)),
            Filter::Any { filters } => filters.iter().any(|f| f.matches(record, now)),
            Filter::Not { filter } => !filter.matches(record, now),
            Filter::StatusIs { status } => record.status == *status,
            Filter::StatusIn { statuses } => statuses.contains(&record.status),
            Filter::KindIs { kind } => record.kind == *kind,
            Filter::ProjectIs { project } => record.project == *project,
            Filter::ContextIs { context } => record.context == *context,
            Filter::Flagged => record.flagged,
            Filter::PriorityIs { priority } => record.priority == *priority,
            Filter::PriorityAtLeast { priority } => record.priority >= *priority,
            Filter::HasDue => record.due.is_some(),
            Filter::DueBefore { when } => record.due.is_some_and(|due| due < *when),
            Filter::DueAfter { when } => record.due.is_some_and(|due| due > *when),
            Filter::DueWithinDays { days } => record
                .due
                .is_some_and(|due| due <= now + Duration::days(*days)),
            Filter::Overdue => record.is_overdue(now),
            Filter::DueToday => record.is_due_today(now),
            Filter::Available => record.is_available(now),
            Filter::TextContains { text } => {
                let needle = text.to_lowercase();
                record.title.to_lowercase().contains(&needle)
                    || record.body.to_lowercase().contains(&needle)
            }
            Filter::IsArchived => record.archived,
        }
    }
}

/// Fields a perspective may sort by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Title,
    Status,
    Priority,
    Due,
    DeferUntil,
    Created,
    Modified,
    CompletedAt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One sort stage: which field and which way. Ties fall back to title,
/// then id, so output order is total and stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    #[serde(default)]
    pub direction: SortDirection,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self::descending(SortKey::Modified)
    }
}

impl SortSpec {
    pub fn ascending(key: SortKey) -> Self {
        Self {
            key,
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(key: SortKey) -> Self {
        Self {
            key,
            direction: SortDirection::Descending,
        }
    }
}

/// Optional partitioning applied after filter and sort.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    None,
    Status,
    Priority,
    Project,
    Context,
    DueBucket,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let mut record = Record::new_task("call the bank");
        record.context = Some("phone".to_string());
        record.status = Status::Actionable;
        record
    }

    #[test]
    fn combinators_compose() {
        let now = Utc::now();
        let record = sample();

        let filter = Filter::all(vec![
            Filter::status(Status::Actionable),
            Filter::context("phone"),
        ]);
        assert!(filter.matches(&record, now));

        let negated = Filter::not(Filter::Flagged);
        assert!(negated.matches(&record, now));

        assert!(Filter::all(vec![]).matches(&record, now));
        assert!(!Filter::any(vec![]).matches(&record, now));
    }

    #[test]
    fn project_none_matches_unassigned() {
        let now = Utc::now();
        let record = sample();
        assert!(Filter::ProjectIs { project: None }.matches(&record, now));
        assert!(!Filter::project("errands").matches(&record, now));
    }

    #[test]
    fn text_search_is_case_insensitive_over_title_and_body() {
        let now = Utc::now();
        let mut record = sample();
        record.body = "Waiting on the Mortgage paperwork".to_string();

        assert!(Filter::TextContains {
            text: "BANK".to_string()
        }
        .matches(&record, now));
        assert!(Filter::TextContains {
            text: "mortgage".to_string()
        }
        .matches(&record, now));
        assert!(!Filter::TextContains {
            text: "dentist".to_string()
        }
        .matches(&record, now));
    }

    #[test]
    fn due_within_days_includes_overdue() {
        let now = Utc::now();
        let mut record = sample();
        record.due = Some(now - Duration::days(1));
        assert!(Filter::DueWithinDays { days: 7 }.matches(&record, now));

        record.due = Some(now + Duration::days(10));
        assert!(!Filter::DueWithinDays { days: 7 }.matches(&record, now));
    }

    #[test]
    fn filter_round_trips_through_json() {
        let filter = Filter::any(vec![
            Filter::Overdue,
            Filter::all(vec![Filter::Flagged, Filter::status(Status::Blocked)]),
        ]);
        let encoded = serde_json::to_string(&filter).expect("encode filter");
        let decoded: Filter = serde_json::from_str(&encoded).expect("decode filter");
        assert_eq!(filter, decoded);
    }
}
