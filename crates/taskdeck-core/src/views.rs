//! Pure evaluation of view specs against a record snapshot.
//!
//! Nothing here caches or mutates. Board membership is recomputed from the
//! board's filter on every call, so results always reflect the snapshot
//! passed in.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Duration, Utc};
use taskdeck_types::{
    Board, Filter, GroupBy, Perspective, Priority, Record, SortDirection, SortKey,
    SortSpec, Status,
};

pub const NO_PROJECT_GROUP: &str = "no project";
pub const NO_CONTEXT_GROUP: &str = "no context";

const DUE_BUCKETS: [&str; 6] = ["overdue", "today", "tomorrow", "this week", "later", "no due"];

/// One partition of an evaluated view, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewGroup {
    pub label: String,
    pub records: Vec<Record>,
}

/// Filter, sort, then group a snapshot. `now` anchors time-relative
/// operators so results are reproducible.
pub fn evaluate(
    records: &[Record],
    filter: &Filter,
    group_by: GroupBy,
    sort: SortSpec,
    now: DateTime<Utc>,
) -> Vec<ViewGroup> {
    let mut matched: Vec<Record> = records
        .iter()
        .filter(|record| filter.matches(record, now))
        .cloned()
        .collect();
    matched.sort_by(|a, b| compare(a, b, sort));
    group(matched, group_by, now)
}

/// Evaluate a perspective, applying its completed-records mask on top of
/// the stored filter.
pub fn evaluate_perspective(
    records: &[Record],
    perspective: &Perspective,
    now: DateTime<Utc>,
) -> Vec<ViewGroup> {
    let visible: Vec<Record> = if perspective.show_completed {
        records.to_vec()
    } else {
        records
            .iter()
            .filter(|record| record.status != Status::Completed)
            .cloned()
            .collect()
    };
    evaluate(
        &visible,
        &perspective.filter,
        perspective.group_by,
        perspective.sort,
        now,
    )
}

/// Flat membership of a board: exactly the records its filter matches,
/// in the default stable order.
pub fn board_members(records: &[Record], board: &Board, now: DateTime<Utc>) -> Vec<Record> {
    let mut matched: Vec<Record> = records
        .iter()
        .filter(|record| board.filter.matches(record, now))
        .cloned()
        .collect();
    matched.sort_by(|a, b| compare(a, b, SortSpec::default()));
    matched
}

/// Total order over records: the sort key first, then title and id so
/// equal keys never reorder between evaluations.
fn compare(a: &Record, b: &Record, sort: SortSpec) -> Ordering {
    let primary = match sort.key {
        SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortKey::Status => status_rank(a.status).cmp(&status_rank(b.status)),
        SortKey::Priority => a.priority.cmp(&b.priority),
        SortKey::Due => compare_optional(a.due, b.due, sort.direction),
        SortKey::DeferUntil => compare_optional(a.defer_until, b.defer_until, sort.direction),
        SortKey::Created => a.created.cmp(&b.created),
        SortKey::Modified => a.modified.cmp(&b.modified),
        SortKey::CompletedAt => compare_optional(a.completed_at, b.completed_at, sort.direction),
    };
    let primary = match sort.direction {
        SortDirection::Ascending => primary,
        SortDirection::Descending => primary.reverse(),
    };
    primary
        .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Records without a value sort after records with one, in either
/// direction. The direction flip is applied by the caller, so this
/// pre-compensates to keep `None` last.
fn compare_optional(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    direction: SortDirection,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => match direction {
            SortDirection::Ascending => Ordering::Less,
            SortDirection::Descending => Ordering::Greater,
        },
        (None, Some(_)) => match direction {
            SortDirection::Ascending => Ordering::Greater,
            SortDirection::Descending => Ordering::Less,
        },
        (None, None) => Ordering::Equal,
    }
}

fn status_rank(status: Status) -> usize {
    Status::ALL.iter().position(|s| *s == status).unwrap_or(0)
}

fn group(records: Vec<Record>, group_by: GroupBy, now: DateTime<Utc>) -> Vec<ViewGroup> {
    match group_by {
        GroupBy::None => vec![ViewGroup {
            label: String::new(),
            records,
        }],
        GroupBy::Status => fixed_groups(records, &Status::ALL.map(|s| s.as_str()), |record| {
            record.status.as_str()
        }),
        GroupBy::Priority => fixed_groups(records, &Priority::ALL.map(|p| p.as_str()), |record| {
            record.priority.as_str()
        }),
        GroupBy::Project => appearance_groups(records, |record| {
            record
                .project
                .clone()
                .unwrap_or_else(|| NO_PROJECT_GROUP.to_string())
        }),
        GroupBy::Context => appearance_groups(records, |record| {
            record
                .context
                .clone()
                .unwrap_or_else(|| NO_CONTEXT_GROUP.to_string())
        }),
        GroupBy::DueBucket => fixed_groups(records, &DUE_BUCKETS, move |record| {
            due_bucket(record, now)
        }),
    }
}

/// Partition into a fixed label order, dropping empty groups. Sort order
/// within each group is the incoming order.
fn fixed_groups<F>(records: Vec<Record>, order: &[&str], label_of: F) -> Vec<ViewGroup>
where
    F: Fn(&Record) -> &'static str,
{
    let mut groups: Vec<ViewGroup> = order
        .iter()
        .map(|label| ViewGroup {
            label: label.to_string(),
            records: Vec::new(),
        })
        .collect();
    for record in records {
        let label = label_of(&record);
        if let Some(group) = groups.iter_mut().find(|g| g.label == label) {
            group.records.push(record);
        }
    }
    groups.retain(|g| !g.records.is_empty());
    groups
}

/// Partition by a computed label, groups ordered by first appearance in
/// the sorted sequence.
fn appearance_groups<F>(records: Vec<Record>, label_of: F) -> Vec<ViewGroup>
where
    F: Fn(&Record) -> String,
{
    let mut groups: Vec<ViewGroup> = Vec::new();
    for record in records {
        let label = label_of(&record);
        match groups.iter_mut().find(|g| g.label == label) {
            Some(group) => group.records.push(record),
            None => groups.push(ViewGroup {
                label,
                records: vec![record],
            }),
        }
    }
    groups
}

fn due_bucket(record: &Record, now: DateTime<Utc>) -> &'static str {
    let Some(due) = record.due else {
        return "no due";
    };
    let today = now.date_naive();
    let due_date = due.date_naive();
    if due_date < today {
        "overdue"
    } else if due_date == today {
        "today"
    } else if due_date == today + Duration::days(1) {
        "tomorrow"
    } else if due_date.iso_week() == today.iso_week() && due_date.year() == today.year() {
        "this week"
    } else {
        "later"
    }
}
