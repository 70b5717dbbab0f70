//! Frontmatter codec: one record file is a `---` delimited YAML metadata
//! block followed by the free-text body, carried verbatim.
//!
//! Decoding is forgiving at the field level. A value that fails coercion
//! degrades to "field absent" and produces a warning; only a missing or
//! syntactically broken metadata block fails the whole file.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde_yaml::{Mapping, Value};
use taskdeck_types::{Position, Priority, Record, RecordKind, Status};

use crate::error::{StoreError, StoreResult};

const SENTINEL: &str = "---";

/// Split a file into its raw YAML block and body. The body is the exact
/// byte tail after the closing sentinel line, trailing newlines included.
fn split_frontmatter(content: &str) -> StoreResult<(String, String)> {
    let mut yaml_lines: Vec<&str> = Vec::new();
    let mut offset = 0;
    let mut inside = false;
    for segment in content.split_inclusive('\n') {
        offset += segment.len();
        let line = segment.trim_end_matches('\n').trim_end_matches('\r');
        if line.trim() == SENTINEL {
            if inside {
                return Ok((yaml_lines.join("\n"), content[offset..].to_string()));
            }
            inside = true;
        } else if inside {
            yaml_lines.push(line);
        }
    }
    Err(StoreError::parse(
        "<memory>",
        "missing frontmatter delimiters",
    ))
}

/// Decode one record file. Returns the record plus soft warnings for any
/// field that failed coercion and was dropped.
pub fn decode_record(content: &str) -> StoreResult<(Record, Vec<String>)> {
    let (yaml, body) = split_frontmatter(content)?;
    let mapping = parse_mapping(&yaml)?;

    let mut warnings = Vec::new();
    let mut record = Record::new(RecordKind::Task, "");
    // Cleared so a file without an id is detectable; the repository fills
    // it back in from the filename.
    record.id = String::new();
    record.body = body;

    let mut created = None;
    let mut modified = None;
    let mut extra = BTreeMap::new();

    for (key, value) in mapping {
        let Some(key) = key.as_str().map(str::to_string) else {
            warnings.push("non-string frontmatter key dropped".to_string());
            continue;
        };
        match key.as_str() {
            "id" => match as_string(&value) {
                Some(id) => record.id = id,
                None => warnings.push("id: not a string, ignored".to_string()),
            },
            "kind" => match as_string(&value).as_deref().and_then(RecordKind::parse) {
                Some(kind) => record.kind = kind,
                None => warnings.push(format!("kind: unrecognized value {value:?}, kept task")),
            },
            "title" => match as_string(&value) {
                Some(title) => record.title = title,
                None => warnings.push("title: not a string, kept empty".to_string()),
            },
            "status" => match as_string(&value).as_deref().and_then(Status::parse) {
                Some(status) => record.status = status,
                None => warnings.push(format!("status: unrecognized value {value:?}, kept inbox")),
            },
            "project" => record.project = as_nonempty_string(&value),
            "context" => record.context = as_nonempty_string(&value),
            "due" => record.due = as_datetime(&value, "due", &mut warnings),
            "defer_until" => {
                record.defer_until = as_datetime(&value, "defer_until", &mut warnings)
            }
            "flagged" => match as_bool(&value) {
                Some(flagged) => record.flagged = flagged,
                None => warnings.push(format!("flagged: not a boolean {value:?}, kept false")),
            },
            "priority" => match as_string(&value).as_deref().and_then(Priority::parse) {
                Some(priority) => record.priority = priority,
                None => {
                    warnings.push(format!("priority: unrecognized value {value:?}, kept medium"))
                }
            },
            "estimated_minutes" => {
                match value.as_u64().and_then(|m| u32::try_from(m).ok()) {
                    Some(minutes) => record.estimated_minutes = Some(minutes),
                    None => warnings
                        .push("estimated_minutes: not a small integer, ignored".to_string()),
                }
            }
            "positions" => record.positions = as_positions(&value, &mut warnings),
            "created" => created = as_datetime(&value, "created", &mut warnings),
            "modified" => modified = as_datetime(&value, "modified", &mut warnings),
            "completed_at" => {
                record.completed_at = as_datetime(&value, "completed_at", &mut warnings)
            }
            _ => {
                extra.insert(key, value);
            }
        }
    }

    if record.id.is_empty() {
        warnings.push("id: missing from frontmatter".to_string());
    }
    let now = Utc::now();
    record.created = created.unwrap_or(now);
    // modified may never precede created
    record.modified = match modified {
        Some(m) if m >= record.created => m,
        Some(_) => {
            warnings.push("modified: earlier than created, clamped".to_string());
            record.created
        }
        None => record.created,
    };
    if record.status == Status::Completed && record.completed_at.is_none() {
        record.completed_at = Some(record.modified);
    }
    if record.status != Status::Completed {
        record.completed_at = None;
    }
    record.extra = extra;

    Ok((record, warnings))
}

/// Encode a record into file bytes. Known fields come first in a fixed
/// order, then unknown preserved keys sorted by name, so output is
/// deterministic and `decode(encode(r)) == r`.
pub fn encode_record(record: &Record) -> StoreResult<String> {
    let mut mapping = Mapping::new();
    let mut put = |key: &str, value: Value| {
        mapping.insert(Value::String(key.to_string()), value);
    };

    put("id", Value::String(record.id.clone()));
    put("kind", Value::String(record.kind.as_str().to_string()));
    put("title", Value::String(record.title.clone()));
    put("status", Value::String(record.status.as_str().to_string()));
    put(
        "priority",
        Value::String(record.priority.as_str().to_string()),
    );
    if let Some(project) = &record.project {
        put("project", Value::String(project.clone()));
    }
    if let Some(context) = &record.context {
        put("context", Value::String(context.clone()));
    }
    if let Some(due) = record.due {
        put("due", Value::String(due.to_rfc3339()));
    }
    if let Some(defer) = record.defer_until {
        put("defer_until", Value::String(defer.to_rfc3339()));
    }
    if record.flagged {
        put("flagged", Value::Bool(true));
    }
    if let Some(minutes) = record.estimated_minutes {
        put("estimated_minutes", Value::Number(minutes.into()));
    }
    if !record.positions.is_empty() {
        put("positions", positions_value(&record.positions));
    }
    put("created", Value::String(record.created.to_rfc3339()));
    put("modified", Value::String(record.modified.to_rfc3339()));
    if let Some(completed) = record.completed_at {
        put("completed_at", Value::String(completed.to_rfc3339()));
    }
    for (key, value) in &record.extra {
        mapping.insert(Value::String(key.clone()), value.clone());
    }

    let yaml = serde_yaml::to_string(&mapping)?;
    Ok(format!("{SENTINEL}\n{yaml}{SENTINEL}\n{}", record.body))
}

fn parse_mapping(yaml: &str) -> StoreResult<Mapping> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value =
        serde_yaml::from_str(yaml).map_err(|e| StoreError::parse("<memory>", e.to_string()))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        other => Err(StoreError::parse(
            "<memory>",
            format!("frontmatter is not a key-value block: {other:?}"),
        )),
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_nonempty_string(value: &Value) -> Option<String> {
    as_string(value).filter(|s| !s.trim().is_empty())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
fn as_datetime(value: &Value, field: &str, warnings: &mut Vec<String>) -> Option<DateTime<Utc>> {
    let raw = as_string(value)?;
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Some(midnight.and_utc());
        }
    }
    warnings.push(format!("{field}: unparsable date {raw:?}, dropped"));
    None
}

fn as_positions(value: &Value, warnings: &mut Vec<String>) -> HashMap<String, Position> {
    let mut positions = HashMap::new();
    let Value::Mapping(entries) = value else {
        warnings.push("positions: not a map, ignored".to_string());
        return positions;
    };
    for (board, coords) in entries {
        let Some(board) = board.as_str() else {
            warnings.push("positions: non-string board id dropped".to_string());
            continue;
        };
        let (Some(x), Some(y)) = (
            coords.get("x").and_then(Value::as_f64),
            coords.get("y").and_then(Value::as_f64),
        ) else {
            warnings.push(format!("positions.{board}: missing x/y, dropped"));
            continue;
        };
        positions.insert(board.to_string(), Position { x, y });
    }
    positions
}

fn positions_value(positions: &HashMap<String, Position>) -> Value {
    let mut sorted: Vec<_> = positions.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut mapping = Mapping::new();
    for (board, position) in sorted {
        let mut coords = Mapping::new();
        coords.insert(
            Value::String("x".to_string()),
            Value::Number(serde_yaml::Number::from(position.x)),
        );
        coords.insert(
            Value::String("y".to_string()),
            Value::Number(serde_yaml::Number::from(position.y)),
        );
        mapping.insert(Value::String(board.clone()), Value::Mapping(coords));
    }
    Value::Mapping(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> Record {
        let mut record = Record::new_task("Call John");
        record.id = "0a1b2c3d".to_string();
        record.context = Some("phone".to_string());
        record.project = Some("Website".to_string());
        record.status = Status::Actionable;
        record.priority = Priority::High;
        record.flagged = true;
        record.estimated_minutes = Some(30);
        record.due = Some(Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).single().expect("ts"));
        record.body = "Ask about the invoice.\n\n- item one\n- item two".to_string();
        record
            .positions
            .insert("board-1".to_string(), Position { x: 12.5, y: 40.0 });
        record
    }

    #[test]
    fn round_trips_a_full_record() {
        let record = sample_record();
        let encoded = encode_record(&record).expect("encode");
        let (decoded, warnings) = decode_record(&encoded).expect("decode");
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(decoded, record);

        // Encoding the decoded value again is byte-identical.
        let re_encoded = encode_record(&decoded).expect("encode again");
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn body_is_carried_verbatim() {
        let record = sample_record();
        let encoded = encode_record(&record).expect("encode");
        assert!(encoded.ends_with("- item two"));
        let (decoded, _) = decode_record(&encoded).expect("decode");
        assert_eq!(decoded.body, record.body);
    }

    #[test]
    fn body_trailing_newlines_round_trip() {
        let mut record = sample_record();
        record.body = "ends with a blank line\n\n".to_string();
        let encoded = encode_record(&record).expect("encode");
        let (decoded, _) = decode_record(&encoded).expect("decode");
        assert_eq!(decoded.body, record.body);
    }

    #[test]
    fn missing_frontmatter_is_a_parse_error() {
        let err = decode_record("just some text\nno metadata here").unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn broken_yaml_is_a_parse_error() {
        let content = "---\ntitle: [unclosed\n---\nbody";
        let err = decode_record(content).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn bad_date_degrades_to_absent_with_warning() {
        let content = "---\nid: x1\ntitle: t\ndue: not-a-date\n---\n";
        let (record, warnings) = decode_record(content).expect("decode");
        assert!(record.due.is_none());
        assert!(warnings.iter().any(|w| w.starts_with("due:")));
    }

    #[test]
    fn date_only_values_parse_as_midnight_utc() {
        let content = "---\nid: x1\ntitle: t\ndue: 2025-06-01\n---\n";
        let (record, warnings) = decode_record(content).expect("decode");
        assert!(warnings.is_empty());
        let due = record.due.expect("due set");
        assert_eq!(
            due,
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("ts")
        );
    }

    #[test]
    fn unknown_keys_survive_a_rewrite() {
        let content = "---\nid: x1\ntitle: t\nxc_sync_token: abc123\nratings:\n- 3\n- 5\n---\nbody\n";
        let (record, _) = decode_record(content).expect("decode");
        assert_eq!(record.extra.len(), 2);

        let encoded = encode_record(&record).expect("encode");
        assert!(encoded.contains("xc_sync_token: abc123"));
        let (again, _) = decode_record(&encoded).expect("decode again");
        assert_eq!(again.extra, record.extra);
    }

    #[test]
    fn unrecognized_status_keeps_inbox_with_warning() {
        let content = "---\nid: x1\ntitle: t\nstatus: someday\n---\n";
        let (record, warnings) = decode_record(content).expect("decode");
        assert_eq!(record.status, Status::Inbox);
        assert!(warnings.iter().any(|w| w.starts_with("status:")));
    }

    #[test]
    fn completed_status_backfills_completion_timestamp() {
        let content = "---\nid: x1\ntitle: t\nstatus: completed\n---\n";
        let (record, _) = decode_record(content).expect("decode");
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn modified_clamps_to_created() {
        let content = "---\nid: x1\ntitle: t\ncreated: 2025-05-02T10:00:00+00:00\nmodified: 2025-05-01T10:00:00+00:00\n---\n";
        let (record, warnings) = decode_record(content).expect("decode");
        assert_eq!(record.modified, record.created);
        assert!(warnings.iter().any(|w| w.starts_with("modified:")));
    }

    #[test]
    fn flag_accepts_yes_no_strings() {
        let content = "---\nid: x1\ntitle: t\nflagged: \"yes\"\n---\n";
        let (record, warnings) = decode_record(content).expect("decode");
        assert!(record.flagged);
        assert!(warnings.is_empty());
    }
}
