use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use core_types::{
    Column, CompositeKey, HelperColumn, HelperDraft, HelperRecord, KnowledgeFileRow, Row, cell,
};
use indexmap::IndexMap;

pub const DISPLAY_FORMAT: &str = "%b %d, %Y";

pub const MISSING_TIMESTAMP: NaiveDateTime = NaiveDateTime::MIN;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%b %d, %Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d %Y",
    "%B %d %Y",
];

/// Parses the date spellings people and spreadsheets commonly produce.
/// Values with an offset are converted to UTC.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return parsed.and_hms_opt(0, 0, 0);
        }
    }
    None
}

pub fn format_display(timestamp: NaiveDateTime) -> String {
    timestamp.format(DISPLAY_FORMAT).to_string()
}

pub fn to_display(value: &str) -> Option<String> {
    parse_timestamp(value).map(format_display)
}

fn updated_at(row: &[String]) -> NaiveDateTime {
    cell(row, HelperColumn::UpdatedDate)
        .and_then(parse_timestamp)
        .unwrap_or(MISSING_TIMESTAMP)
}

pub fn distinct_values(
    rows: &[Row],
    constraints: &[(Column, &str)],
    target: impl Into<Column>,
) -> BTreeSet<String> {
    let target = target.into();
    rows.iter()
        .filter(|row| {
            constraints
                .iter()
                .all(|(column, value)| cell(row, *column) == Some(*value))
        })
        .filter_map(|row| cell(row, target))
        .map(str::to_string)
        .collect()
}

/// The most recently updated row for `key`, normalized for display.
///
/// Equal timestamps go to the later row, so a second edit on the same day is
/// current. Rows without a readable update date lose to any row that has one.
pub fn latest_record(rows: &[Row], key: &CompositeKey) -> Option<HelperRecord> {
    let mut best: Option<(&Row, NaiveDateTime)> = None;
    for row in rows.iter().filter(|row| key.matches(row)) {
        let stamp = updated_at(row);
        match best {
            Some((_, current)) if stamp < current => {}
            _ => best = Some((row, stamp)),
        }
    }

    best.map(|(row, _)| normalize_record(row.clone()))
}

fn normalize_record(row: Row) -> HelperRecord {
    let mut record = HelperRecord::from_row(row);
    for column in [HelperColumn::UpdatedDate, HelperColumn::CreatedDate] {
        if let Some(display) = record.get(column).and_then(to_display) {
            record.set(column, Some(display));
        }
    }
    record
}

/// One row per (HelperName, HelperType, GAI): the latest version, raw, in
/// first-seen key order.
pub fn latest_per_key(rows: &[Row]) -> Vec<Row> {
    let mut latest: IndexMap<(Option<&str>, Option<&str>, Option<&str>), (&Row, NaiveDateTime)> =
        IndexMap::new();
    for row in rows {
        let key = (
            cell(row, HelperColumn::HelperName),
            cell(row, HelperColumn::HelperType),
            cell(row, HelperColumn::Gai),
        );
        let stamp = updated_at(row);
        latest
            .entry(key)
            .and_modify(|entry| {
                if stamp >= entry.1 {
                    *entry = (row, stamp);
                }
            })
            .or_insert((row, stamp));
    }
    latest.into_values().map(|(row, _)| row.clone()).collect()
}

pub fn associated_helpers(rows: &[Row], file_name: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for row in rows.iter().filter(|row| row.len() > HelperColumn::KnowledgeFileList.index()) {
        let list = &row[HelperColumn::KnowledgeFileList.index()];
        if list.is_empty() {
            continue;
        }
        if list.split(',').map(str::trim).any(|entry| entry == file_name) {
            names.insert(row[HelperColumn::HelperName.index()].clone());
        }
    }
    names.into_iter().collect()
}

pub fn helper_version_row(draft: HelperDraft, now: NaiveDateTime) -> Row {
    draft.into_row(format_display(now))
}

pub fn knowledge_change_row(
    file_name: impl Into<String>,
    change_description: impl Into<String>,
    now: NaiveDateTime,
) -> KnowledgeFileRow {
    KnowledgeFileRow {
        file_name: file_name.into(),
        change_description: change_description.into(),
        timestamp: format_display(now),
    }
}
