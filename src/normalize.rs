//! Contact normalizer.
//!
//! Raw rows are loosely typed column maps; everything past this boundary
//! is a validated `ContactRecord`. Validation is fail-fast per row: a row
//! without a usable email is dropped with a warning, never fatal.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{ColumnAliases, SegmentRule};
use crate::loader::RawRow;

/// A contact ready to upsert. `segment_id` is `None` when no segment rule
/// matched; the sync engine records a failure for such records without
/// issuing an API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    /// Custom attributes: every source column not claimed as an identity
    /// field, keyed by column name. BTreeMap keeps payloads deterministic.
    pub fields: BTreeMap<String, String>,
    /// Source-file stem, carried onto the remote contact as a tag.
    pub tags: Vec<String>,
    pub segment_id: Option<String>,
    pub source_file: String,
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Syntactic sanity only; the remote platform does its own validation.
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

/// True if `value` looks like an email address.
pub fn is_valid_email(value: &str) -> bool {
    email_regex().is_match(value)
}

/// Normalize and deduplicate raw rows.
///
/// Dedup key is `(email, segment_id)` with last-write-wins, matching the
/// export convention where a later file supersedes an earlier one. Order
/// of first appearance is preserved.
pub fn normalize(
    rows: &[RawRow],
    aliases: &ColumnAliases,
    rules: &[SegmentRule],
) -> Vec<ContactRecord> {
    let mut order: Vec<(String, Option<String>)> = Vec::new();
    let mut by_key: BTreeMap<(String, Option<String>), ContactRecord> = BTreeMap::new();
    let mut skipped = 0usize;

    for row in rows {
        let record = match normalize_row(row, aliases, rules) {
            Some(record) => record,
            None => {
                skipped += 1;
                continue;
            }
        };
        let key = (record.email.clone(), record.segment_id.clone());
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, record);
    }

    if skipped > 0 {
        log::warn!("normalizer skipped {} rows without a valid email", skipped);
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

fn normalize_row(
    row: &RawRow,
    aliases: &ColumnAliases,
    rules: &[SegmentRule],
) -> Option<ContactRecord> {
    let email_hit = first_present(&row.values, &aliases.email);
    let email = match &email_hit {
        Some((_, value)) if is_valid_email(&value.to_lowercase()) => value.to_lowercase(),
        Some((column, value)) => {
            log::warn!(
                "skipping row from {}: invalid email in {:?}: {:?}",
                row.source_file,
                column,
                value
            );
            return None;
        }
        None => {
            log::warn!("skipping row from {}: missing email", row.source_file);
            return None;
        }
    };

    let first_name_hit = first_present(&row.values, &aliases.first_name);
    let last_name_hit = first_present(&row.values, &aliases.last_name);
    let phone_hit = first_present(&row.values, &aliases.phone);

    let claimed: Vec<String> = [&email_hit, &first_name_hit, &last_name_hit, &phone_hit]
        .into_iter()
        .flatten()
        .map(|(column, _)| column.clone())
        .collect();

    let fields: BTreeMap<String, String> = row
        .values
        .iter()
        .filter(|(column, value)| !claimed.contains(*column) && !value.is_empty())
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();

    let segment_id = resolve_segment(row, rules);
    if segment_id.is_none() {
        log::warn!(
            "no segment rule matched row from {} ({})",
            row.source_file,
            email
        );
    }

    let value_of = |hit: &Option<(String, String)>| {
        hit.as_ref().map(|(_, v)| v.clone()).unwrap_or_default()
    };

    Some(ContactRecord {
        email,
        first_name: value_of(&first_name_hit),
        last_name: value_of(&last_name_hit),
        phone: value_of(&phone_hit),
        fields,
        tags: vec![row.source_file.clone()],
        segment_id,
        source_file: row.source_file.clone(),
    })
}

/// First alias that exists in the row with a non-empty value.
fn first_present(values: &HashMap<String, String>, aliases: &[String]) -> Option<(String, String)> {
    aliases.iter().find_map(|alias| {
        values
            .get(alias)
            .filter(|v| !v.is_empty())
            .map(|v| (alias.clone(), v.clone()))
    })
}

/// First rule whose predicates all hold; rules are ordered by priority.
fn resolve_segment(row: &RawRow, rules: &[SegmentRule]) -> Option<String> {
    rules
        .iter()
        .find(|rule| rule_matches(row, rule))
        .map(|rule| rule.segment_id.clone())
}

fn rule_matches(row: &RawRow, rule: &SegmentRule) -> bool {
    if rule.file_contains.is_none() && rule.column_contains.is_empty() {
        // A rule with no predicates is a catch-all.
        return true;
    }
    if let Some(fragment) = &rule.file_contains {
        if !row.source_file.contains(fragment.as_str()) {
            return false;
        }
    }
    rule.column_contains.iter().all(|(column, fragment)| {
        row.values
            .get(column)
            .map(|value| value.contains(fragment.as_str()))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(source: &str, pairs: &[(&str, &str)]) -> RawRow {
        RawRow {
            source_file: source.to_string(),
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn welcome_rule() -> SegmentRule {
        SegmentRule {
            file_contains: Some("Welcome".to_string()),
            column_contains: vec![],
            segment_id: "71".to_string(),
        }
    }

    fn au_active_rule() -> SegmentRule {
        SegmentRule {
            file_contains: None,
            column_contains: vec![
                ("Appeal".to_string(), "AU".to_string()),
                ("Package".to_string(), "Active".to_string()),
            ],
            segment_id: "199".to_string(),
        }
    }

    #[test]
    fn test_missing_email_row_is_skipped() {
        let rows = vec![
            row("Welcome", &[("Email", "a@example.com"), ("FirstName", "Ada")]),
            row("Welcome", &[("FirstName", "NoEmail")]),
            row("Welcome", &[("Email", "c@example.com")]),
        ];
        let records = normalize(&rows, &ColumnAliases::default(), &[welcome_rule()]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].email, "a@example.com");
        assert_eq!(records[1].email, "c@example.com");
    }

    #[test]
    fn test_invalid_email_is_skipped() {
        let rows = vec![row("Welcome", &[("Email", "not-an-email")])];
        let records = normalize(&rows, &ColumnAliases::default(), &[welcome_rule()]);
        assert!(records.is_empty());
    }

    #[test]
    fn test_email_lowercased_and_alias_resolved() {
        let rows = vec![row(
            "Segments",
            &[("Email Address", "MiXeD@Example.COM"), ("Last name", "Case")],
        )];
        let records = normalize(&rows, &ColumnAliases::default(), &[]);
        assert_eq!(records[0].email, "mixed@example.com");
        assert_eq!(records[0].last_name, "Case");
    }

    #[test]
    fn test_last_write_wins_per_email_and_segment() {
        let rows = vec![
            row("Welcome", &[("Email", "a@example.com"), ("FirstName", "Old")]),
            row("Welcome", &[("Email", "a@example.com"), ("FirstName", "New")]),
        ];
        let records = normalize(&rows, &ColumnAliases::default(), &[welcome_rule()]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_name, "New");
    }

    #[test]
    fn test_same_email_two_segments_kept_separately() {
        let rules = vec![welcome_rule(), au_active_rule()];
        let rows = vec![
            row("Welcome", &[("Email", "a@example.com")]),
            row(
                "Segments",
                &[
                    ("Email Address", "a@example.com"),
                    ("Appeal", "AU-2024"),
                    ("Package", "RG_Active"),
                ],
            ),
        ];
        let records = normalize(&rows, &ColumnAliases::default(), &rules);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].segment_id.as_deref(), Some("71"));
        assert_eq!(records[1].segment_id.as_deref(), Some("199"));
    }

    #[test]
    fn test_unmatched_rows_have_no_segment() {
        let rows = vec![row("Misc", &[("Email", "a@example.com")])];
        let records = normalize(&rows, &ColumnAliases::default(), &[welcome_rule()]);
        assert_eq!(records.len(), 1);
        assert!(records[0].segment_id.is_none());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            SegmentRule {
                file_contains: Some("Welcome".to_string()),
                column_contains: vec![],
                segment_id: "first".to_string(),
            },
            SegmentRule {
                file_contains: Some("Welcome".to_string()),
                column_contains: vec![],
                segment_id: "second".to_string(),
            },
        ];
        let rows = vec![row("Welcome", &[("Email", "a@example.com")])];
        let records = normalize(&rows, &ColumnAliases::default(), &rules);
        assert_eq!(records[0].segment_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_unclaimed_columns_become_fields_and_tag_from_file() {
        let rows = vec![row(
            "Welcome",
            &[
                ("Email", "a@example.com"),
                ("FirstName", "Ada"),
                ("Postcode", "2000"),
                ("Title", "Dr"),
                ("Blank", ""),
            ],
        )];
        let records = normalize(&rows, &ColumnAliases::default(), &[welcome_rule()]);
        let record = &records[0];
        assert_eq!(record.fields.get("Postcode").unwrap(), "2000");
        assert_eq!(record.fields.get("Title").unwrap(), "Dr");
        assert!(record.fields.get("FirstName").is_none());
        assert!(record.fields.get("Blank").is_none());
        assert_eq!(record.tags, vec!["Welcome".to_string()]);
    }
}
