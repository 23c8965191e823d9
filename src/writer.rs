//! Result writer: event CSVs and the appended run log.
//!
//! Output files are a fixed column contract (no schema versioning):
//! `email,event_type,timestamp` plus an `annotation` column only when
//! annotation is configured. Writes are atomic — the CSV is built in a
//! temp file in the output directory and renamed into place, so a crashed
//! run never leaves a truncated file at the final path.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::RunError;
use crate::retrieve::CollectionResult;

/// Write one collection to `<dir>/<name>` atomically.
pub fn write_events(
    dir: &Path,
    name: &str,
    collection: &CollectionResult,
    annotated: bool,
) -> Result<PathBuf, RunError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| RunError::Write(format!("create {}: {}", dir.display(), e)))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| RunError::Write(format!("temp file in {}: {}", dir.display(), e)))?;

    {
        let mut csv = csv::Writer::from_writer(&mut temp);
        let mut header = vec!["email", "event_type", "timestamp"];
        if annotated {
            header.push("annotation");
        }
        csv.write_record(&header)
            .map_err(|e| RunError::Write(e.to_string()))?;

        for contact in &collection.contacts {
            let timestamp = contact
                .timestamp
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let mut row = vec![
                contact.email.clone(),
                contact.event.as_str().to_string(),
                timestamp,
            ];
            if annotated {
                row.push(contact.annotation.clone().unwrap_or_default());
            }
            csv.write_record(&row)
                .map_err(|e| RunError::Write(e.to_string()))?;
        }
        csv.flush().map_err(|e| RunError::Write(e.to_string()))?;
    }

    let path = dir.join(name);
    temp.persist(&path)
        .map_err(|e| RunError::Write(format!("persist {}: {}", path.display(), e)))?;

    if collection.incomplete {
        log::warn!(
            "{} written from a PARTIAL {} retrieval ({} rows)",
            path.display(),
            collection.event.as_str(),
            collection.contacts.len()
        );
    } else {
        log::info!("wrote {} rows to {}", collection.contacts.len(), path.display());
    }
    Ok(path)
}

/// One line of run metadata, appended to `runtime_logs.csv`.
#[derive(Debug)]
pub struct RunLogEntry {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_loaded: usize,
    pub records_normalized: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bounced: usize,
    pub unsubscribed: usize,
    pub retrieval_incomplete: bool,
}

const RUN_LOG_HEADER: &str = "executed_at,duration_in_mins,rows_loaded,records_normalized,\
created,updated,skipped,failed,bounced,unsubscribed,retrieval_incomplete";

/// Append the run log, creating it with a header on first run.
pub fn append_run_log(dir: &Path, timezone: &Tz, entry: &RunLogEntry) -> Result<(), RunError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| RunError::Write(format!("create {}: {}", dir.display(), e)))?;

    let path = dir.join("runtime_logs.csv");
    let new_file = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| RunError::Write(format!("open {}: {}", path.display(), e)))?;

    if new_file {
        writeln!(file, "{}", RUN_LOG_HEADER).map_err(|e| RunError::Write(e.to_string()))?;
    }

    let executed_at = entry
        .started_at
        .with_timezone(timezone)
        .format("%Y-%m-%d %H:%M:%S %Z");
    let duration_mins =
        (entry.finished_at - entry.started_at).num_seconds() as f64 / 60.0;

    writeln!(
        file,
        "{},{:.1},{},{},{},{},{},{},{},{},{}",
        executed_at,
        duration_mins,
        entry.rows_loaded,
        entry.records_normalized,
        entry.created,
        entry.updated,
        entry.skipped,
        entry.failed,
        entry.bounced,
        entry.unsubscribed,
        entry.retrieval_incomplete,
    )
    .map_err(|e| RunError::Write(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EventType;
    use crate::retrieve::RemoteContactRef;
    use chrono::NaiveDate;

    fn collection(event: EventType, n: u32, incomplete: bool) -> CollectionResult {
        CollectionResult {
            event,
            contacts: (0..n)
                .map(|i| RemoteContactRef {
                    email: format!("c{}@example.com", i),
                    remote_id: i.to_string(),
                    first_name: String::new(),
                    last_name: String::new(),
                    event,
                    timestamp: NaiveDate::from_ymd_opt(2024, 3, 11),
                    annotation: Some(format!("CONST-{}", i)),
                })
                .collect(),
            incomplete,
            pages_fetched: 1,
        }
    }

    #[test]
    fn test_write_events_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_events(
            dir.path(),
            "bounced.csv",
            &collection(EventType::Bounced, 2, false),
            false,
        )
        .unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "email,event_type,timestamp");
        assert_eq!(lines.next().unwrap(), "c0@example.com,bounced,2024-03-11");
        assert_eq!(lines.next().unwrap(), "c1@example.com,bounced,2024-03-11");
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_write_events_annotation_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_events(
            dir.path(),
            "unsubscribed.csv",
            &collection(EventType::Unsubscribed, 1, false),
            true,
        )
        .unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "email,event_type,timestamp,annotation");
        assert_eq!(
            lines.next().unwrap(),
            "c0@example.com,unsubscribed,2024-03-11,CONST-0"
        );
    }

    #[test]
    fn test_partial_collection_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_events(
            dir.path(),
            "bounced.csv",
            &collection(EventType::Bounced, 3, true),
            false,
        )
        .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 4);
    }

    #[test]
    fn test_run_log_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let tz: Tz = "Australia/Sydney".parse().unwrap();
        let entry = RunLogEntry {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            rows_loaded: 10,
            records_normalized: 9,
            created: 5,
            updated: 2,
            skipped: 1,
            failed: 1,
            bounced: 3,
            unsubscribed: 4,
            retrieval_incomplete: false,
        };

        append_run_log(dir.path(), &tz, &entry).unwrap();
        append_run_log(dir.path(), &tz, &entry).unwrap();

        let content = std::fs::read_to_string(dir.path().join("runtime_logs.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("executed_at,duration_in_mins"));
        assert!(lines[1].contains(",10,9,5,2,1,1,3,4,false"));
        assert_eq!(lines[1].split(',').count(), lines[0].split(',').count());
    }
}
