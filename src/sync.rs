//! Sync engine: drives the upsert of normalized records.
//!
//! Records are grouped by email, packed into batches (records sharing an
//! email always share a batch), and the batches are dealt round-robin to a
//! fixed pool of workers. Within a worker, records are strictly
//! sequential; across workers the only shared resource is the rate budget
//! inside the API client. Every record gets exactly one `SyncOutcome`;
//! failures never abort the batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::api::{ApiError, ContactApi};
use crate::normalize::ContactRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncStatus {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Created => "created",
            SyncStatus::Updated => "updated",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Immutable record of one attempted upsert.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub email: String,
    pub segment_id: Option<String>,
    pub status: SyncStatus,
    pub error: Option<String>,
}

/// Outcome counts by status, for the end-of-run summary.
pub fn tally(outcomes: &[SyncOutcome]) -> BTreeMap<SyncStatus, usize> {
    let mut counts = BTreeMap::new();
    for outcome in outcomes {
        *counts.entry(outcome.status).or_insert(0) += 1;
    }
    counts
}

pub struct SyncEngine {
    api: Arc<dyn ContactApi>,
    batch_size: usize,
    workers: usize,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn ContactApi>, batch_size: usize, workers: usize) -> Self {
        Self {
            api,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
        }
    }

    /// Upsert every record, returning one outcome per record. Outcome
    /// order across batches is not defined.
    pub async fn run(&self, records: Vec<ContactRecord>) -> Vec<SyncOutcome> {
        if records.is_empty() {
            return Vec::new();
        }

        // Records sharing an email race each other through find→create if
        // they land on different workers, so each email's records form one
        // group and a group is never split across batches.
        let mut groups: Vec<Vec<ContactRecord>> = Vec::new();
        let mut by_email: HashMap<String, usize> = HashMap::new();
        for record in records {
            match by_email.get(&record.email) {
                Some(&index) => groups[index].push(record),
                None => {
                    by_email.insert(record.email.clone(), groups.len());
                    groups.push(vec![record]);
                }
            }
        }

        let mut batches: Vec<Vec<ContactRecord>> = Vec::new();
        let mut current: Vec<ContactRecord> = Vec::new();
        for mut group in groups {
            if !current.is_empty() && current.len() + group.len() > self.batch_size {
                batches.push(std::mem::take(&mut current));
            }
            current.append(&mut group);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let total_batches = batches.len();
        let mut assignments: Vec<Vec<Vec<ContactRecord>>> = vec![Vec::new(); self.workers];
        for (index, batch) in batches.into_iter().enumerate() {
            assignments[index % self.workers].push(batch);
        }

        log::info!(
            "syncing {} batches across {} workers (batch size {})",
            total_batches,
            self.workers,
            self.batch_size
        );

        let mut handles = Vec::new();
        for (worker, batches) in assignments.into_iter().enumerate() {
            if batches.is_empty() {
                continue;
            }
            let api = self.api.clone();
            handles.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                for batch in batches {
                    for record in batch {
                        let outcome = sync_record(api.as_ref(), record).await;
                        if outcome.status == SyncStatus::Failed {
                            log::warn!(
                                "worker {}: {} failed: {}",
                                worker,
                                outcome.email,
                                outcome.error.as_deref().unwrap_or("unknown")
                            );
                        }
                        outcomes.push(outcome);
                    }
                }
                outcomes
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(mut outcomes) => all.append(&mut outcomes),
                Err(e) => log::error!("sync worker panicked: {}", e),
            }
        }
        all
    }
}

async fn sync_record(api: &dyn ContactApi, record: ContactRecord) -> SyncOutcome {
    if record.email.is_empty() {
        // The normalizer drops these; the guard keeps the engine safe for
        // callers that feed it records directly.
        return SyncOutcome {
            email: record.email,
            segment_id: record.segment_id,
            status: SyncStatus::Failed,
            error: Some("missing email".to_string()),
        };
    }

    let Some(segment_id) = record.segment_id.clone() else {
        // Fail fast: no API call for a record with no resolved segment.
        return SyncOutcome {
            email: record.email,
            segment_id: None,
            status: SyncStatus::Failed,
            error: Some("no segment rule matched".to_string()),
        };
    };

    match upsert(api, &record, &segment_id).await {
        Ok(status) => SyncOutcome {
            email: record.email,
            segment_id: Some(segment_id),
            status,
            error: None,
        },
        Err(e) => SyncOutcome {
            email: record.email,
            segment_id: Some(segment_id),
            status: SyncStatus::Failed,
            error: Some(e.to_string()),
        },
    }
}

/// Create-if-absent, update-if-changed, keyed by email. Re-running with
/// unchanged data never creates a duplicate.
async fn upsert(
    api: &dyn ContactApi,
    record: &ContactRecord,
    segment_id: &str,
) -> Result<SyncStatus, ApiError> {
    match api.find_by_email(&record.email).await? {
        Some(remote) if remote.matches(record) => {
            api.subscribe(&remote.id, segment_id).await?;
            Ok(SyncStatus::Skipped)
        }
        Some(remote) => {
            let updated = api.update_contact(&remote.id, record).await?;
            api.subscribe(&updated.id, segment_id).await?;
            Ok(SyncStatus::Updated)
        }
        None => {
            let created = api.create_contact(record).await?;
            api.subscribe(&created.id, segment_id).await?;
            Ok(SyncStatus::Created)
        }
    }
}
