//! Batch synchronizer between exported contact lists and a marketing
//! platform's REST API.
//!
//! One run: load the exported files, normalize them into per-segment
//! contact records, upsert them through the rate-limited client, then pull
//! the bounced and unsubscribed collections back down and write them next
//! to the source data. Re-running with unchanged input is safe — upserts
//! are keyed by email, so the run is idempotent end to end.

pub mod api;
pub mod config;
pub mod error;
pub mod loader;
pub mod normalize;
pub mod retrieve;
pub mod secrets;
pub mod sync;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;

use api::{ApiClient, RateBudget};
use config::SyncConfig;
use error::RunError;
use retrieve::RetrievalEngine;
use secrets::{FileSecretStore, SecretStore};
use sync::{SyncEngine, SyncStatus};
use writer::RunLogEntry;

/// What a completed run did, for the end-of-run report.
#[derive(Debug)]
pub struct RunSummary {
    pub rows_loaded: usize,
    pub records_normalized: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Emails of failed records, for manual inspection.
    pub failed_emails: Vec<String>,
    pub bounced: usize,
    pub unsubscribed: usize,
    pub retrieval_incomplete: bool,
}

/// Execute one full batch run.
///
/// Startup failures (secrets, unreachable source, bad config) return a
/// `RunError`; per-record and per-page failures are absorbed into the
/// summary.
pub async fn run(config: SyncConfig) -> Result<RunSummary, RunError> {
    let started_at = Utc::now();

    let timezone: Tz = config
        .timezone
        .parse()
        .map_err(|_| RunError::Config(format!("unknown timezone {:?}", config.timezone)))?;

    let store = FileSecretStore::new(config.secrets_path());
    let token = store.get_secret(&config.api_token_secret)?;

    let rows = loader::load_dir(&config.input_dir).map_err(|e| RunError::SourceUnreachable {
        path: config.input_dir.clone(),
        message: e.to_string(),
    })?;
    let records = normalize::normalize(&rows, &config.column_aliases, &config.segment_rules);
    let rows_loaded = rows.len();
    let records_normalized = records.len();
    log::info!(
        "{} raw rows normalized into {} records",
        rows_loaded,
        records_normalized
    );

    let budget = Arc::new(RateBudget::new(
        config.rate_limit_per_window,
        Duration::from_millis(config.rate_window_ms),
    ));
    let client = Arc::new(
        ApiClient::new(&config, token, budget)
            .map_err(|e| RunError::Config(e.to_string()))?,
    );

    let engine = SyncEngine::new(client.clone(), config.batch_size, config.workers);
    let outcomes = engine.run(records).await;

    let window = config
        .lookback_days
        .map(|days| retrieve::weekly_window(Utc::now().date_naive(), days));
    let retrieval = RetrievalEngine::new(
        client,
        config.page_size,
        window,
        config.annotation_field_id.clone(),
    )
    .run()
    .await;

    let annotated = config.annotation_field_id.is_some();
    writer::write_events(&config.output_dir, "bounced.csv", &retrieval.bounced, annotated)?;
    writer::write_events(
        &config.output_dir,
        "unsubscribed.csv",
        &retrieval.unsubscribed,
        annotated,
    )?;

    let counts = sync::tally(&outcomes);
    let count = |status: SyncStatus| counts.get(&status).copied().unwrap_or(0);
    let failed_emails: Vec<String> = outcomes
        .iter()
        .filter(|o| o.status == SyncStatus::Failed)
        .map(|o| o.email.clone())
        .collect();

    let summary = RunSummary {
        rows_loaded,
        records_normalized,
        created: count(SyncStatus::Created),
        updated: count(SyncStatus::Updated),
        skipped: count(SyncStatus::Skipped),
        failed: count(SyncStatus::Failed),
        failed_emails,
        bounced: retrieval.bounced.contacts.len(),
        unsubscribed: retrieval.unsubscribed.contacts.len(),
        retrieval_incomplete: retrieval.incomplete(),
    };

    writer::append_run_log(
        &config.output_dir,
        &timezone,
        &RunLogEntry {
            started_at,
            finished_at: Utc::now(),
            rows_loaded: summary.rows_loaded,
            records_normalized: summary.records_normalized,
            created: summary.created,
            updated: summary.updated,
            skipped: summary.skipped,
            failed: summary.failed,
            bounced: summary.bounced,
            unsubscribed: summary.unsubscribed,
            retrieval_incomplete: summary.retrieval_incomplete,
        },
    )?;

    Ok(summary)
}
