//! Retrieval engine: pulls the bounced and unsubscribed collections.
//!
//! Offset pagination has a cursor dependency, so pages within one
//! collection are fetched strictly in order; the two collections are
//! independent and run as two concurrent tasks over the same rate budget.
//! A page that exhausts retries ends that collection early with whatever
//! was accumulated, flagged incomplete — never silently passed off as the
//! full list.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate};

use crate::api::{ContactApi, EventType};

/// One bounced or unsubscribed contact pulled from the remote system.
#[derive(Debug, Clone)]
pub struct RemoteContactRef {
    pub email: String,
    pub remote_id: String,
    pub first_name: String,
    pub last_name: String,
    pub event: EventType,
    pub timestamp: Option<NaiveDate>,
    /// Configured custom-field value (e.g. an internal CRM id), when
    /// annotation is enabled and the lookup succeeded.
    pub annotation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub event: EventType,
    pub contacts: Vec<RemoteContactRef>,
    /// True when retries were exhausted before the end of the collection;
    /// `contacts` then holds only the pages fetched so far.
    pub incomplete: bool,
    pub pages_fetched: usize,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub bounced: CollectionResult,
    pub unsubscribed: CollectionResult,
}

impl RetrievalResult {
    pub fn incomplete(&self) -> bool {
        self.bounced.incomplete || self.unsubscribed.incomplete
    }
}

/// Weekly reporting window ending at the most recent week boundary.
///
/// Mirrors the batch's weekly cadence: `start` is the Monday of the
/// current week minus `lookback_days` and one day of slack; the window
/// spans the following eight days, with both endpoints exclusive.
pub fn weekly_window(today: NaiveDate, lookback_days: i64) -> (NaiveDate, NaiveDate) {
    let start = today
        - Duration::days(today.weekday().num_days_from_monday() as i64)
        - Duration::days(lookback_days)
        - Duration::days(1);
    let end = start + Duration::days(8);
    (start, end)
}

pub struct RetrievalEngine {
    api: Arc<dyn ContactApi>,
    page_size: usize,
    /// Exclusive date bounds; `None` keeps the full collections.
    window: Option<(NaiveDate, NaiveDate)>,
    annotation_field_id: Option<String>,
}

impl RetrievalEngine {
    pub fn new(
        api: Arc<dyn ContactApi>,
        page_size: usize,
        window: Option<(NaiveDate, NaiveDate)>,
        annotation_field_id: Option<String>,
    ) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
            window,
            annotation_field_id,
        }
    }

    /// Fetch both collections concurrently.
    pub async fn run(&self) -> RetrievalResult {
        let bounced_task = {
            let engine = self.clone_parts();
            tokio::spawn(async move { engine.fetch_collection(EventType::Bounced).await })
        };
        let unsubscribed_task = {
            let engine = self.clone_parts();
            tokio::spawn(async move { engine.fetch_collection(EventType::Unsubscribed).await })
        };

        let bounced = match bounced_task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("bounced retrieval task panicked: {}", e);
                empty_incomplete(EventType::Bounced)
            }
        };
        let unsubscribed = match unsubscribed_task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("unsubscribed retrieval task panicked: {}", e);
                empty_incomplete(EventType::Unsubscribed)
            }
        };

        RetrievalResult {
            bounced,
            unsubscribed,
        }
    }

    fn clone_parts(&self) -> RetrievalWorker {
        RetrievalWorker {
            api: self.api.clone(),
            page_size: self.page_size,
            window: self.window,
            annotation_field_id: self.annotation_field_id.clone(),
        }
    }
}

struct RetrievalWorker {
    api: Arc<dyn ContactApi>,
    page_size: usize,
    window: Option<(NaiveDate, NaiveDate)>,
    annotation_field_id: Option<String>,
}

impl RetrievalWorker {
    /// Sequential page walk; a short page signals the end of the
    /// collection.
    async fn fetch_collection(&self, event: EventType) -> CollectionResult {
        let mut contacts: Vec<RemoteContactRef> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset = 0usize;
        let mut pages_fetched = 0usize;
        let mut incomplete = false;

        loop {
            match self.api.event_page(event, self.page_size, offset).await {
                Ok(page) => {
                    pages_fetched += 1;
                    let page_len = page.len();
                    for entry in page {
                        if !seen.insert(entry.remote_id.clone()) {
                            continue;
                        }
                        if !self.in_window(entry.timestamp) {
                            continue;
                        }
                        contacts.push(RemoteContactRef {
                            email: entry.email,
                            remote_id: entry.remote_id,
                            first_name: entry.first_name,
                            last_name: entry.last_name,
                            event,
                            timestamp: entry.timestamp,
                            annotation: None,
                        });
                    }
                    if page_len < self.page_size {
                        break;
                    }
                    offset += self.page_size;
                }
                Err(e) => {
                    log::warn!(
                        "{} retrieval aborted at offset {}: {} (partial result)",
                        event.as_str(),
                        offset,
                        e
                    );
                    incomplete = true;
                    break;
                }
            }
        }

        if let Some(field_id) = &self.annotation_field_id {
            self.annotate(&mut contacts, field_id).await;
        }

        log::info!(
            "{}: {} contacts over {} pages{}",
            event.as_str(),
            contacts.len(),
            pages_fetched,
            if incomplete { " (incomplete)" } else { "" }
        );

        CollectionResult {
            event,
            contacts,
            incomplete,
            pages_fetched,
        }
    }

    fn in_window(&self, timestamp: Option<NaiveDate>) -> bool {
        match (self.window, timestamp) {
            (None, _) => true,
            (Some((start, end)), Some(date)) => date > start && date < end,
            // Window filtering drops undated events; they cannot be placed.
            (Some(_), None) => false,
        }
    }

    /// Resolve the configured custom field per contact. Failures leave the
    /// annotation empty; they never fail retrieval.
    async fn annotate(&self, contacts: &mut [RemoteContactRef], field_id: &str) {
        for contact in contacts.iter_mut() {
            match self.api.field_value(&contact.remote_id, field_id).await {
                Ok(value) => contact.annotation = value,
                Err(e) => {
                    log::debug!(
                        "annotation lookup failed for {}: {}",
                        contact.email,
                        e
                    );
                }
            }
        }
    }
}

fn empty_incomplete(event: EventType) -> CollectionResult {
    CollectionResult {
        event,
        contacts: Vec::new(),
        incomplete: true,
        pages_fetched: 0,
    }
}
