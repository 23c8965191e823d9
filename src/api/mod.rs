//! Rate-limited API client for the marketing platform's v3 REST API.
//!
//! Modules:
//! - rate_limit: shared windowed request budget (the one cross-worker resource)
//! - client: reqwest transport with retry/backoff and typed endpoints
//!
//! The `ContactApi` trait is the seam the sync and retrieval engines are
//! written against; `client::ApiClient` is the production implementation
//! and tests substitute an in-memory mock.

pub mod client;
pub mod rate_limit;

pub use client::ApiClient;
pub use rate_limit::RateBudget;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::normalize::ContactRecord;

#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 429. Retryable; the budget window plus backoff absorbs it.
    #[error("rate limit exceeded")]
    RateLimited,

    /// HTTP 5xx, timeouts, connection failures. Retryable.
    #[error("transient server error: {0}")]
    Transient(String),

    /// Any other 4xx. Never retried.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited | ApiError::Transient(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 8_000,
        }
    }
}

/// Backoff before retry number `attempt` (1-based): base × 2^(attempt−1),
/// capped, plus jitter. A server-provided Retry-After wins (also capped).
pub fn retry_delay(attempt: u32, policy: &RetryPolicy, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter: u64 = {
        use rand::RngExt;
        rand::rng().random_range(0..150)
    };
    Duration::from_millis(base.saturating_add(jitter))
}

/// Bounced and unsubscribed are the two event collections the platform
/// exposes via contact status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Bounced,
    Unsubscribed,
}

impl EventType {
    /// Platform status code used in the list endpoint's query string.
    pub fn status_code(&self) -> u8 {
        match self {
            EventType::Bounced => 3,
            EventType::Unsubscribed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Bounced => "bounced",
            EventType::Unsubscribed => "unsubscribed",
        }
    }
}

/// Remote copy of a contact as seen by lookup. `fields` is keyed by the
/// local column name where the implementation can map it back; unmapped
/// remote fields are omitted, which biases comparison toward Update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteContact {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub fields: BTreeMap<String, String>,
}

impl RemoteContact {
    /// True when the outbound record would change nothing remotely.
    pub fn matches(&self, record: &ContactRecord) -> bool {
        self.first_name == record.first_name
            && self.last_name == record.last_name
            && self.phone == record.phone
            && record
                .fields
                .iter()
                .all(|(key, value)| self.fields.get(key) == Some(value))
    }
}

/// One entry from a paginated event collection.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub remote_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub timestamp: Option<NaiveDate>,
}

/// Operations the engines need from the remote platform. One method, one
/// rate-limited request.
#[async_trait]
pub trait ContactApi: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<RemoteContact>, ApiError>;

    async fn create_contact(&self, record: &ContactRecord) -> Result<RemoteContact, ApiError>;

    async fn update_contact(
        &self,
        remote_id: &str,
        record: &ContactRecord,
    ) -> Result<RemoteContact, ApiError>;

    /// Ensure membership in a segment. Idempotent remotely.
    async fn subscribe(&self, remote_id: &str, segment_id: &str) -> Result<(), ApiError>;

    /// One page of an event collection; `offset` is in records.
    async fn event_page(
        &self,
        event: EventType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RemoteEvent>, ApiError>;

    /// A single custom field's value for one contact.
    async fn field_value(&self, remote_id: &str, field_id: &str) -> Result<Option<String>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        // Jitter adds up to 150ms on top of the base.
        let d1 = retry_delay(1, &policy, None).as_millis() as u64;
        let d2 = retry_delay(2, &policy, None).as_millis() as u64;
        let d5 = retry_delay(5, &policy, None).as_millis() as u64;
        assert!((100..250).contains(&d1), "attempt 1: {}", d1);
        assert!((200..350).contains(&d2), "attempt 2: {}", d2);
        assert!((1_000..1_150).contains(&d5), "attempt 5 capped: {}", d5);
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_delay(1, &policy, Some(7)), Duration::from_secs(7));
        // Absurd Retry-After values are clamped.
        assert_eq!(retry_delay(1, &policy, Some(9_999)), Duration::from_secs(30));
    }

    #[test]
    fn test_error_retryability() {
        assert!(ApiError::RateLimited.is_retryable());
        assert!(ApiError::Transient("503".into()).is_retryable());
        assert!(!ApiError::Client {
            status: 422,
            body: "bad email".into()
        }
        .is_retryable());
        assert!(!ApiError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_event_status_codes() {
        assert_eq!(EventType::Bounced.status_code(), 3);
        assert_eq!(EventType::Unsubscribed.status_code(), 2);
    }

    #[test]
    fn test_remote_contact_matches_is_subset_on_fields() {
        let record = ContactRecord {
            email: "a@example.com".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            phone: "".into(),
            fields: [("Postcode".to_string(), "2000".to_string())].into(),
            tags: vec![],
            segment_id: Some("71".into()),
            source_file: "Welcome".into(),
        };
        let mut remote = RemoteContact {
            id: "1".into(),
            email: "a@example.com".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            phone: "".into(),
            fields: [
                ("Postcode".to_string(), "2000".to_string()),
                ("Title".to_string(), "Dr".to_string()),
            ]
            .into(),
        };
        assert!(remote.matches(&record));

        remote.fields.insert("Postcode".into(), "3000".into());
        assert!(!remote.matches(&record));
    }
}
