//! reqwest transport for the platform API.
//!
//! Every call acquires the shared `RateBudget` before each attempt
//! (including retries), authenticates with the `Api-Token` header, and
//! maps HTTP status codes onto the `ApiError` taxonomy. Retry with
//! exponential backoff applies only to retryable errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::rate_limit::RateBudget;
use super::{retry_delay, ApiError, ContactApi, EventType, RemoteContact, RemoteEvent, RetryPolicy};
use crate::config::SyncConfig;
use crate::normalize::ContactRecord;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    budget: Arc<RateBudget>,
    retry: RetryPolicy,
    /// Column name → platform field id (and the reverse, for lookups).
    field_ids: HashMap<String, String>,
    field_names: HashMap<String, String>,
}

impl ApiClient {
    pub fn new(
        config: &SyncConfig,
        token: String,
        budget: Arc<RateBudget>,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::Decode(format!("invalid base_url: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("contact-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let field_names = config
            .field_ids
            .iter()
            .map(|(name, id)| (id.clone(), name.clone()))
            .collect();

        Ok(Self {
            http,
            base_url,
            token,
            budget,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                initial_backoff_ms: config.backoff_base_ms,
                max_backoff_ms: config.max_backoff_ms,
            },
            field_ids: config.field_ids.clone(),
            field_names,
        })
    }

    /// One rate-limited, retried request. Success returns the decoded JSON
    /// body (`null` for empty bodies).
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::Decode(format!("bad path {:?}: {}", path, e)))?;

        let mut last_err = ApiError::Transient("request not attempted".into());

        for attempt in 1..=self.retry.max_attempts {
            self.budget.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header("Api-Token", &self.token)
                .header("Accept", "application/json")
                .query(query);
            if let Some(json) = body {
                request = request.json(json);
            }

            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let text = response
                            .text()
                            .await
                            .map_err(|e| ApiError::Decode(e.to_string()))?;
                        if text.is_empty() {
                            return Ok(serde_json::Value::Null);
                        }
                        return serde_json::from_str(&text)
                            .map_err(|e| ApiError::Decode(e.to_string()));
                    }

                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    let body_text = response.text().await.unwrap_or_default();
                    Err((classify_status(status, body_text), retry_after))
                }
                // Timeouts, connection resets, DNS failures: all retryable.
                Err(e) => Err((ApiError::Transient(e.to_string()), None)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err((err, retry_after)) => {
                    if err.is_retryable() && attempt < self.retry.max_attempts {
                        let delay = retry_delay(attempt, &self.retry, retry_after);
                        log::warn!(
                            "{} {} attempt {}/{} failed ({}), retrying in {:?}",
                            method,
                            path,
                            attempt,
                            self.retry.max_attempts,
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        last_err = err;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_err)
    }

    fn contact_payload(&self, record: &ContactRecord) -> serde_json::Value {
        let field_values: Vec<ApiFieldValue> = record
            .fields
            .iter()
            .map(|(column, value)| ApiFieldValue {
                contact: None,
                field: self.field_ids.get(column).unwrap_or(column).clone(),
                value: Some(value.clone()),
            })
            .collect();

        serde_json::json!({
            "contact": ContactPayload {
                email: record.email.clone(),
                first_name: record.first_name.clone(),
                last_name: record.last_name.clone(),
                phone: record.phone.clone(),
                field_values,
                tags: record.tags.clone(),
            }
        })
    }

    fn to_remote(&self, contact: ApiContact, field_values: &[ApiFieldValue]) -> RemoteContact {
        let fields: BTreeMap<String, String> = field_values
            .iter()
            .filter(|fv| fv.contact.as_deref() == Some(contact.id.as_str()) || fv.contact.is_none())
            .filter_map(|fv| {
                let value = fv.value.clone()?;
                // Only fields we can name locally take part in change
                // detection; unknown ids would force spurious updates.
                let name = self
                    .field_names
                    .get(&fv.field)
                    .cloned()
                    .or_else(|| (!fv.field.chars().all(|c| c.is_ascii_digit())).then(|| fv.field.clone()))?;
                Some((name, value))
            })
            .collect();

        RemoteContact {
            id: contact.id,
            email: contact.email,
            first_name: contact.first_name,
            last_name: contact.last_name,
            phone: contact.phone,
            fields,
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> ApiError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ApiError::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiError::Transient(format!("HTTP {}", status.as_u16()))
    } else {
        ApiError::Client {
            status: status.as_u16(),
            body,
        }
    }
}

fn parse_event_date(raw: Option<&str>) -> Option<NaiveDate> {
    // Platform timestamps arrive either as bare dates or ISO datetimes;
    // the leading 10 characters are the date either way. The value is
    // remote-supplied, so slice fallibly rather than trusting byte 10 to
    // be a char boundary.
    let date = raw?.trim().get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[async_trait]
impl ContactApi for ApiClient {
    async fn find_by_email(&self, email: &str) -> Result<Option<RemoteContact>, ApiError> {
        let value = self
            .request(
                Method::GET,
                "contacts",
                &[
                    ("email", email.to_string()),
                    ("include", "fieldValues".to_string()),
                ],
                None,
            )
            .await?;
        let response: ContactListResponse =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(response
            .contacts
            .into_iter()
            .next()
            .map(|contact| self.to_remote(contact, &response.field_values)))
    }

    async fn create_contact(&self, record: &ContactRecord) -> Result<RemoteContact, ApiError> {
        let payload = self.contact_payload(record);
        let value = self
            .request(Method::POST, "contacts", &[], Some(&payload))
            .await?;
        let response: SingleContactResponse =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(self.to_remote(response.contact, &response.field_values))
    }

    async fn update_contact(
        &self,
        remote_id: &str,
        record: &ContactRecord,
    ) -> Result<RemoteContact, ApiError> {
        let payload = self.contact_payload(record);
        let path = format!("contacts/{}", remote_id);
        let value = self
            .request(Method::PUT, &path, &[], Some(&payload))
            .await?;
        let response: SingleContactResponse =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(self.to_remote(response.contact, &response.field_values))
    }

    async fn subscribe(&self, remote_id: &str, segment_id: &str) -> Result<(), ApiError> {
        let payload = serde_json::json!({
            "contactList": {
                "list": segment_id,
                "contact": remote_id,
                "status": 1,
            }
        });
        self.request(Method::POST, "contactLists", &[], Some(&payload))
            .await?;
        Ok(())
    }

    async fn event_page(
        &self,
        event: EventType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RemoteEvent>, ApiError> {
        let value = self
            .request(
                Method::GET,
                "contacts",
                &[
                    ("status", event.status_code().to_string()),
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                ],
                None,
            )
            .await?;
        let response: ContactListResponse =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(response
            .contacts
            .into_iter()
            .map(|contact| {
                let timestamp = match event {
                    EventType::Bounced => parse_event_date(contact.bounced_date.as_deref()),
                    EventType::Unsubscribed => parse_event_date(contact.udate.as_deref()),
                };
                RemoteEvent {
                    remote_id: contact.id,
                    email: contact.email,
                    first_name: contact.first_name,
                    last_name: contact.last_name,
                    timestamp,
                }
            })
            .collect())
    }

    async fn field_value(
        &self,
        remote_id: &str,
        field_id: &str,
    ) -> Result<Option<String>, ApiError> {
        let path = format!("contacts/{}", remote_id);
        let value = self.request(Method::GET, &path, &[], None).await?;
        let response: SingleContactResponse =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(response
            .field_values
            .iter()
            .find(|fv| fv.field == field_id)
            .and_then(|fv| fv.value.clone()))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactPayload {
    email: String,
    first_name: String,
    last_name: String,
    phone: String,
    field_values: Vec<ApiFieldValue>,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiFieldValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contact: Option<String>,
    field: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiContact {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    phone: String,
    #[serde(default)]
    udate: Option<String>,
    // The platform reports this one in snake_case, unlike its neighbors.
    #[serde(default, rename = "bounced_date")]
    bounced_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactListResponse {
    #[serde(default)]
    contacts: Vec<ApiContact>,
    #[serde(default)]
    field_values: Vec<ApiFieldValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleContactResponse {
    contact: ApiContact,
    #[serde(default)]
    field_values: Vec<ApiFieldValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ApiError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "dup".into()),
            ApiError::Client { status: 422, .. }
        ));
    }

    #[test]
    fn test_parse_event_date() {
        assert_eq!(
            parse_event_date(Some("2024-03-11")),
            NaiveDate::from_ymd_opt(2024, 3, 11)
        );
        assert_eq!(
            parse_event_date(Some("2024-03-11T09:30:00-05:00")),
            NaiveDate::from_ymd_opt(2024, 3, 11)
        );
        assert_eq!(parse_event_date(Some("")), None);
        assert_eq!(parse_event_date(None), None);
        // Multi-byte character straddling the slice boundary must not panic.
        assert_eq!(parse_event_date(Some("2024-03-1éx")), None);
        assert_eq!(parse_event_date(Some("garbage value")), None);
    }

    #[test]
    fn test_contact_list_response_decodes_platform_shape() {
        let json = r#"{
            "contacts": [
                {"id": "42", "email": "a@example.com", "firstName": "Ada",
                 "lastName": "Lovelace", "phone": "", "bounced_date": "2024-03-11"}
            ],
            "fieldValues": [
                {"contact": "42", "field": "2", "value": "CONST-9"}
            ]
        }"#;
        let response: ContactListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.contacts.len(), 1);
        assert_eq!(response.contacts[0].first_name, "Ada");
        assert_eq!(response.field_values[0].value.as_deref(), Some("CONST-9"));
    }
}
