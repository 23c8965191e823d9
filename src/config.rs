//! Run configuration.
//!
//! Loaded from a JSON file; every knob has a default so a minimal config
//! only needs the paths and segment rules. Resolution order for the file
//! itself: explicit `--config` argument, `CONTACT_SYNC_CONFIG` env var,
//! then `~/.contact-sync/config.json`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RunError;

/// Env var naming an alternative config file.
pub const CONFIG_ENV: &str = "CONTACT_SYNC_CONFIG";

/// One segment-assignment rule, evaluated in order; first match wins.
///
/// A rule matches when the source file name contains `file_contains` (if
/// set) and every `(column, substring)` pair in `column_contains` matches
/// the row. The original feeds keyed on file-name keywords for one export
/// and on campaign/package column contents for the other, so both
/// predicates are supported and may be combined.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentRule {
    #[serde(default)]
    pub file_contains: Option<String>,
    #[serde(default)]
    pub column_contains: Vec<(String, String)>,
    pub segment_id: String,
}

/// Column-name aliases for the identity fields. Any column not claimed by
/// an alias list becomes a custom attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnAliases {
    #[serde(default = "default_email_aliases")]
    pub email: Vec<String>,
    #[serde(default = "default_first_name_aliases")]
    pub first_name: Vec<String>,
    #[serde(default = "default_last_name_aliases")]
    pub last_name: Vec<String>,
    #[serde(default = "default_phone_aliases")]
    pub phone: Vec<String>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        Self {
            email: default_email_aliases(),
            first_name: default_first_name_aliases(),
            last_name: default_last_name_aliases(),
            phone: default_phone_aliases(),
        }
    }
}

fn default_email_aliases() -> Vec<String> {
    vec!["Email".into(), "Email Address".into()]
}

fn default_first_name_aliases() -> Vec<String> {
    vec!["FirstName".into(), "First name".into(), "First Name".into()]
}

fn default_last_name_aliases() -> Vec<String> {
    vec!["Surname".into(), "Last name".into(), "Last Name".into()]
}

fn default_phone_aliases() -> Vec<String> {
    vec!["Mobile".into(), "Phone".into()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Remote platform API root, e.g. `https://acct.api-us1.com/api/3/`.
    pub base_url: String,

    /// Directory of exported list files (`.csv`, `.xlsx`, `.xls`).
    pub input_dir: PathBuf,

    /// Directory receiving `bounced.csv`, `unsubscribed.csv` and the run log.
    pub output_dir: PathBuf,

    /// Max requests per window across all workers. The remote platform
    /// documents 5 requests per second per account.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_window: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub segment_rules: Vec<SegmentRule>,
    #[serde(default)]
    pub column_aliases: ColumnAliases,

    /// Source column name → platform custom-field id. Columns without a
    /// mapping are sent keyed by their own name.
    #[serde(default)]
    pub field_ids: std::collections::HashMap<String, String>,

    /// When set, bounced/unsubscribed events are filtered to the weekly
    /// window ending at the most recent week boundary, looking back this
    /// many days. Unset keeps the full collections.
    #[serde(default)]
    pub lookback_days: Option<i64>,

    /// Custom field id resolved per retrieved contact (one extra lookup
    /// each) and written to the output's annotation column. Unset skips
    /// the lookups and the column.
    #[serde(default)]
    pub annotation_field_id: Option<String>,

    /// Timezone for run-log timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    #[serde(default = "default_api_token_secret")]
    pub api_token_secret: String,
}

fn default_rate_limit() -> u32 {
    5
}

fn default_rate_window_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    50
}

fn default_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_page_size() -> usize {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_timezone() -> String {
    "Australia/Sydney".to_string()
}

fn default_api_token_secret() -> String {
    "api_token".to_string()
}

impl SyncConfig {
    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .map_err(|e| RunError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file path: CLI arg, env var, home default.
    pub fn resolve_path(cli_arg: Option<&str>) -> PathBuf {
        if let Some(arg) = cli_arg {
            return PathBuf::from(arg);
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            if !env_path.is_empty() {
                return PathBuf::from(env_path);
            }
        }
        dirs::home_dir()
            .unwrap_or_default()
            .join(".contact-sync")
            .join("config.json")
    }

    fn validate(&self) -> Result<(), RunError> {
        if self.rate_limit_per_window == 0 {
            return Err(RunError::Config("rate_limit_per_window must be > 0".into()));
        }
        if self.rate_window_ms == 0 {
            return Err(RunError::Config("rate_window_ms must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(RunError::Config("batch_size must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(RunError::Config("workers must be > 0".into()));
        }
        if self.page_size == 0 {
            return Err(RunError::Config("page_size must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(RunError::Config("max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.secrets_file
            .clone()
            .unwrap_or_else(crate::secrets::FileSecretStore::default_path)
    }
}
