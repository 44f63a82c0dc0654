//! Spreadsheet-shaped remote table access + rate-limited write execution.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "profsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limited: {0}")]
    Throttled(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("{0}")]
    Unexpected(String),
}

impl StoreError {
    /// The retryable-error predicate: only throttling/quota signals qualify.
    pub fn is_throttled(&self) -> bool {
        matches!(self, StoreError::Throttled(_))
    }
}

/// How the remote interprets written values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueInput {
    /// Values land verbatim.
    Raw,
    /// Values are parsed as if typed in, so `=HYPERLINK(...)` becomes a formula.
    UserEntered,
}

impl ValueInput {
    pub fn as_param(self) -> &'static str {
        match self {
            ValueInput::Raw => "RAW",
            ValueInput::UserEntered => "USER_ENTERED",
        }
    }
}

/// A spreadsheet-shaped remote store: named tabs of string rows.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// All rows of a tab, header included. An absent tab reads as empty.
    async fn read_all(&self, tab: &str) -> Result<Vec<Vec<String>>, StoreError>;

    /// Appends one row and returns its 1-based row index.
    async fn append_row(&self, tab: &str, row: &[String]) -> Result<usize, StoreError>;

    /// Overwrites an A1-style range with the given rows.
    async fn write_range(
        &self,
        tab: &str,
        range: &str,
        rows: &[Vec<String>],
        input: ValueInput,
    ) -> Result<(), StoreError>;

    /// Clears every value in a tab.
    async fn clear(&self, tab: &str) -> Result<(), StoreError>;

    /// Creates the tab if it does not exist yet.
    async fn ensure_tab(&self, tab: &str) -> Result<(), StoreError>;
}

/// Zero-based column index to letter: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letter(col_idx: usize) -> String {
    let mut result = String::new();
    let mut idx = col_idx + 1;
    while idx > 0 {
        idx -= 1;
        result.insert(0, (b'A' + (idx % 26) as u8) as char);
        idx /= 26;
    }
    result
}

/// Pulls the appended row index out of an updated-range string such as
/// `Profiles!A12:R12`.
pub fn parse_appended_row(updated_range: &str) -> Option<usize> {
    let cells = updated_range.rsplit('!').next()?;
    let start = cells.split(':').next()?;
    let digits: String = start.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub fn classify_api_error(status: StatusCode, body: String) -> StoreError {
    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || body.to_ascii_lowercase().contains("quota")
        || body.contains("RESOURCE_EXHAUSTED");
    if throttled {
        StoreError::Throttled(format!("{}: {}", status.as_u16(), body))
    } else {
        StoreError::Api {
            status: status.as_u16(),
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub api_token: String,
    pub timeout: Duration,
}

/// Sheets-style REST client. Values routes follow the usual shape:
/// `GET  {base}/spreadsheets/{id}/values/{tab}`
/// `POST {base}/spreadsheets/{id}/values/{tab}:append`
/// `PUT  {base}/spreadsheets/{id}/values/{tab}!{range}`
/// `POST {base}/spreadsheets/{id}/values/{tab}:clear`
#[derive(Debug, Clone)]
pub struct RestTableClient {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    #[serde(default)]
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
struct AppendUpdates {
    #[serde(rename = "updatedRange", default)]
    updated_range: String,
}

impl RestTableClient {
    pub fn new(config: RestClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building table store client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: config.spreadsheet_id,
            api_token: config.api_token,
        })
    }

    fn values_url(&self, suffix: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url, self.spreadsheet_id, suffix
        )
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.api_token)
    }

    async fn error_for(resp: reqwest::Response) -> StoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        classify_api_error(status, body)
    }
}

#[async_trait]
impl TableStore for RestTableClient {
    async fn read_all(&self, tab: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let resp = self.auth(self.http.get(self.values_url(tab))).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        let body: ValuesResponse = resp.json().await?;
        Ok(body.values)
    }

    async fn append_row(&self, tab: &str, row: &[String]) -> Result<usize, StoreError> {
        let url = format!("{}:append", self.values_url(tab));
        let resp = self
            .auth(self.http.post(url))
            .query(&[
                ("valueInputOption", ValueInput::Raw.as_param()),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": [row] }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        let body: AppendResponse = resp.json().await?;
        body.updates
            .as_ref()
            .and_then(|u| parse_appended_row(&u.updated_range))
            .ok_or_else(|| {
                StoreError::Unexpected(format!("append to {tab} reported no updated range"))
            })
    }

    async fn write_range(
        &self,
        tab: &str,
        range: &str,
        rows: &[Vec<String>],
        input: ValueInput,
    ) -> Result<(), StoreError> {
        let url = self.values_url(&format!("{tab}!{range}"));
        let resp = self
            .auth(self.http.put(url))
            .query(&[("valueInputOption", input.as_param())])
            .json(&json!({ "values": rows }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(())
    }

    async fn clear(&self, tab: &str) -> Result<(), StoreError> {
        let url = format!("{}:clear", self.values_url(tab));
        let resp = self.auth(self.http.post(url)).send().await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(())
    }

    async fn ensure_tab(&self, tab: &str) -> Result<(), StoreError> {
        let url = format!(
            "{}/spreadsheets/{}:batchUpdate",
            self.base_url, self.spreadsheet_id
        );
        let resp = self
            .auth(self.http.post(url))
            .json(&json!({
                "requests": [{ "addSheet": { "properties": { "title": tab } } }]
            }))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("already exists") {
            return Ok(());
        }
        Err(classify_api_error(status, body))
    }
}

/// In-memory [`TableStore`] backing tests and `--dry-run` invocations.
#[derive(Debug, Default)]
pub struct MemoryTable {
    tabs: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a tab's rows, for assertions.
    pub async fn rows(&self, tab: &str) -> Vec<Vec<String>> {
        self.tabs.lock().await.get(tab).cloned().unwrap_or_default()
    }

    /// Replaces a tab's contents wholesale.
    pub async fn seed(&self, tab: &str, rows: Vec<Vec<String>>) {
        self.tabs.lock().await.insert(tab.to_string(), rows);
    }
}

#[async_trait]
impl TableStore for MemoryTable {
    async fn read_all(&self, tab: &str) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.tabs.lock().await.get(tab).cloned().unwrap_or_default())
    }

    async fn append_row(&self, tab: &str, row: &[String]) -> Result<usize, StoreError> {
        let mut tabs = self.tabs.lock().await;
        let rows = tabs.entry(tab.to_string()).or_default();
        rows.push(row.to_vec());
        Ok(rows.len())
    }

    async fn write_range(
        &self,
        tab: &str,
        range: &str,
        rows: &[Vec<String>],
        _input: ValueInput,
    ) -> Result<(), StoreError> {
        let start = range.split(':').next().unwrap_or(range);
        let col_letters: String = start.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        let row_digits: String = start.chars().filter(|c| c.is_ascii_digit()).collect();
        let row_idx: usize = row_digits
            .parse()
            .map_err(|_| StoreError::Unexpected(format!("bad range: {range}")))?;
        let col_idx = col_letters
            .chars()
            .fold(0usize, |acc, c| acc * 26 + (c as usize - 'A' as usize + 1))
            .saturating_sub(1);

        let mut tabs = self.tabs.lock().await;
        let stored = tabs.entry(tab.to_string()).or_default();
        for (offset, row) in rows.iter().enumerate() {
            let target = row_idx - 1 + offset;
            while stored.len() <= target {
                stored.push(Vec::new());
            }
            let line = &mut stored[target];
            for (i, value) in row.iter().enumerate() {
                let col = col_idx + i;
                while line.len() <= col {
                    line.push(String::new());
                }
                line[col] = value.clone();
            }
        }
        Ok(())
    }

    async fn clear(&self, tab: &str) -> Result<(), StoreError> {
        self.tabs.lock().await.insert(tab.to_string(), Vec::new());
        Ok(())
    }

    async fn ensure_tab(&self, tab: &str) -> Result<(), StoreError> {
        self.tabs.lock().await.entry(tab.to_string()).or_default();
        Ok(())
    }
}

/// Bounded retry for throttled writes: linear backoff, fixed attempt cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.base_delay.saturating_mul(attempt_index as u32 + 1)
    }
}

/// Applies single remote mutations under the retry policy, inserting a fixed
/// pacing delay after every successful operation to stay under the remote's
/// rate budget regardless of observed throttling.
#[derive(Debug, Clone)]
pub struct WriteExecutor {
    policy: RetryPolicy,
    pacing: Duration,
}

impl WriteExecutor {
    pub fn new(policy: RetryPolicy, pacing: Duration) -> Self {
        Self { policy, pacing }
    }

    pub async fn apply<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut last_throttle: Option<StoreError> = None;
        for attempt in 0..self.policy.max_attempts {
            match op().await {
                Ok(value) => {
                    if !self.pacing.is_zero() {
                        tokio::time::sleep(self.pacing).await;
                    }
                    return Ok(value);
                }
                Err(err) if err.is_throttled() && attempt + 1 < self.policy.max_attempts => {
                    let wait = self.policy.delay_for_attempt(attempt);
                    warn!(label, attempt, wait_secs = wait.as_secs_f64(), "rate limited, backing off");
                    tokio::time::sleep(wait).await;
                    last_throttle = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_throttle.expect("retry loop records an error before exhausting attempts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn column_letters_cover_multi_letter_columns() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(17), "R");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn appended_row_parses_from_updated_range() {
        assert_eq!(parse_appended_row("Profiles!A12:R12"), Some(12));
        assert_eq!(parse_appended_row("Logs!A2:F2"), Some(2));
        assert_eq!(parse_appended_row("garbage"), None);
    }

    #[test]
    fn throttle_classification_only_matches_quota_signals() {
        assert!(classify_api_error(StatusCode::TOO_MANY_REQUESTS, String::new()).is_throttled());
        assert!(classify_api_error(
            StatusCode::FORBIDDEN,
            "user quota exceeded".to_string()
        )
        .is_throttled());
        assert!(!classify_api_error(StatusCode::BAD_REQUEST, "bad range".to_string())
            .is_throttled());
        assert!(!classify_api_error(StatusCode::INTERNAL_SERVER_ERROR, String::new())
            .is_throttled());
    }

    #[test]
    fn backoff_is_linear_in_the_attempt_index() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_then_success_matches_immediate_success_plus_delays() {
        let executor = WriteExecutor::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
            },
            Duration::from_millis(800),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let started = Instant::now();
        let result = executor
            .apply("test write", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StoreError::Throttled("429".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One backoff delay (attempt 0: 5 s) plus one pacing delay (800 ms).
        assert_eq!(started.elapsed(), Duration::from_millis(5800));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_abort_immediately() {
        let executor = WriteExecutor::new(RetryPolicy::default(), Duration::from_millis(800));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let started = Instant::now();
        let result: Result<(), StoreError> = executor
            .apply("test write", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Api {
                        status: 400,
                        body: "bad range".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Api { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_throttling_degrades_after_bounded_attempts() {
        let executor = WriteExecutor::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
            },
            Duration::from_millis(800),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), StoreError> = executor
            .apply("test write", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Throttled("quota".to_string()))
                }
            })
            .await;

        assert!(result.unwrap_err().is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn memory_table_appends_and_overwrites() {
        let table = MemoryTable::new();
        table.ensure_tab("Profiles").await.unwrap();
        let header = vec!["A".to_string(), "B".to_string()];
        assert_eq!(table.append_row("Profiles", &header).await.unwrap(), 1);
        let row = vec!["x".to_string(), "y".to_string()];
        assert_eq!(table.append_row("Profiles", &row).await.unwrap(), 2);

        table
            .write_range(
                "Profiles",
                "A2:B2",
                &[vec!["x2".to_string(), "y2".to_string()]],
                ValueInput::Raw,
            )
            .await
            .unwrap();
        table
            .write_range("Profiles", "B1", &[vec!["B!".to_string()]], ValueInput::UserEntered)
            .await
            .unwrap();

        let rows = table.rows("Profiles").await;
        assert_eq!(rows[0], vec!["A".to_string(), "B!".to_string()]);
        assert_eq!(rows[1], vec!["x2".to_string(), "y2".to_string()]);
    }

    #[tokio::test]
    async fn memory_table_reads_missing_tab_as_empty() {
        let table = MemoryTable::new();
        assert!(table.read_all("Nope").await.unwrap().is_empty());
        table.clear("Nope").await.unwrap();
        assert!(table.read_all("Nope").await.unwrap().is_empty());
    }
}
