//! Snapshot reconciliation engine, audit sinks, and run orchestration.
//!
//! One run owns one [`SyncContext`]: the in-memory snapshot of the profiles
//! tab plus the write executor. Records are processed strictly one at a time
//! so every lookup sees every prior write.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use profsync_adapters::{
    clean_value, collect_profile, extract_online_handles, FetcherConfig, PageFetcher,
};
use profsync_core::{presentation_now, ChangeLogEntry, FieldKey, ProfileRecord, DATETIME_FORMAT};
use profsync_storage::{
    column_letter, MemoryTable, RestClientConfig, RestTableClient, RetryPolicy, StoreError,
    TableStore, ValueInput, WriteExecutor,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub use profsync_core::{ChangeKind, ReconcileOutcome, RunMetrics, RunMode};

pub const CRATE_NAME: &str = "profsync-sync";

pub const PROFILES_TAB: &str = "Profiles";
pub const TARGET_TAB: &str = "Target";
pub const TAGS_TAB: &str = "Tags";
pub const LOG_TAB: &str = "Logs";
pub const DASHBOARD_TAB: &str = "Dashboard";

pub const TARGET_HEADERS: [&str; 4] = ["Nickname", "Status", "Remarks", "Source"];
pub const LOG_HEADERS: [&str; 6] = [
    "Timestamp",
    "Nickname",
    "Change Type",
    "Fields",
    "Before",
    "After",
];
pub const DASHBOARD_HEADERS: [&str; 8] = [
    "Run#",
    "Timestamp",
    "Profiles",
    "Success",
    "Failed",
    "New",
    "Updated",
    "Unchanged",
];

/// Serialized before/after snapshots are cut at this many characters so log
/// rows stay bounded.
const LOG_PAYLOAD_LIMIT: usize = 500;

const BATCH_PAUSE: Duration = Duration::from_secs(5);

/// Raised before any record is processed; the only error class that makes the
/// whole run (and the process) fail.
#[derive(Debug, Error)]
#[error("fatal setup: {0}")]
pub struct FatalSetup(pub String);

/// Failures that isolate to a single identity; the run continues.
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error("missing identity")]
    MissingIdentity,
    #[error("write failed: {0}")]
    WriteFailed(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sheet_base_url: String,
    pub spreadsheet_id: String,
    pub api_token: String,
    pub site_base_url: String,
    pub session_cookie: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_profiles_per_run: usize,
    pub batch_size: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub write_delay_ms: u64,
    pub retry_base_delay_secs: u64,
    pub scheduler_enabled: bool,
    pub target_cron: String,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            sheet_base_url: std::env::var("SHEET_API_BASE_URL")
                .unwrap_or_else(|_| "https://sheets.googleapis.com/v4".to_string()),
            spreadsheet_id: std::env::var("SHEET_ID").unwrap_or_default(),
            api_token: std::env::var("SHEET_API_TOKEN").unwrap_or_default(),
            site_base_url: std::env::var("SITE_BASE_URL")
                .unwrap_or_else(|_| "https://damadam.pk".to_string()),
            session_cookie: std::env::var("SITE_SESSION_COOKIE").unwrap_or_default(),
            user_agent: std::env::var("PROFSYNC_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string()
            }),
            http_timeout_secs: std::env::var("PAGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_profiles_per_run: std::env::var("MAX_PROFILES_PER_RUN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            batch_size: std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            min_delay_ms: std::env::var("MIN_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(400),
            max_delay_ms: std::env::var("MAX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            write_delay_ms: std::env::var("SHEET_WRITE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(800),
            retry_base_delay_secs: std::env::var("SHEET_RETRY_BASE_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            scheduler_enabled: std::env::var("PROFSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            target_cron: std::env::var("TARGET_CRON")
                .unwrap_or_else(|_| "0 0/58 * * * *".to_string()),
            dry_run: false,
        }
    }
}

/// Last-known location and values for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// 1-based row in the profiles tab.
    pub row: usize,
    pub values: Vec<String>,
}

/// Identity → [`SnapshotEntry`], loaded once per run. At most one entry per
/// identity at any time.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    entries: HashMap<String, SnapshotEntry>,
}

impl SnapshotIndex {
    pub async fn load(store: &dyn TableStore) -> Result<Self, StoreError> {
        let rows = store.read_all(PROFILES_TAB).await?;
        let mut entries = HashMap::new();
        for (offset, row) in rows.iter().enumerate().skip(1) {
            let key = row
                .get(FieldKey::Handle.index())
                .map(|v| v.trim().to_lowercase())
                .unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            let mut values = row.clone();
            values.resize(FieldKey::COUNT, String::new());
            entries.insert(key, SnapshotEntry { row: offset + 1, values });
        }
        info!(profiles = entries.len(), "loaded existing profile snapshot");
        Ok(Self { entries })
    }

    pub fn locate(&self, key: &str) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    pub fn record(&mut self, key: String, row: usize, values: Vec<String>) {
        self.entries.insert(key, SnapshotEntry { row, values });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle → comma-joined tag names, read from the optional tags tab where
/// each column is headed by a tag and lists handles beneath it.
#[derive(Debug, Default)]
pub struct TagsMap {
    map: HashMap<String, String>,
}

impl TagsMap {
    pub async fn load(store: &dyn TableStore) -> Self {
        let rows = match store.read_all(TAGS_TAB).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "tags tab unavailable, continuing without tags");
                return Self::default();
            }
        };
        Self::from_rows(&rows)
    }

    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut map: HashMap<String, String> = HashMap::new();
        let Some(headers) = rows.first() else {
            return Self::default();
        };
        for (col_idx, tag_name) in headers.iter().enumerate() {
            let tag = tag_name.trim();
            if tag.is_empty() {
                continue;
            }
            for row in &rows[1..] {
                let Some(handle) = row.get(col_idx).map(|v| v.trim()) else {
                    continue;
                };
                if handle.is_empty() {
                    continue;
                }
                let key = handle.to_lowercase();
                match map.get_mut(&key) {
                    Some(existing) => {
                        existing.push_str(", ");
                        existing.push_str(tag);
                    }
                    None => {
                        map.insert(key, tag.to_string());
                    }
                }
            }
        }
        if !map.is_empty() {
            info!(tagged = map.len(), "loaded tags mapping");
        }
        Self { map }
    }

    pub fn for_handle(&self, handle: &str) -> String {
        self.map
            .get(&handle.trim().to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

/// The minimal remote mutation needed to make the store match a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// Full field tuple at a new location; the row is known only after append.
    Append { values: Vec<String> },
    /// Full-row overwrite at the stored location. Never a sparse patch: the
    /// whole row goes at once so column drift cannot corrupt half a record.
    Overwrite { row: usize, values: Vec<String> },
}

/// Cell values as they are persisted: link-bearing columns carry their
/// derived placeholder (the formula pass fills them in), everything else the
/// cleaned raw value.
pub fn presentation_row(record: &ProfileRecord) -> Vec<String> {
    FieldKey::ALL
        .into_iter()
        .map(|key| match key {
            FieldKey::Image => String::new(),
            FieldKey::ProfileLink => {
                if record.get(key).is_empty() {
                    String::new()
                } else {
                    "Profile".to_string()
                }
            }
            FieldKey::LastPost => {
                if record.get(key).is_empty() {
                    String::new()
                } else {
                    "Post".to_string()
                }
            }
            key => clean_value(record.get(key)),
        })
        .collect()
}

/// Field-by-field comparison in declared order; missing cells compare equal
/// to empty strings.
pub fn classify(
    row_values: &[String],
    existing: Option<&SnapshotEntry>,
) -> (ReconcileOutcome, Option<WritePlan>) {
    let Some(entry) = existing else {
        return (
            ReconcileOutcome::New,
            Some(WritePlan::Append {
                values: row_values.to_vec(),
            }),
        );
    };
    let changed: Vec<FieldKey> = FieldKey::ALL
        .into_iter()
        .filter(|key| {
            // The capture timestamp churns on every fetch; it is written with
            // the row but never counts as drift.
            if *key == FieldKey::CapturedAt {
                return false;
            }
            let old = entry
                .values
                .get(key.index())
                .map(String::as_str)
                .unwrap_or("");
            let new = row_values.get(key.index()).map(String::as_str).unwrap_or("");
            old != new
        })
        .collect();
    if changed.is_empty() {
        (ReconcileOutcome::Unchanged, None)
    } else {
        (
            ReconcileOutcome::Updated { changed },
            Some(WritePlan::Overwrite {
                row: entry.row,
                values: row_values.to_vec(),
            }),
        )
    }
}

fn full_row_range(row: usize) -> String {
    format!("A{row}:{}{row}", column_letter(FieldKey::COUNT - 1))
}

fn snapshot_field_map(values: &[String]) -> BTreeMap<&'static str, &str> {
    FieldKey::ALL
        .iter()
        .map(|key| {
            (
                key.header(),
                values.get(key.index()).map(String::as_str).unwrap_or(""),
            )
        })
        .collect()
}

fn truncate_payload(payload: &str) -> String {
    payload.chars().take(LOG_PAYLOAD_LIMIT).collect()
}

/// One identity to process, optionally bound to a status cell in the target
/// queue (`status_row == 0` means no side channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub handle: String,
    pub status_row: usize,
    pub origin: String,
}

/// Per-run reconciliation state: the snapshot index, the store handle, the
/// write executor, and the tags mapping. Owned by the run, discarded at run
/// end; never ambient.
pub struct SyncContext {
    store: Arc<dyn TableStore>,
    executor: WriteExecutor,
    snapshot: SnapshotIndex,
    tags: TagsMap,
}

impl SyncContext {
    /// Connects to the store, makes sure every tab and header exists, and
    /// loads the baseline snapshot. Any failure here is fatal: without a
    /// baseline every identity would re-append as "New".
    pub async fn bootstrap(store: Arc<dyn TableStore>, executor: WriteExecutor) -> Result<Self> {
        for tab in [PROFILES_TAB, TARGET_TAB, LOG_TAB, DASHBOARD_TAB] {
            store
                .ensure_tab(tab)
                .await
                .map_err(|e| FatalSetup(format!("creating tab {tab}: {e}")))?;
        }

        let headers: [(&str, Vec<String>); 3] = [
            (PROFILES_TAB, FieldKey::header_row()),
            (
                TARGET_TAB,
                TARGET_HEADERS.iter().map(|h| h.to_string()).collect(),
            ),
            (LOG_TAB, LOG_HEADERS.iter().map(|h| h.to_string()).collect()),
        ];
        for (tab, header) in headers {
            let rows = store
                .read_all(tab)
                .await
                .map_err(|e| FatalSetup(format!("reading tab {tab}: {e}")))?;
            if rows.is_empty() {
                store
                    .append_row(tab, &header)
                    .await
                    .map_err(|e| FatalSetup(format!("writing {tab} header: {e}")))?;
            }
        }

        let tags = TagsMap::load(store.as_ref()).await;
        let snapshot = SnapshotIndex::load(store.as_ref())
            .await
            .map_err(|e| FatalSetup(format!("loading profile snapshot baseline: {e}")))?;

        Ok(Self {
            store,
            executor,
            snapshot,
            tags,
        })
    }

    pub fn snapshot(&self) -> &SnapshotIndex {
        &self.snapshot
    }

    /// Reconciles one record: classify, apply the minimal write, refresh the
    /// index, and audit the outcome. Every outcome lands in the change log,
    /// `Unchanged` included.
    pub async fn write_profile(&mut self, record: &ProfileRecord) -> ReconcileOutcome {
        let key = record.handle_key();
        if key.is_empty() {
            let outcome = ReconcileOutcome::Failed {
                reason: RecordFailure::MissingIdentity.to_string(),
            };
            self.log_change(record, &outcome, None).await;
            return outcome;
        }

        let mut staged = record.clone();
        staged.set(FieldKey::Tags, self.tags.for_handle(record.handle()));

        let row_values = presentation_row(&staged);
        let existing = self.snapshot.locate(&key).cloned();
        let (outcome, plan) = classify(&row_values, existing.as_ref());

        let Some(plan) = plan else {
            self.log_change(&staged, &outcome, existing.as_ref()).await;
            return outcome;
        };

        let written_row = match self.apply_plan(&plan).await {
            Ok(row) => row,
            Err(err) => {
                warn!(handle = staged.handle(), error = %err, "profile write failed");
                let outcome = ReconcileOutcome::Failed {
                    reason: RecordFailure::WriteFailed(err).to_string(),
                };
                self.log_change(&staged, &outcome, existing.as_ref()).await;
                return outcome;
            }
        };

        if let Err(err) = self.apply_link_formulas(written_row, &staged).await {
            warn!(handle = staged.handle(), error = %err, "link formula write failed");
        }

        self.snapshot.record(key, written_row, row_values);
        self.log_change(&staged, &outcome, existing.as_ref()).await;
        outcome
    }

    async fn apply_plan(&self, plan: &WritePlan) -> Result<usize, StoreError> {
        let store = Arc::clone(&self.store);
        match plan {
            WritePlan::Append { values } => {
                let values = values.clone();
                self.executor
                    .apply("append profile row", move || {
                        let store = Arc::clone(&store);
                        let values = values.clone();
                        async move { store.append_row(PROFILES_TAB, &values).await }
                    })
                    .await
            }
            WritePlan::Overwrite { row, values } => {
                let row = *row;
                let range = full_row_range(row);
                let values = values.clone();
                self.executor
                    .apply("overwrite profile row", move || {
                        let store = Arc::clone(&store);
                        let range = range.clone();
                        let values = values.clone();
                        async move {
                            store
                                .write_range(PROFILES_TAB, &range, &[values], ValueInput::Raw)
                                .await
                        }
                    })
                    .await
                    .map(|_| row)
            }
        }
    }

    /// Secondary pass: link-bearing cells get their display formulas, each
    /// addressed by column/row from the fixed schema.
    async fn apply_link_formulas(
        &self,
        row: usize,
        record: &ProfileRecord,
    ) -> Result<(), StoreError> {
        for key in FieldKey::ALL {
            if !key.is_link_bearing() {
                continue;
            }
            let value = record.get(key);
            if value.is_empty() {
                continue;
            }
            let formula = match key {
                FieldKey::Image => format!("=IMAGE(\"{value}\", 4, 50, 50)"),
                FieldKey::LastPost => format!("=HYPERLINK(\"{value}\", \"Post\")"),
                _ => format!("=HYPERLINK(\"{value}\", \"Profile\")"),
            };
            let cell = format!("{}{}", column_letter(key.index()), row);
            let store = Arc::clone(&self.store);
            self.executor
                .apply("apply link formula", move || {
                    let store = Arc::clone(&store);
                    let cell = cell.clone();
                    let formula = formula.clone();
                    async move {
                        store
                            .write_range(
                                PROFILES_TAB,
                                &cell,
                                &[vec![formula]],
                                ValueInput::UserEntered,
                            )
                            .await
                    }
                })
                .await?;
        }
        Ok(())
    }

    async fn log_change(
        &self,
        record: &ProfileRecord,
        outcome: &ReconcileOutcome,
        before: Option<&SnapshotEntry>,
    ) {
        let changed_fields = match outcome {
            ReconcileOutcome::New => FieldKey::ALL.to_vec(),
            ReconcileOutcome::Updated { changed } => changed.clone(),
            _ => Vec::new(),
        };
        let entry = ChangeLogEntry {
            timestamp: presentation_now(),
            handle: record.handle().to_string(),
            kind: outcome.kind(),
            changed_fields,
            before: before.map(|e| {
                serde_json::to_string(&snapshot_field_map(&e.values)).unwrap_or_default()
            }),
            after: serde_json::to_string(&record.to_field_map()).unwrap_or_default(),
        };

        let fields_cell = match outcome {
            ReconcileOutcome::Failed { reason } => reason.clone(),
            _ if entry.changed_fields.is_empty() => "-".to_string(),
            _ => entry
                .changed_fields
                .iter()
                .map(|k| k.header())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let row = vec![
            entry.timestamp.format(DATETIME_FORMAT).to_string(),
            entry.handle.clone(),
            entry.kind.label().to_string(),
            fields_cell,
            truncate_payload(entry.before.as_deref().unwrap_or("{}")),
            truncate_payload(&entry.after),
        ];

        let store = Arc::clone(&self.store);
        if let Err(err) = self
            .executor
            .apply("append change log row", move || {
                let store = Arc::clone(&store);
                let row = row.clone();
                async move { store.append_row(LOG_TAB, &row).await }
            })
            .await
        {
            warn!(handle = entry.handle.as_str(), error = %err, "change log append failed");
        }
    }

    /// Validates the dashboard header (resetting the rolling view on drift)
    /// and returns the next run sequence number.
    async fn prepare_dashboard(&self) -> Result<u32, StoreError> {
        let rows = self.store.read_all(DASHBOARD_TAB).await?;
        let expected: Vec<String> = DASHBOARD_HEADERS.iter().map(|h| h.to_string()).collect();
        let header_ok = rows.first().map(|row| *row == expected).unwrap_or(false);
        if !header_ok {
            let store = Arc::clone(&self.store);
            self.executor
                .apply("reset dashboard", move || {
                    let store = Arc::clone(&store);
                    async move { store.clear(DASHBOARD_TAB).await }
                })
                .await?;
            let store = Arc::clone(&self.store);
            let header = expected.clone();
            self.executor
                .apply("write dashboard header", move || {
                    let store = Arc::clone(&store);
                    let header = header.clone();
                    async move { store.append_row(DASHBOARD_TAB, &header).await }
                })
                .await?;
            return Ok(1);
        }
        Ok(rows.len() as u32)
    }

    /// Appends one metrics row; the dashboard is a rolling view, the change
    /// log stays authoritative, so failures here only warn.
    pub async fn record_run(&self, counters: &RunCounters) -> RunMetrics {
        let finished_at = presentation_now();
        let run_seq = match self.prepare_dashboard().await {
            Ok(seq) => seq,
            Err(err) => {
                warn!(error = %err, "dashboard preparation failed");
                0
            }
        };
        let metrics = RunMetrics {
            run_seq,
            finished_at,
            processed: counters.processed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            new: counters.new,
            updated: counters.updated,
            unchanged: counters.unchanged,
        };

        let row = vec![
            metrics.run_seq.to_string(),
            finished_at.format(DATETIME_FORMAT).to_string(),
            metrics.processed.to_string(),
            metrics.succeeded.to_string(),
            metrics.failed.to_string(),
            metrics.new.to_string(),
            metrics.updated.to_string(),
            metrics.unchanged.to_string(),
        ];
        let store = Arc::clone(&self.store);
        if let Err(err) = self
            .executor
            .apply("append dashboard row", move || {
                let store = Arc::clone(&store);
                let row = row.clone();
                async move { store.append_row(DASHBOARD_TAB, &row).await }
            })
            .await
        {
            warn!(error = %err, "dashboard update failed");
        }
        metrics
    }

    /// Rows of the target queue still awaiting processing, in queue order.
    /// `limit == 0` means no cap.
    pub async fn pending_targets(&self, limit: usize) -> Result<Vec<SyncTarget>, StoreError> {
        let rows = self.store.read_all(TARGET_TAB).await?;
        let mut targets = Vec::new();
        for (offset, row) in rows.iter().enumerate().skip(1) {
            let handle = row.first().map(|v| v.trim()).unwrap_or_default();
            if handle.is_empty() {
                continue;
            }
            let status = row
                .get(1)
                .map(|v| v.trim().to_lowercase())
                .unwrap_or_default();
            if status != "pending" && status != "pending 🚨" {
                continue;
            }
            let origin = row
                .get(3)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or("Manual");
            targets.push(SyncTarget {
                handle: handle.to_string(),
                status_row: offset + 1,
                origin: origin.to_string(),
            });
        }
        if limit > 0 {
            targets.truncate(limit);
        }
        Ok(targets)
    }

    /// At-least-once status marker in the target queue; not transactional
    /// with the change log.
    pub async fn update_target_status(&self, row: usize, status: &str, remarks: &str) {
        for (col, value) in [("B", status), ("C", remarks)] {
            let cell = format!("{col}{row}");
            let value = value.to_string();
            let store = Arc::clone(&self.store);
            if let Err(err) = self
                .executor
                .apply("update target status", move || {
                    let store = Arc::clone(&store);
                    let cell = cell.clone();
                    let value = value.clone();
                    async move {
                        store
                            .write_range(TARGET_TAB, &cell, &[vec![value]], ValueInput::Raw)
                            .await
                    }
                })
                .await
            {
                warn!(row, error = %err, "target status update failed");
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl RunCounters {
    pub fn absorb(&mut self, outcome: &ReconcileOutcome) {
        self.processed += 1;
        match outcome {
            ReconcileOutcome::New => {
                self.succeeded += 1;
                self.new += 1;
            }
            ReconcileOutcome::Updated { .. } => {
                self.succeeded += 1;
                self.updated += 1;
            }
            ReconcileOutcome::Unchanged => {
                self.succeeded += 1;
                self.unchanged += 1;
            }
            ReconcileOutcome::Failed { .. } => {
                self.failed += 1;
            }
        }
    }

    pub fn note_fetch_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<FixedOffset>,
    pub finished_at: DateTime<FixedOffset>,
    pub metrics: RunMetrics,
}

/// Free-text remark written next to a completed target row.
fn completion_remark(outcome: &ReconcileOutcome, now: DateTime<FixedOffset>) -> String {
    let detail = match outcome {
        ReconcileOutcome::New => "New target profile added".to_string(),
        ReconcileOutcome::Updated { changed } => {
            let mut key_fields: Vec<&'static str> = changed
                .iter()
                .filter(|key| !key.excluded_from_summary())
                .map(|key| key.header())
                .collect();
            if key_fields.is_empty() {
                "Updated (no key changes)".to_string()
            } else {
                let overflow = key_fields.len() > 5;
                key_fields.truncate(5);
                let mut joined = key_fields.join(", ");
                if overflow {
                    joined.push_str(", …");
                }
                format!("Updated: {joined}")
            }
        }
        ReconcileOutcome::Unchanged => "No data changes".to_string(),
        ReconcileOutcome::Failed { reason } => format!("Error: {reason}"),
    };
    format!("{detail} @ {}", now.format("%I:%M %p"))
}

/// Owns the long-lived collaborators (store client, page fetcher) and runs
/// complete sweeps; each run builds its own [`SyncContext`].
pub struct SyncRunner {
    config: SyncConfig,
    store: Arc<dyn TableStore>,
    fetcher: PageFetcher,
}

impl SyncRunner {
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn TableStore> = if config.dry_run {
            info!("dry run: writes go to an in-memory table");
            Arc::new(MemoryTable::new())
        } else {
            Arc::new(RestTableClient::new(RestClientConfig {
                base_url: config.sheet_base_url.clone(),
                spreadsheet_id: config.spreadsheet_id.clone(),
                api_token: config.api_token.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
            })?)
        };
        let fetcher = PageFetcher::new(FetcherConfig {
            site_base_url: config.site_base_url.clone(),
            session_cookie: config.session_cookie.clone(),
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;
        Ok(Self {
            config,
            store,
            fetcher,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = presentation_now();
        info!(%run_id, ?mode, "starting sync run");

        let executor = WriteExecutor::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(self.config.retry_base_delay_secs),
            },
            Duration::from_millis(self.config.write_delay_ms),
        );
        let mut ctx = SyncContext::bootstrap(Arc::clone(&self.store), executor).await?;

        let targets = self.collect_targets(&ctx, mode).await;
        if targets.is_empty() {
            info!("no profiles to process");
            let finished_at = presentation_now();
            return Ok(RunSummary {
                run_id,
                mode,
                started_at,
                finished_at,
                metrics: RunMetrics {
                    run_seq: 0,
                    finished_at,
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    new: 0,
                    updated: 0,
                    unchanged: 0,
                },
            });
        }

        let total = targets.len();
        let mut counters = RunCounters::default();
        for (i, target) in targets.iter().enumerate() {
            let position = i + 1;
            info!(
                position,
                total,
                handle = target.handle.as_str(),
                origin = target.origin.as_str(),
                "processing profile"
            );

            if mode == RunMode::Targets && target.status_row > 0 {
                let remark = format!("Started @ {}", presentation_now().format("%I:%M %p"));
                ctx.update_target_status(target.status_row, "🔄 Processing", &remark)
                    .await;
            }

            let outcome = self.process_one(&mut ctx, target).await;
            match &outcome {
                Some(outcome) => counters.absorb(outcome),
                None => counters.note_fetch_failure(),
            }

            if mode == RunMode::Targets && target.status_row > 0 {
                let now = presentation_now();
                match &outcome {
                    Some(outcome) if outcome.is_success() => {
                        ctx.update_target_status(
                            target.status_row,
                            "✅ Completed",
                            &completion_remark(outcome, now),
                        )
                        .await;
                    }
                    Some(outcome) => {
                        ctx.update_target_status(
                            target.status_row,
                            "❌ Failed",
                            &completion_remark(outcome, now),
                        )
                        .await;
                    }
                    None => {
                        ctx.update_target_status(
                            target.status_row,
                            "❌ Failed",
                            &format!("Scrape error @ {}", now.format("%I:%M %p")),
                        )
                        .await;
                    }
                }
            }

            if self.config.batch_size > 0 && position % self.config.batch_size == 0 && position < total
            {
                info!(position, total, "batch pause");
                tokio::time::sleep(BATCH_PAUSE).await;
            }
            tokio::time::sleep(self.politeness_delay()).await;
        }

        let metrics = ctx.record_run(&counters).await;
        let finished_at = metrics.finished_at;
        info!(
            run = metrics.run_seq,
            processed = metrics.processed,
            succeeded = metrics.succeeded,
            failed = metrics.failed,
            new = metrics.new,
            updated = metrics.updated,
            unchanged = metrics.unchanged,
            "sync run complete"
        );
        Ok(RunSummary {
            run_id,
            mode,
            started_at,
            finished_at,
            metrics,
        })
    }

    async fn process_one(
        &self,
        ctx: &mut SyncContext,
        target: &SyncTarget,
    ) -> Option<ReconcileOutcome> {
        let now = presentation_now();
        let record = match collect_profile(&self.fetcher, &target.handle, now).await {
            Ok(Some(mut record)) => {
                record.set(FieldKey::Source, target.origin.clone());
                record
            }
            Ok(None) => {
                warn!(handle = target.handle.as_str(), "profile unavailable");
                return None;
            }
            Err(err) => {
                warn!(handle = target.handle.as_str(), error = %err, "profile fetch failed");
                return None;
            }
        };
        Some(ctx.write_profile(&record).await)
    }

    async fn collect_targets(&self, ctx: &SyncContext, mode: RunMode) -> Vec<SyncTarget> {
        match mode {
            RunMode::Targets => match ctx.pending_targets(self.config.max_profiles_per_run).await {
                Ok(targets) => {
                    info!(pending = targets.len(), "found pending targets");
                    targets
                }
                Err(err) => {
                    warn!(error = %err, "reading target queue failed");
                    Vec::new()
                }
            },
            RunMode::Online => {
                let html = match self.fetcher.fetch_online_page().await {
                    Ok(Some(html)) => html,
                    Ok(None) => {
                        warn!("online users page unavailable");
                        return Vec::new();
                    }
                    Err(err) => {
                        warn!(error = %err, "online users fetch failed");
                        return Vec::new();
                    }
                };
                match extract_online_handles(&html) {
                    Ok(handles) => {
                        info!(online = handles.len(), "found online users");
                        handles
                            .into_iter()
                            .map(|handle| SyncTarget {
                                handle,
                                status_row: 0,
                                origin: RunMode::Online.origin_label().to_string(),
                            })
                            .collect()
                    }
                    Err(err) => {
                        warn!(error = %err, "online users parse failed");
                        Vec::new()
                    }
                }
            }
        }
    }

    fn politeness_delay(&self) -> Duration {
        let min = self.config.min_delay_ms.min(self.config.max_delay_ms);
        let max = self.config.min_delay_ms.max(self.config.max_delay_ms);
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }
}

pub async fn run_once_from_env(mode: RunMode) -> Result<RunSummary> {
    let runner = SyncRunner::from_config(SyncConfig::from_env())?;
    runner.run(mode).await
}

/// Optional cron scheduler that drains the target queue on the configured
/// cadence.
pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runner.config.target_cron.clone();
    let job_runner = Arc::clone(&runner);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&job_runner);
        Box::pin(async move {
            match runner.run(RunMode::Targets).await {
                Ok(summary) => info!(
                    run = summary.metrics.run_seq,
                    processed = summary.metrics.processed,
                    "scheduled target run complete"
                ),
                Err(err) => warn!(error = %err, "scheduled target run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_executor() -> WriteExecutor {
        WriteExecutor::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
            },
            Duration::ZERO,
        )
    }

    async fn test_context(store: &Arc<MemoryTable>) -> SyncContext {
        let dyn_store: Arc<dyn TableStore> = store.clone();
        SyncContext::bootstrap(dyn_store, fast_executor())
            .await
            .expect("bootstrap")
    }

    fn record(handle: &str, city: &str, posts: &str) -> ProfileRecord {
        let mut record = ProfileRecord::new();
        record.set(FieldKey::Handle, handle);
        record.set(FieldKey::City, city);
        record.set(FieldKey::Posts, posts);
        record
    }

    fn log_rows(rows: &[Vec<String>]) -> &[Vec<String>] {
        &rows[1..]
    }

    #[tokio::test]
    async fn bootstrap_writes_missing_headers() {
        let store = Arc::new(MemoryTable::new());
        let _ctx = test_context(&store).await;

        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles[0], FieldKey::header_row());
        let target = store.rows(TARGET_TAB).await;
        assert_eq!(target[0], TARGET_HEADERS.map(String::from).to_vec());
        let logs = store.rows(LOG_TAB).await;
        assert_eq!(logs[0], LOG_HEADERS.map(String::from).to_vec());
    }

    #[tokio::test]
    async fn new_profile_appends_full_tuple_and_logs_new() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;
        assert!(ctx.snapshot().is_empty());

        let outcome = ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        assert_eq!(outcome, ReconcileOutcome::New);

        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1][FieldKey::Handle.index()], "sam99");
        assert_eq!(profiles[1][FieldKey::City.index()], "Lahore");
        assert_eq!(profiles[1][FieldKey::Posts.index()], "3");

        let entry = ctx.snapshot().locate("sam99").expect("indexed");
        assert_eq!(entry.row, 2);

        let logs = store.rows(LOG_TAB).await;
        let data = log_rows(&logs);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][2], "NEW");
        assert!(data[0][3].contains("CITY"));
        assert_eq!(data[0][4], "{}");
        assert!(data[0][5].contains("Lahore"));
    }

    #[tokio::test]
    async fn city_change_reports_exactly_that_field() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let outcome = ctx.write_profile(&record("sam99", "Karachi", "3")).await;
        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                changed: vec![FieldKey::City]
            }
        );

        // Overwrite in place: still one data row, now holding the new value.
        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1][FieldKey::City.index()], "Karachi");
    }

    #[tokio::test]
    async fn change_detection_reports_full_mutated_subset() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let mut next = record("sam99", "Karachi", "4");
        next.set(FieldKey::Status, "Verified");
        let outcome = ctx.write_profile(&next).await;

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                changed: vec![FieldKey::City, FieldKey::Status, FieldKey::Posts]
            }
        );
    }

    #[tokio::test]
    async fn unchanged_twice_is_idempotent_and_still_audited() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let first = ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let second = ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        assert_eq!(first, ReconcileOutcome::Unchanged);
        assert_eq!(second, ReconcileOutcome::Unchanged);

        let logs = store.rows(LOG_TAB).await;
        let data = log_rows(&logs);
        assert_eq!(data.len(), 3);
        assert_eq!(data[1][2], "UNCHANGED");
        assert_eq!(data[2][2], "UNCHANGED");
        assert_eq!(data[1][3], "-");
        assert_eq!(data[2][3], "-");
        // Identical after payloads on both no-op reconciliations.
        assert_eq!(data[1][5], data[2][5]);
    }

    #[tokio::test]
    async fn fresh_capture_timestamp_alone_is_not_drift() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        let mut first = record("sam99", "Lahore", "3");
        first.set(FieldKey::CapturedAt, "04-Aug-26 09:15 PM");
        assert_eq!(ctx.write_profile(&first).await, ReconcileOutcome::New);

        // Re-fetched minutes later with zero field drift.
        let mut second = record("sam99", "Lahore", "3");
        second.set(FieldKey::CapturedAt, "04-Aug-26 09:42 PM");
        assert_eq!(ctx.write_profile(&second).await, ReconcileOutcome::Unchanged);

        // No write happened, so the stored row keeps the original capture time.
        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles[1][FieldKey::CapturedAt.index()], "04-Aug-26 09:15 PM");
    }

    #[tokio::test]
    async fn duplicate_identities_in_one_run_are_last_write_wins() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        let first = ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let second = ctx.write_profile(&record("SAM99", "Karachi", "3")).await;
        assert_eq!(first, ReconcileOutcome::New);
        assert_eq!(
            second,
            ReconcileOutcome::Updated {
                changed: vec![FieldKey::Handle, FieldKey::City]
            }
        );

        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[1][FieldKey::City.index()], "Karachi");
        let entry = ctx.snapshot().locate("sam99").expect("indexed");
        assert_eq!(entry.values[FieldKey::City.index()], "Karachi");

        let logs = store.rows(LOG_TAB).await;
        let data = log_rows(&logs);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0][2], "NEW");
        assert_eq!(data[1][2], "UPDATED");
    }

    #[tokio::test]
    async fn missing_identity_is_a_hard_per_record_failure() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        let outcome = ctx.write_profile(&record("   ", "Lahore", "3")).await;
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                reason: "missing identity".to_string()
            }
        );

        // No profile row was written; the failure itself is audited.
        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles.len(), 1);
        let logs = store.rows(LOG_TAB).await;
        let data = log_rows(&logs);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][2], "FAILED");
        assert_eq!(data[0][3], "missing identity");
    }

    #[tokio::test]
    async fn non_empty_identity_never_fails_on_identity() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;
        let outcome = ctx.write_profile(&record("x9z", "", "")).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn link_fields_get_formula_cells_after_the_row_write() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        let mut rec = record("sam99", "Lahore", "3");
        rec.set(FieldKey::ProfileLink, "https://damadam.pk/users/sam99/");
        rec.set(FieldKey::Image, "https://cdn.example.net/avatar-imgs/sam99.jpg");
        ctx.write_profile(&rec).await;

        let profiles = store.rows(PROFILES_TAB).await;
        assert!(profiles[1][FieldKey::Image.index()].starts_with("=IMAGE("));
        assert!(profiles[1][FieldKey::ProfileLink.index()].starts_with("=HYPERLINK("));
        // The index keeps the rendered presentation values, not formulas.
        let entry = ctx.snapshot().locate("sam99").expect("indexed");
        assert_eq!(entry.values[FieldKey::ProfileLink.index()], "Profile");
        assert_eq!(entry.values[FieldKey::Image.index()], "");
    }

    #[tokio::test]
    async fn snapshot_load_skips_header_and_blank_identities() {
        let store = Arc::new(MemoryTable::new());
        store
            .seed(
                PROFILES_TAB,
                vec![
                    FieldKey::header_row(),
                    {
                        let mut row = vec![String::new(); FieldKey::COUNT];
                        row[FieldKey::Handle.index()] = "Sam99".to_string();
                        row
                    },
                    vec![String::new(); FieldKey::COUNT],
                    {
                        let mut row = vec![String::new(); FieldKey::COUNT];
                        row[FieldKey::Handle.index()] = "gul_khan".to_string();
                        row
                    },
                ],
            )
            .await;

        let dyn_store: Arc<dyn TableStore> = store.clone();
        let index = SnapshotIndex::load(dyn_store.as_ref()).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.locate("sam99").unwrap().row, 2);
        assert_eq!(index.locate("gul_khan").unwrap().row, 4);
        assert!(index.locate("").is_none());
    }

    #[tokio::test]
    async fn dashboard_header_drift_resets_the_rolling_view() {
        let store = Arc::new(MemoryTable::new());
        let ctx = test_context(&store).await;
        store
            .seed(
                DASHBOARD_TAB,
                vec![vec!["Old".to_string(), "Header".to_string()]],
            )
            .await;

        let counters = RunCounters {
            processed: 3,
            succeeded: 2,
            failed: 1,
            new: 1,
            updated: 1,
            unchanged: 0,
        };
        let metrics = ctx.record_run(&counters).await;
        assert_eq!(metrics.run_seq, 1);

        let rows = store.rows(DASHBOARD_TAB).await;
        assert_eq!(rows[0], DASHBOARD_HEADERS.map(String::from).to_vec());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "1");
        assert_eq!(rows[1][2], "3");

        // A clean header accumulates rows and the sequence keeps climbing.
        let metrics = ctx.record_run(&counters).await;
        assert_eq!(metrics.run_seq, 2);
        assert_eq!(store.rows(DASHBOARD_TAB).await.len(), 3);
    }

    #[tokio::test]
    async fn pending_targets_filter_caps_and_read_origin() {
        let store = Arc::new(MemoryTable::new());
        let ctx = test_context(&store).await;
        store
            .seed(
                TARGET_TAB,
                vec![
                    TARGET_HEADERS.map(String::from).to_vec(),
                    vec!["sam99".into(), "Pending".into(), String::new(), "Referral".into()],
                    vec!["done_user".into(), "✅ Completed".into()],
                    vec!["gul_khan".into(), "pending 🚨".into()],
                    vec![String::new(), "Pending".into()],
                    vec!["late_user".into(), "Pending".into()],
                ],
            )
            .await;

        let targets = ctx.pending_targets(0).await.unwrap();
        assert_eq!(
            targets,
            vec![
                SyncTarget {
                    handle: "sam99".into(),
                    status_row: 2,
                    origin: "Referral".into()
                },
                SyncTarget {
                    handle: "gul_khan".into(),
                    status_row: 4,
                    origin: "Manual".into()
                },
                SyncTarget {
                    handle: "late_user".into(),
                    status_row: 6,
                    origin: "Manual".into()
                },
            ]
        );

        let capped = ctx.pending_targets(2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn target_status_cells_are_written_in_place() {
        let store = Arc::new(MemoryTable::new());
        let ctx = test_context(&store).await;
        store
            .seed(
                TARGET_TAB,
                vec![
                    TARGET_HEADERS.map(String::from).to_vec(),
                    vec!["sam99".into(), "Pending".into(), String::new(), String::new()],
                ],
            )
            .await;

        ctx.update_target_status(2, "✅ Completed", "No data changes @ 09:30 PM")
            .await;
        let rows = store.rows(TARGET_TAB).await;
        assert_eq!(rows[1][1], "✅ Completed");
        assert_eq!(rows[1][2], "No data changes @ 09:30 PM");
        assert_eq!(rows[1][0], "sam99");
    }

    #[tokio::test]
    async fn tags_are_injected_from_the_tags_tab() {
        let store = Arc::new(MemoryTable::new());
        store
            .seed(
                TAGS_TAB,
                vec![
                    vec!["VIP".to_string(), "Watch".to_string()],
                    vec!["Sam99".to_string(), "sam99".to_string()],
                    vec![String::new(), "gul_khan".to_string()],
                ],
            )
            .await;
        let mut ctx = test_context(&store).await;

        ctx.write_profile(&record("sam99", "Lahore", "3")).await;
        let profiles = store.rows(PROFILES_TAB).await;
        assert_eq!(profiles[1][FieldKey::Tags.index()], "VIP, Watch");
    }

    #[tokio::test]
    async fn long_payloads_are_truncated_in_the_log() {
        let store = Arc::new(MemoryTable::new());
        let mut ctx = test_context(&store).await;

        let mut rec = record("sam99", "Lahore", "3");
        rec.set(FieldKey::Intro, "x".repeat(2000));
        ctx.write_profile(&rec).await;

        let logs = store.rows(LOG_TAB).await;
        let data = log_rows(&logs);
        assert_eq!(data[0][5].chars().count(), LOG_PAYLOAD_LIMIT);
    }

    #[test]
    fn classify_treats_missing_cells_as_empty() {
        let entry = SnapshotEntry {
            row: 2,
            values: vec![String::new(), "sam99".to_string()],
        };
        let mut row_values = vec![String::new(); FieldKey::COUNT];
        row_values[FieldKey::Handle.index()] = "sam99".to_string();
        let (outcome, plan) = classify(&row_values, Some(&entry));
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(plan.is_none());
    }

    #[test]
    fn completion_remarks_cap_the_changed_field_list() {
        let now = presentation_now();
        let outcome = ReconcileOutcome::Updated {
            changed: vec![
                FieldKey::Tags,
                FieldKey::Friend,
                FieldKey::City,
                FieldKey::Gender,
                FieldKey::Married,
                FieldKey::Age,
                FieldKey::Followers,
            ],
        };
        let remark = completion_remark(&outcome, now);
        assert!(remark.starts_with("Updated: TAGS, FRIEND, CITY, GENDER, MARRIED, …"));

        let housekeeping_only = ReconcileOutcome::Updated {
            changed: vec![FieldKey::CapturedAt, FieldKey::Source],
        };
        assert!(completion_remark(&housekeeping_only, now).starts_with("Updated (no key changes)"));

        assert!(completion_remark(&ReconcileOutcome::Unchanged, now)
            .starts_with("No data changes"));
        let failed = ReconcileOutcome::Failed {
            reason: "missing identity".to_string(),
        };
        assert!(completion_remark(&failed, now).starts_with("Error: missing identity"));
    }

    #[test]
    fn presentation_rows_derive_link_placeholders() {
        let mut rec = record("sam99", "Lahore", "3");
        rec.set(FieldKey::ProfileLink, "https://damadam.pk/users/sam99/");
        rec.set(FieldKey::LastPost, "https://damadam.pk/content/5/");
        rec.set(FieldKey::Image, "https://cdn.example.net/a.jpg");
        let row = presentation_row(&rec);
        assert_eq!(row[FieldKey::Image.index()], "");
        assert_eq!(row[FieldKey::ProfileLink.index()], "Profile");
        assert_eq!(row[FieldKey::LastPost.index()], "Post");
        assert_eq!(row[FieldKey::City.index()], "Lahore");

        let bare = record("sam99", "Lahore", "3");
        let row = presentation_row(&bare);
        assert_eq!(row[FieldKey::ProfileLink.index()], "");
        assert_eq!(row[FieldKey::LastPost.index()], "");
    }
}
