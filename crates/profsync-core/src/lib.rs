//! Core domain model for Profile Snapshot Sync.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CRATE_NAME: &str = "profsync-core";

/// Every presented timestamp uses this fixed offset (UTC+5).
pub const PRESENTATION_OFFSET_HOURS: i32 = 5;

/// Calendar dates as written into the table, e.g. `04-Aug-26`.
pub const DATE_FORMAT: &str = "%d-%b-%y";
/// Timestamps as written into the table, e.g. `04-Aug-26 09:15 PM`.
pub const DATETIME_FORMAT: &str = "%d-%b-%y %I:%M %p";

pub fn presentation_offset() -> FixedOffset {
    FixedOffset::east_opt(PRESENTATION_OFFSET_HOURS * 3600).expect("static offset is in range")
}

/// Current wall-clock time in the presentation timezone.
pub fn presentation_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&presentation_offset())
}

/// The declared profile columns, in table order. The discriminant doubles as
/// the zero-based column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldKey {
    Image,
    Handle,
    Tags,
    LastPost,
    LastPostTime,
    Friend,
    City,
    Gender,
    Married,
    Age,
    Joined,
    Followers,
    Status,
    Posts,
    ProfileLink,
    Intro,
    Source,
    CapturedAt,
}

impl FieldKey {
    pub const ALL: [FieldKey; 18] = [
        FieldKey::Image,
        FieldKey::Handle,
        FieldKey::Tags,
        FieldKey::LastPost,
        FieldKey::LastPostTime,
        FieldKey::Friend,
        FieldKey::City,
        FieldKey::Gender,
        FieldKey::Married,
        FieldKey::Age,
        FieldKey::Joined,
        FieldKey::Followers,
        FieldKey::Status,
        FieldKey::Posts,
        FieldKey::ProfileLink,
        FieldKey::Intro,
        FieldKey::Source,
        FieldKey::CapturedAt,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column title in the persisted header row.
    pub fn header(self) -> &'static str {
        match self {
            FieldKey::Image => "IMAGE",
            FieldKey::Handle => "NICK NAME",
            FieldKey::Tags => "TAGS",
            FieldKey::LastPost => "LAST POST",
            FieldKey::LastPostTime => "LAST POST TIME",
            FieldKey::Friend => "FRIEND",
            FieldKey::City => "CITY",
            FieldKey::Gender => "GENDER",
            FieldKey::Married => "MARRIED",
            FieldKey::Age => "AGE",
            FieldKey::Joined => "JOINED",
            FieldKey::Followers => "FOLLOWERS",
            FieldKey::Status => "STATUS",
            FieldKey::Posts => "POSTS",
            FieldKey::ProfileLink => "PROFILE LINK",
            FieldKey::Intro => "INTRO",
            FieldKey::Source => "SOURCE",
            FieldKey::CapturedAt => "DATETIME SCRAP",
        }
    }

    pub fn from_header(name: &str) -> Option<FieldKey> {
        Self::ALL.into_iter().find(|key| key.header() == name)
    }

    pub fn header_row() -> Vec<String> {
        Self::ALL.iter().map(|key| key.header().to_string()).collect()
    }

    /// Columns whose cell holds a derived formula rather than the raw value.
    pub fn is_link_bearing(self) -> bool {
        matches!(
            self,
            FieldKey::Image | FieldKey::LastPost | FieldKey::ProfileLink
        )
    }

    /// Columns left out of human-facing change summaries: housekeeping values
    /// that churn on every capture or carry derived presentation only.
    pub fn excluded_from_summary(self) -> bool {
        matches!(
            self,
            FieldKey::Image
                | FieldKey::LastPost
                | FieldKey::Joined
                | FieldKey::ProfileLink
                | FieldKey::Source
                | FieldKey::CapturedAt
        )
    }
}

/// One subject's current attributes, one value per declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    values: Vec<String>,
}

impl Default for ProfileRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRecord {
    pub fn new() -> Self {
        Self {
            values: vec![String::new(); FieldKey::COUNT],
        }
    }

    pub fn get(&self, key: FieldKey) -> &str {
        &self.values[key.index()]
    }

    pub fn set(&mut self, key: FieldKey, value: impl Into<String>) {
        self.values[key.index()] = value.into();
    }

    pub fn handle(&self) -> &str {
        self.get(FieldKey::Handle)
    }

    /// Normalized identity key: trimmed, lowercased handle. Empty means the
    /// record cannot be reconciled.
    pub fn handle_key(&self) -> String {
        self.handle().trim().to_lowercase()
    }

    pub fn to_field_map(&self) -> BTreeMap<&'static str, &str> {
        FieldKey::ALL
            .iter()
            .map(|key| (key.header(), self.get(*key)))
            .collect()
    }
}

/// Log label for a reconciliation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
    Failed,
}

impl ChangeKind {
    pub fn label(self) -> &'static str {
        match self {
            ChangeKind::New => "NEW",
            ChangeKind::Updated => "UPDATED",
            ChangeKind::Unchanged => "UNCHANGED",
            ChangeKind::Failed => "FAILED",
        }
    }
}

/// Produced exactly once per processed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    New,
    Updated { changed: Vec<FieldKey> },
    Unchanged,
    Failed { reason: String },
}

impl ReconcileOutcome {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ReconcileOutcome::New => ChangeKind::New,
            ReconcileOutcome::Updated { .. } => ChangeKind::Updated,
            ReconcileOutcome::Unchanged => ChangeKind::Unchanged,
            ReconcileOutcome::Failed { .. } => ChangeKind::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ReconcileOutcome::Failed { .. })
    }
}

/// Append-only audit record; the sink serializes before/after payloads and
/// bounds their length before this entry is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub handle: String,
    pub kind: ChangeKind,
    pub changed_fields: Vec<FieldKey>,
    pub before: Option<String>,
    pub after: String,
}

/// Per-run aggregate counters, one dashboard row per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_seq: u32,
    pub finished_at: DateTime<FixedOffset>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl RunMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64 * 100.0
        }
    }
}

/// Which identity source feeds the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Full sweep of currently-online users.
    Online,
    /// Drain of the pending rows in the target queue.
    Targets,
}

impl RunMode {
    pub fn origin_label(self) -> &'static str {
        match self {
            RunMode::Online => "Online",
            RunMode::Targets => "Target",
        }
    }
}
