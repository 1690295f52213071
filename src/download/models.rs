//! Data structures for the download pipeline.
//!
//! This file contains the core data types shared between the registry, the
//! workers and the API layer: the book descriptor, the lifecycle status enum
//! and the queue projection returned to clients.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a book in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting in the priority queue
    Queued,
    /// Owned by a worker, transfer in progress
    Downloading,
    /// Downloaded and present in the ingest directory
    Available,
    /// All download attempts failed
    Error,
    /// Was available once, but the file has since left the ingest directory
    Done,
    /// Cancelled by the user, either while queued or mid-download
    Cancelled,
}

impl QueueStatus {
    /// Every status, in the order the status endpoint reports them.
    pub const ALL: [QueueStatus; 6] = [
        QueueStatus::Queued,
        QueueStatus::Downloading,
        QueueStatus::Available,
        QueueStatus::Error,
        QueueStatus::Done,
        QueueStatus::Cancelled,
    ];

    /// A terminal status ends the record's active life. Only a fresh `add`
    /// (or the sweeper's `available` → `done` demotion) moves it again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Available
                | QueueStatus::Error
                | QueueStatus::Done
                | QueueStatus::Cancelled
        )
    }

    /// Whether `add` may replace a record in this status. `available` stays
    /// pinned until the sweeper or `clear` deals with it.
    pub fn is_replaceable(self) -> bool {
        matches!(
            self,
            QueueStatus::Error | QueueStatus::Done | QueueStatus::Cancelled
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Available => write!(f, "available"),
            Self::Error => write!(f, "error"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Caller-supplied book descriptor plus the mutable fields the pipeline
/// maintains for it (progress, download path).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookInfo {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Human-readable declared size, e.g. `"5.2 MB"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Free-form metadata from the upstream search stage; opaque to the core
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, Vec<String>>,
    /// Candidate source URLs, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Percentage in [0, 100]; only meaningful while downloading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// One row of the queue-order projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOrderItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub priority: i32,
    pub inserted_at: DateTime<Utc>,
    pub status: QueueStatus,
}

/// Parses a human-readable size string like `"5.2 MB"` into bytes.
///
/// Accepts `B`/`KB`/`MB`/`GB` units and tolerates a comma as the decimal
/// separator. Returns 0 when the string cannot be parsed.
pub fn parse_size(size: &str) -> u64 {
    let normalized = size.trim().to_uppercase().replace(',', ".");
    let mut parts = normalized.split_whitespace();

    let value: f64 = match parts.next().and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => return 0,
    };

    let multiplier = match parts.next() {
        Some("KB") => 1024.0,
        Some("MB") => 1024.0 * 1024.0,
        Some("GB") => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    (value * multiplier) as u64
}

/// Strips everything outside `[A-Za-z0-9 ._-]` from a filename candidate and
/// trims surrounding whitespace.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}
