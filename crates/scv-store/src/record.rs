//! Durable record types: stream metadata and per-lease statistics.

use chrono::{DateTime, Utc};
use scv_core::StreamStatus;
use serde::{Deserialize, Serialize};

/// Persisted metadata of one stream, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub target_id: String,
    #[serde(default)]
    pub status: StreamStatus,
    /// Committed frame count.
    #[serde(default)]
    pub frames: u64,
    /// Consecutive zero-frame checkpoints at the current frame version.
    #[serde(default)]
    pub checkpoints: u64,
    #[serde(default)]
    pub error_count: u32,
    /// Unix seconds.
    pub creation_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<DateTime<Utc>>,
}

impl StreamRecord {
    pub fn new(id: impl Into<String>, target_id: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            status: StreamStatus::Enabled,
            frames: 0,
            checkpoints: 0,
            error_count: 0,
            creation_date: created.timestamp(),
            last_user: None,
            last_engine: None,
            last_commit: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == StreamStatus::Enabled
    }

    /// Projection without the id, as served by the info endpoint.
    pub fn info(&self, active: bool) -> StreamInfo {
        StreamInfo {
            target_id: self.target_id.clone(),
            status: self.status,
            frames: self.frames,
            error_count: self.error_count,
            active,
            creation_date: self.creation_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub target_id: String,
    pub status: StreamStatus,
    pub frames: u64,
    pub error_count: u32,
    pub active: bool,
    pub creation_date: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Stopped,
    Failed,
    Disabled,
    Expired,
}

/// One row per released lease, appended to the stats log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseStats {
    pub stream_id: String,
    pub target_id: String,
    pub user: String,
    pub engine: String,
    /// Donor progress reported by the lease's checkpoints.
    pub frames: f64,
    pub start_time: i64,
    pub end_time: i64,
    pub outcome: LeaseOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
