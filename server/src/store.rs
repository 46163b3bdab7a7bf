//! On-disk status record.
//!
//! A single JSON object at `<data_dir>/status.json` holding what the running
//! bridge knows about itself: current tunnel URL, gateway id, connection
//! state and the last error. The `status` subcommand reads it from another
//! process, so every write replaces the file atomically (temp file + rename).
//!
//! Keys this version does not know about are kept across rewrites.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::warn;

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Connected,
    Disconnected,
    Failed,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serialized access to the status file.
///
/// Read-modify-write cycles go through one async mutex so concurrent event
/// handlers never lose each other's updates.
pub struct StatusStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATUS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record; `None` when nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<StatusRecord>, StoreError> {
        read_record(&self.path).await
    }

    /// Apply `f` to the stored record (or an empty one) and save the result.
    ///
    /// An unreadable record is logged and replaced.
    pub async fn update<F>(&self, f: F) -> Result<StatusRecord, StoreError>
    where
        F: FnOnce(&mut StatusRecord),
    {
        let _guard = self.lock.lock().await;
        let mut record = match read_record(&self.path).await {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!("Store: discarding unreadable {}: {e}", self.path.display());
                StatusRecord::default()
            }
        };
        f(&mut record);
        write_record(&self.path, &record).await?;
        Ok(record)
    }

    /// Delete the record. Returns whether a file was removed.
    pub async fn clear(&self) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

async fn read_record(path: &Path) -> Result<Option<StatusRecord>, StoreError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(StoreError::Parse)
}

async fn write_record(path: &Path, record: &StatusRecord) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StoreError::Io)?;
    }
    let json = serde_json::to_vec_pretty(record).map_err(StoreError::Parse)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(StoreError::Io)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StoreError::Io(e));
    }
    Ok(())
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "status file I/O error: {e}"),
            Self::Parse(e) => write!(f, "status file is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
