use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// 队列条目唯一标识
///
/// Opaque string. New ids are UUID v4, but any persisted string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct QueueItemId(String);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for QueueItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for QueueItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败（重试次数已用完）
    Failed,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueItemStatus::Queued => "queued",
            QueueItemStatus::Uploading => "uploading",
            QueueItemStatus::Paused => "paused",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Descriptor of a file handed to `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    pub uri: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub casting_id: u64,
    pub submission_id: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewUpload {
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        casting_id: u64,
    ) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            casting_id,
            submission_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_submission(mut self, submission_id: u64) -> Self {
        self.submission_id = Some(submission_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 队列条目，持久化时使用 camelCase 字段名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueItemId,
    /// 源文件 URI
    pub file_uri: String,
    /// 显示名称
    pub file_name: String,
    /// 文件大小
    pub file_size: u64,
    pub mime_type: String,
    /// 所属 casting call
    pub casting_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<u64>,
    /// 当前状态
    pub status: QueueItemStatus,
    /// 完成百分比 0-100
    pub progress: f64,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 重试次数
    pub retry_count: u32,
    pub max_retries: u32,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueueItem {
    pub(crate) fn new(upload: NewUpload, max_retries: u32) -> Self {
        Self {
            id: QueueItemId::new(),
            file_uri: upload.uri,
            file_name: upload.name,
            file_size: upload.size,
            mime_type: upload.mime_type,
            casting_id: upload.casting_id,
            submission_id: upload.submission_id,
            status: QueueItemStatus::Queued,
            progress: 0.0,
            uploaded_bytes: 0,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            completed_at: None,
            metadata: upload.metadata,
        }
    }

    /// Advance the byte offset, clamped to the declared size, and refresh `progress`.
    pub(crate) fn set_uploaded_bytes(&mut self, bytes: u64) {
        self.uploaded_bytes = bytes.min(self.file_size);
        self.progress = self.computed_progress();
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = QueueItemStatus::Completed;
        self.uploaded_bytes = self.file_size;
        self.progress = 100.0;
        self.completed_at = Some(Utc::now());
    }

    /// Forget any transfer state so the next run starts from byte zero.
    pub(crate) fn reset_transfer(&mut self) {
        self.completed_at = None;
        self.set_uploaded_bytes(0);
    }

    fn computed_progress(&self) -> f64 {
        if self.file_size == 0 {
            return if self.status == QueueItemStatus::Completed { 100.0 } else { 0.0 };
        }
        (self.uploaded_bytes as f64 / self.file_size as f64) * 100.0
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, QueueItemStatus::Queued | QueueItemStatus::Uploading)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.file_size.saturating_sub(self.uploaded_bytes)
    }
}

/// Aggregate view over the whole queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Unweighted mean of every item's progress
    pub overall_progress: f64,
}

impl QueueStats {
    pub fn from_items(items: &[QueueItem]) -> Self {
        let mut stats = QueueStats {
            total: items.len(),
            ..Default::default()
        };

        let mut progress_sum = 0.0;
        for item in items {
            match item.status {
                QueueItemStatus::Queued => stats.queued += 1,
                QueueItemStatus::Uploading => stats.uploading += 1,
                QueueItemStatus::Paused => stats.paused += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::Failed => stats.failed += 1,
            }
            stats.total_bytes += item.file_size;
            stats.uploaded_bytes += item.uploaded_bytes;
            progress_sum += item.progress;
        }

        if !items.is_empty() {
            stats.overall_progress = progress_sum / items.len() as f64;
        }

        stats
    }
}

#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub id: QueueItemId,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    /// 瞬时速度 (bytes/sec)
    pub speed: f64,
    /// 预计剩余时间
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// 任务已添加
    ItemAdded {
        id: QueueItemId,
    },

    /// 任务已移除
    ItemRemoved {
        id: QueueItemId,
    },

    /// 任务状态变更
    StateChanged {
        id: QueueItemId,
        old_state: QueueItemStatus,
        new_state: QueueItemStatus,
    },

    /// 进度更新
    Progress(UploadProgress),

    /// 重试次数用完，任务失败
    Failed {
        id: QueueItemId,
        error: String,
    },
}

pub type Listener = Arc<dyn Fn(&[QueueItem]) + Send + Sync>;

/// 队列命令
pub(crate) enum ManagerCommand {
    Enqueue {
        upload: NewUpload,
        reply: oneshot::Sender<QueueItemId>,
    },

    Remove {
        id: QueueItemId,
        reply: oneshot::Sender<()>,
    },

    Get {
        id: QueueItemId,
        reply: oneshot::Sender<Option<QueueItem>>,
    },

    GetAll {
        reply: oneshot::Sender<Vec<QueueItem>>,
    },

    GetByStatus {
        status: QueueItemStatus,
        reply: oneshot::Sender<Vec<QueueItem>>,
    },

    GetPending {
        reply: oneshot::Sender<Vec<QueueItem>>,
    },

    Stats {
        reply: oneshot::Sender<QueueStats>,
    },

    /// Replied once the scheduling run drains
    ProcessQueue {
        reply: oneshot::Sender<()>,
    },

    Pause {
        id: QueueItemId,
        reply: oneshot::Sender<()>,
    },

    Resume {
        id: QueueItemId,
        reply: oneshot::Sender<()>,
    },

    Retry {
        id: QueueItemId,
        reply: oneshot::Sender<()>,
    },

    PauseAll {
        reply: oneshot::Sender<()>,
    },

    ResumeAll {
        reply: oneshot::Sender<()>,
    },

    ClearCompleted {
        reply: oneshot::Sender<()>,
    },

    ClearAll {
        reply: oneshot::Sender<()>,
    },

    Subscribe {
        listener: Listener,
        reply: oneshot::Sender<u64>,
    },

    Shutdown,
}
