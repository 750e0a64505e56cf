use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;
use super::errors::Result;
use super::types::{QueueItem, QueueItemStatus};

/// 默认存储 key
pub const DEFAULT_STORAGE_KEY: &str = "filmcontract:upload_queue";

/// 存储适配器 - 用于保存和恢复整个队列
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// 读取持久化的队列，不存在时返回 None
    async fn load(&self) -> Result<Option<Vec<QueueItem>>>;

    /// 保存整个队列
    async fn save(&self, items: &[QueueItem]) -> Result<()>;
}

/// Parse a persisted queue, sending interrupted transfers back to `queued`.
///
/// Records that don't parse are dropped one by one; only a payload that is not
/// a JSON array fails as a whole.
pub fn decode_items(data: &str) -> Result<Vec<QueueItem>> {
    let records: Vec<serde_json::Value> = serde_json::from_str(data)?;

    let mut items = Vec::with_capacity(records.len());
    for record in records {
        match serde_json::from_value::<QueueItem>(record) {
            Ok(mut item) => {
                if item.status == QueueItemStatus::Uploading {
                    item.status = QueueItemStatus::Queued;
                }
                items.push(item);
            }
            Err(err) => warn!("store: skipping unreadable item: {}", err),
        }
    }

    Ok(items)
}

/// JSON file under `dir`, named after the storage key.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>, key: &str) -> Self {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        Self {
            path: dir.as_ref().join(format!("{}.json", file_name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageAdapter for JsonFileStore {
    async fn load(&self) -> Result<Option<Vec<QueueItem>>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let data = tokio::fs::read_to_string(&self.path).await?;
        decode_items(&data).map(Some)
    }

    async fn save(&self, items: &[QueueItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_string_pretty(items)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

/// In-process key/value storage. Clones share the same backing map, so a
/// second queue built over a clone sees what the first one saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    key: String,
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Raw stored value, as the queue wrote it.
    pub fn raw(&self) -> Option<String> {
        self.entries.lock().get(&self.key).cloned()
    }

    pub fn set_raw(&self, data: impl Into<String>) {
        self.entries.lock().insert(self.key.clone(), data.into());
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn load(&self) -> Result<Option<Vec<QueueItem>>> {
        match self.raw() {
            Some(data) => decode_items(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, items: &[QueueItem]) -> Result<()> {
        let data = serde_json::to_string(items)?;
        self.set_raw(data);
        Ok(())
    }
}
