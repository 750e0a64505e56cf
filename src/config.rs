use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::queue::{QueueError, Result, DEFAULT_CHUNK_SIZE, DEFAULT_STORAGE_KEY};
use crate::utils::BackoffPolicy;

/// Upload queue settings, usually read from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大并发上传数
    pub max_concurrent: usize,
    /// 新任务的最大重试次数
    pub max_retries: u32,
    /// 分片大小
    pub chunk_size: u64,
    /// 重试退避基数（毫秒）
    pub backoff_base_ms: u64,
    /// 持久化 key
    pub storage_key: String,
    /// 状态文件目录
    pub state_dir: Option<PathBuf>,
    /// 模拟传输的单片延迟范围（毫秒）
    pub min_chunk_delay_ms: u64,
    pub max_chunk_delay_ms: u64,
    /// 模拟传输的失败概率
    pub failure_rate: f64,
    /// 事件广播缓冲区
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backoff_base_ms: 1000,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            state_dir: None,
            min_chunk_delay_ms: 200,
            max_chunk_delay_ms: 500,
            failure_rate: 0.0,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: QueueConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the queue can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(QueueError::InvalidConfig("max_concurrent must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(QueueError::InvalidConfig("chunk_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(QueueError::InvalidConfig(format!("failure_rate {} is outside 0..=1", self.failure_rate)));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::InvalidConfig("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_millis(self.backoff_base_ms))
    }

    pub fn chunk_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_chunk_delay_ms),
            Duration::from_millis(self.max_chunk_delay_ms),
        )
    }
}
