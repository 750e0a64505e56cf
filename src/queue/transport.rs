use std::time::Duration;
use async_trait::async_trait;
use rand::Rng;
use super::errors::{QueueError, Result};
use super::types::QueueItem;

/// 默认分片大小 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    /// Byte offset just past this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Chunks of a `file_size` file that are not yet covered by `uploaded_bytes`.
///
/// Resumption happens at chunk granularity: a partially covered chunk is sent again.
pub fn remaining_chunks(file_size: u64, uploaded_bytes: u64, chunk_size: u64) -> Vec<Chunk> {
    if chunk_size == 0 || uploaded_bytes >= file_size {
        return Vec::new();
    }

    let total_chunks = file_size.div_ceil(chunk_size);
    let start_chunk = uploaded_bytes / chunk_size;

    (start_chunk..total_chunks)
        .map(|index| {
            let offset = index * chunk_size;
            Chunk {
                index,
                offset,
                size: chunk_size.min(file_size - offset),
            }
        })
        .collect()
}

/// Moves one chunk of an item to wherever uploads go.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send_chunk(&self, item: &QueueItem, chunk: &Chunk) -> Result<()>;
}

/// Stand-in transport: sleeps a random delay per chunk and optionally fails.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    min_delay: Duration,
    max_delay: Duration,
    failure_rate: f64,
}

impl SimulatedTransport {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            failure_rate: 0.0,
        }
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_millis(500))
    }
}

#[async_trait]
impl ChunkTransport for SimulatedTransport {
    async fn send_chunk(&self, item: &QueueItem, chunk: &Chunk) -> Result<()> {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            let delay = if self.max_delay > self.min_delay {
                rng.gen_range(self.min_delay..=self.max_delay)
            } else {
                self.min_delay
            };
            (delay, rng.gen_bool(self.failure_rate))
        };

        tokio::time::sleep(delay).await;

        if fail {
            return Err(QueueError::transfer(format!(
                "simulated failure on chunk {} of {}",
                chunk.index, item.file_name
            )));
        }

        Ok(())
    }
}
