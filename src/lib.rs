pub mod config;
pub mod queue;
pub mod utils;

// 重新导出核心类型
pub use config::QueueConfig;
pub use queue::{
    Chunk,
    ChunkTransport,
    JsonFileStore,
    MemoryStore,
    NewUpload,
    QueueError,
    QueueEvent,
    QueueItem,
    QueueItemId,
    QueueItemStatus,
    QueueStats,
    Result,
    SimulatedTransport,
    StorageAdapter,
    Subscription,
    UploadProgress,
    UploadQueue,
    UploadQueueHandle,
};
