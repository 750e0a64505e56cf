mod errors;
mod listeners;
mod manager;
mod manager_worker;
mod worker;
pub mod store;
pub mod transport;
pub mod types;

pub use errors::{QueueError, Result};
pub use listeners::Subscription;
pub use manager::{UploadQueue, UploadQueueHandle};
pub use store::{JsonFileStore, MemoryStore, StorageAdapter, DEFAULT_STORAGE_KEY};
pub use transport::{Chunk, ChunkTransport, SimulatedTransport, DEFAULT_CHUNK_SIZE};
pub use types::{NewUpload, QueueEvent, QueueItem, QueueItemId, QueueItemStatus, QueueStats, UploadProgress};
