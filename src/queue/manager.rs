use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::config::QueueConfig;
use super::errors::{QueueError, Result};
use super::listeners::{ListenerRegistry, Subscription};
use super::manager_worker::UploadQueueWorker;
use super::store::{JsonFileStore, MemoryStore, StorageAdapter};
use super::transport::{ChunkTransport, SimulatedTransport};
use super::types::{
    ManagerCommand, NewUpload, QueueEvent, QueueItem, QueueItemId, QueueItemStatus, QueueStats,
};

/// Cloneable handle to an upload queue service.
#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
    listeners: Arc<ListenerRegistry>,
}

/// 队列句柄 - 包含队列和后台任务
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// Stop the service: cancel in-flight transfers and persist the list one last time.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.queue.command_tx.send(ManagerCommand::Shutdown).await;
        drop(self.queue);
        self.worker_handle.await
            .map_err(|err| QueueError::internal(format!("Worker panic: {}", err)))
    }
}

impl UploadQueue {
    /// Spawn the service. The persisted list is restored before any command runs.
    ///
    /// Fails with `InvalidConfig` before spawning anything if `config` is out of range.
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn ChunkTransport>,
        store: Arc<dyn StorageAdapter>,
    ) -> Result<UploadQueueHandle> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let listeners = ListenerRegistry::new();

        let worker_handle = tokio::spawn(UploadQueueWorker::run(
            config,
            transport,
            store,
            listeners.clone(),
            command_rx,
            event_tx.clone(),
        ));

        let queue = Self {
            command_tx,
            event_tx,
            listeners,
        };

        Ok(UploadQueueHandle {
            queue,
            worker_handle,
        })
    }

    /// Simulated transport, stored under `state_dir` when set or in memory otherwise.
    pub fn from_config(config: QueueConfig) -> Result<UploadQueueHandle> {
        let (min_delay, max_delay) = config.chunk_delay();
        let transport = SimulatedTransport::new(min_delay, max_delay)
            .with_failure_rate(config.failure_rate);

        let store: Arc<dyn StorageAdapter> = match &config.state_dir {
            Some(dir) => Arc::new(JsonFileStore::new(dir, &config.storage_key)),
            None => Arc::new(MemoryStore::new(config.storage_key.clone())),
        };

        Self::new(config, Arc::new(transport), store)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::ManagerShutdown)?;

        reply_rx.await.map_err(|_| QueueError::ManagerShutdown)
    }

    /// Add a file to the end of the queue. It is not started until the queue is processed.
    pub async fn enqueue(&self, upload: NewUpload) -> Result<QueueItemId> {
        self.request(|reply| ManagerCommand::Enqueue { upload, reply }).await
    }

    /// Remove an item whatever its state; an in-flight transfer is cancelled.
    pub async fn remove(&self, id: &QueueItemId) -> Result<()> {
        self.request(|reply| ManagerCommand::Remove { id: id.clone(), reply }).await
    }

    pub async fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        self.request(|reply| ManagerCommand::Get { id: id.clone(), reply }).await
    }

    pub async fn get_all(&self) -> Result<Vec<QueueItem>> {
        self.request(|reply| ManagerCommand::GetAll { reply }).await
    }

    pub async fn get_by_status(&self, status: QueueItemStatus) -> Result<Vec<QueueItem>> {
        self.request(|reply| ManagerCommand::GetByStatus { status, reply }).await
    }

    /// Items that are queued or uploading
    pub async fn get_pending(&self) -> Result<Vec<QueueItem>> {
        self.request(|reply| ManagerCommand::GetPending { reply }).await
    }

    pub async fn get_completed(&self) -> Result<Vec<QueueItem>> {
        self.get_by_status(QueueItemStatus::Completed).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| ManagerCommand::Stats { reply }).await
    }

    /// Run queued items, at most `max_concurrent` at a time, until nothing is
    /// queued or uploading. Joins the current run if one is active.
    pub async fn process_queue(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::ProcessQueue { reply }).await
    }

    pub async fn pause(&self, id: &QueueItemId) -> Result<()> {
        self.request(|reply| ManagerCommand::Pause { id: id.clone(), reply }).await
    }

    pub async fn resume(&self, id: &QueueItemId) -> Result<()> {
        self.request(|reply| ManagerCommand::Resume { id: id.clone(), reply }).await
    }

    /// Reset the retry count and queue the item again.
    pub async fn retry(&self, id: &QueueItemId) -> Result<()> {
        self.request(|reply| ManagerCommand::Retry { id: id.clone(), reply }).await
    }

    pub async fn pause_all(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::ResumeAll { reply }).await
    }

    pub async fn clear_completed(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::ClearCompleted { reply }).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::ClearAll { reply }).await
    }

    /// 订阅完整列表
    ///
    /// 注意：
    /// - 订阅时立即以当前列表调用一次
    /// - 回调在队列任务上同步执行，不能阻塞
    /// - 丢弃返回的 `Subscription` 即取消订阅
    pub async fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&[QueueItem]) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let id = self.request(|reply| ManagerCommand::Subscribe { listener, reply }).await?;
        Ok(Subscription::new(id, self.listeners.clone()))
    }

    /// 订阅事件
    ///
    /// 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }
}
