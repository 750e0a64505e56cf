use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::config::QueueConfig;
use crate::utils::{BackoffPolicy, BackoffTimers, SpeedCalculator};
use super::listeners::ListenerRegistry;
use super::store::StorageAdapter;
use super::transport::ChunkTransport;
use super::types::{
    ManagerCommand, NewUpload, QueueEvent, QueueItem, QueueItemId, QueueItemStatus, QueueStats,
    UploadProgress,
};
use super::worker::{TransferOutcome, UploadWorker, WorkerMessage};

/// A live transfer run for one item.
struct RunHandle {
    run_id: u64,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    speed: SpeedCalculator,
}

impl RunHandle {
    fn cancel(self) {
        self.cancellation_token.cancel();
    }
}

/// Owns the item list. Every mutation happens on this task.
pub(crate) struct UploadQueueWorker {
    config: QueueConfig,
    transport: Arc<dyn ChunkTransport>,
    store: Arc<dyn StorageAdapter>,
    items: Vec<QueueItem>,
    runs: HashMap<QueueItemId, RunHandle>,
    next_run_id: u64,
    /// 调度中（process_queue 尚未结束）
    processing: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
    /// 需要写入存储
    dirty: bool,
    backoff: BackoffPolicy,
    timers: BackoffTimers<QueueItemId>,
    listeners: Arc<ListenerRegistry>,
    event_tx: broadcast::Sender<QueueEvent>,
    report_tx: mpsc::UnboundedSender<WorkerMessage>,
    wake_tx: mpsc::UnboundedSender<(QueueItemId, u64)>,
}

impl UploadQueueWorker {
    pub(crate) async fn run(
        config: QueueConfig,
        transport: Arc<dyn ChunkTransport>,
        store: Arc<dyn StorageAdapter>,
        listeners: Arc<ListenerRegistry>,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<QueueEvent>,
    ) {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();

        let mut worker = Self {
            backoff: config.backoff(),
            config,
            transport,
            store,
            items: Vec::new(),
            runs: HashMap::new(),
            next_run_id: 0,
            processing: false,
            drain_waiters: Vec::new(),
            dirty: false,
            timers: BackoffTimers::new(),
            listeners,
            event_tx,
            report_tx,
            wake_tx,
        };

        // 恢复之前的状态
        worker.restore_state().await;

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown) | None => break,
                    Some(command) => worker.handle_command(command),
                },
                Some(message) = report_rx.recv() => {
                    worker.handle_report(message);
                }
                Some((id, seq)) = wake_rx.recv() => {
                    worker.handle_wake(id, seq);
                }
            }

            worker.schedule();

            if worker.dirty {
                worker.save_state().await;
            }
        }

        worker.shutdown().await;
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Enqueue { upload, reply } => {
                let id = self.enqueue(upload);
                let _ = reply.send(id);
            }
            ManagerCommand::Remove { id, reply } => {
                self.remove(&id);
                let _ = reply.send(());
            }
            ManagerCommand::Get { id, reply } => {
                let item = self.items.iter().find(|item| item.id == id).cloned();
                let _ = reply.send(item);
            }
            ManagerCommand::GetAll { reply } => {
                let _ = reply.send(self.items.clone());
            }
            ManagerCommand::GetByStatus { status, reply } => {
                let items = self.items
                    .iter()
                    .filter(|item| item.status == status)
                    .cloned()
                    .collect();
                let _ = reply.send(items);
            }
            ManagerCommand::GetPending { reply } => {
                let items = self.items
                    .iter()
                    .filter(|item| item.is_pending())
                    .cloned()
                    .collect();
                let _ = reply.send(items);
            }
            ManagerCommand::Stats { reply } => {
                let _ = reply.send(QueueStats::from_items(&self.items));
            }
            ManagerCommand::ProcessQueue { reply } => {
                self.processing = true;
                self.drain_waiters.push(reply);
            }
            ManagerCommand::Pause { id, reply } => {
                if self.pause(&id) {
                    self.notify_listeners();
                }
                let _ = reply.send(());
            }
            ManagerCommand::Resume { id, reply } => {
                if self.resume(&id) {
                    self.notify_listeners();
                }
                let _ = reply.send(());
            }
            ManagerCommand::Retry { id, reply } => {
                self.retry(&id);
                let _ = reply.send(());
            }
            ManagerCommand::PauseAll { reply } => {
                let uploading: Vec<QueueItemId> = self.ids_with_status(QueueItemStatus::Uploading);
                for id in uploading {
                    if self.pause(&id) {
                        self.notify_listeners();
                    }
                }
                let _ = reply.send(());
            }
            ManagerCommand::ResumeAll { reply } => {
                let paused: Vec<QueueItemId> = self.ids_with_status(QueueItemStatus::Paused);
                for id in paused {
                    if self.resume(&id) {
                        self.notify_listeners();
                    }
                }
                let _ = reply.send(());
            }
            ManagerCommand::ClearCompleted { reply } => {
                let completed = self.ids_with_status(QueueItemStatus::Completed);
                self.items.retain(|item| item.status != QueueItemStatus::Completed);
                for id in completed {
                    let _ = self.event_tx.send(QueueEvent::ItemRemoved { id });
                }
                self.dirty = true;
                self.notify_listeners();
                let _ = reply.send(());
            }
            ManagerCommand::ClearAll { reply } => {
                for (_, run) in self.runs.drain() {
                    run.cancel();
                }
                self.timers.cancel_all();
                for item in self.items.drain(..) {
                    let _ = self.event_tx.send(QueueEvent::ItemRemoved { id: item.id });
                }
                info!("queue: cleared");
                self.dirty = true;
                self.notify_listeners();
                let _ = reply.send(());
            }
            ManagerCommand::Subscribe { listener, reply } => {
                let id = self.listeners.register(listener, &self.items);
                let _ = reply.send(id);
            }
            // 在主循环中处理
            ManagerCommand::Shutdown => {}
        }
    }

    fn enqueue(&mut self, upload: NewUpload) -> QueueItemId {
        let item = QueueItem::new(upload, self.config.max_retries);
        let id = item.id.clone();
        info!("queue: added {} ({}, {} bytes)", id, item.file_name, item.file_size);

        self.items.push(item);
        let _ = self.event_tx.send(QueueEvent::ItemAdded { id: id.clone() });
        self.dirty = true;
        self.notify_listeners();
        id
    }

    fn remove(&mut self, id: &QueueItemId) {
        let Some(index) = self.index_of(id) else {
            return;
        };

        if let Some(run) = self.runs.remove(id) {
            run.cancel();
        }
        self.timers.cancel(id);
        let item = self.items.remove(index);
        info!("queue: removed {}", item.id);

        let _ = self.event_tx.send(QueueEvent::ItemRemoved { id: item.id });
        self.dirty = true;
        self.notify_listeners();
    }

    /// `uploading` or `queued` -> `paused`. Returns whether anything changed.
    fn pause(&mut self, id: &QueueItemId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };

        match self.items[index].status {
            QueueItemStatus::Uploading => {
                if let Some(run) = self.runs.remove(id) {
                    run.cancel();
                }
            }
            QueueItemStatus::Queued => {
                self.timers.cancel(id);
            }
            _ => return false,
        }

        self.set_status(index, QueueItemStatus::Paused);
        true
    }

    fn resume(&mut self, id: &QueueItemId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        if self.items[index].status != QueueItemStatus::Paused {
            return false;
        }

        self.set_status(index, QueueItemStatus::Queued);
        self.processing = true;
        true
    }

    fn retry(&mut self, id: &QueueItemId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        // 正在上传的任务不能重试
        if self.items[index].status == QueueItemStatus::Uploading {
            return;
        }

        self.timers.cancel(id);
        let item = &mut self.items[index];
        item.retry_count = 0;
        if item.status == QueueItemStatus::Completed {
            item.status = QueueItemStatus::Queued;
            item.reset_transfer();
            self.emit_state_change(id.clone(), QueueItemStatus::Completed, QueueItemStatus::Queued);
        } else {
            self.set_status(index, QueueItemStatus::Queued);
        }

        info!("queue: retry {}", id);
        self.processing = true;
        self.dirty = true;
        self.notify_listeners();
    }

    fn handle_report(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress { id, run_id, uploaded_bytes } => {
                self.handle_progress(id, run_id, uploaded_bytes);
            }
            WorkerMessage::Finished { id, run_id, outcome } => {
                self.handle_finished(id, run_id, outcome);
            }
        }
    }

    fn handle_progress(&mut self, id: QueueItemId, run_id: u64, uploaded_bytes: u64) {
        // 过期的运行（已暂停、移除或重试）不再更新进度
        let Some(run) = self.runs.get_mut(&id).filter(|run| run.run_id == run_id) else {
            return;
        };
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return;
        };
        if item.status != QueueItemStatus::Uploading {
            return;
        }

        item.set_uploaded_bytes(uploaded_bytes);
        run.speed.add_data_point(item.uploaded_bytes);

        let progress = UploadProgress {
            id: id.clone(),
            uploaded_bytes: item.uploaded_bytes,
            total_bytes: item.file_size,
            percentage: item.progress,
            speed: run.speed.calculate_speed(),
            eta: run.speed.estimate_eta(item.remaining_bytes()),
        };
        debug!("queue: {} at {:.1}%", id, progress.percentage);

        let _ = self.event_tx.send(QueueEvent::Progress(progress));
        self.notify_listeners();
    }

    fn handle_finished(&mut self, id: QueueItemId, run_id: u64, outcome: TransferOutcome) {
        if self.runs.get(&id).is_none_or(|run| run.run_id != run_id) {
            debug!("queue: ignoring stale run {} for {}", run_id, id);
            return;
        }
        self.runs.remove(&id);

        let Some(index) = self.index_of(&id) else {
            return;
        };

        match outcome {
            TransferOutcome::Completed => {
                self.items[index].mark_completed();
                info!("queue: completed {}", id);
                self.emit_state_change(id, QueueItemStatus::Uploading, QueueItemStatus::Completed);
                self.dirty = true;
            }
            TransferOutcome::Cancelled => {
                self.set_status(index, QueueItemStatus::Queued);
            }
            TransferOutcome::Failed(error) => {
                let item = &mut self.items[index];
                if item.retry_count < item.max_retries {
                    let delay = self.backoff.get_delay(item.retry_count);
                    item.retry_count += 1;
                    warn!(
                        "queue: {} failed ({}), retry {}/{} in {:?}",
                        id, error, item.retry_count, item.max_retries, delay
                    );
                    self.timers.schedule(id, delay, self.wake_tx.clone());
                    self.set_status(index, QueueItemStatus::Queued);
                } else {
                    warn!("queue: {} failed permanently: {}", id, error);
                    self.set_status(index, QueueItemStatus::Failed);
                    let _ = self.event_tx.send(QueueEvent::Failed { id, error });
                }
            }
        }

        self.notify_listeners();
    }

    /// A backoff timer elapsed: drain the queue again.
    fn handle_wake(&mut self, id: QueueItemId, seq: u64) {
        if !self.timers.fired(&id, seq) {
            debug!("queue: ignoring stale backoff #{} for {}", seq, id);
            return;
        }
        debug!("queue: backoff over for {}", id);
        self.processing = true;
    }

    /// Start queued items while there is capacity, then settle `process_queue` callers.
    fn schedule(&mut self) {
        if self.processing {
            while self.runs.len() < self.config.max_concurrent {
                let next = self.items.iter().position(|item| {
                    item.status == QueueItemStatus::Queued && !self.timers.is_pending(&item.id)
                });

                match next {
                    Some(index) => self.start_upload(index),
                    None => break,
                }
            }

            if self.runs.is_empty() && !self.items.iter().any(QueueItem::is_pending) {
                debug!("queue: drained");
                self.processing = false;
            }
        }

        if !self.processing {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn start_upload(&mut self, index: usize) {
        let run_id = self.next_run_id;
        self.next_run_id += 1;

        self.set_status(index, QueueItemStatus::Uploading);
        let item = self.items[index].clone();
        let id = item.id.clone();
        info!("queue: uploading {} from byte {}", id, item.uploaded_bytes);

        let cancellation_token = CancellationToken::new();
        let worker = UploadWorker {
            run_id,
            transport: self.transport.clone(),
            cancellation_token: cancellation_token.clone(),
            chunk_size: self.config.chunk_size,
            report_tx: self.report_tx.clone(),
        };

        let mut speed = SpeedCalculator::new(Duration::from_secs(5));
        speed.add_data_point(item.uploaded_bytes);

        let join_handle = tokio::spawn(worker.run(item));
        self.runs.insert(id, RunHandle {
            run_id,
            cancellation_token,
            join_handle,
            speed,
        });

        self.notify_listeners();
    }

    fn set_status(&mut self, index: usize, new_state: QueueItemStatus) {
        let item = &mut self.items[index];
        let old_state = item.status;
        if old_state == new_state {
            return;
        }

        item.status = new_state;
        let id = item.id.clone();
        debug!("queue: {} {} -> {}", id, old_state, new_state);

        self.emit_state_change(id, old_state, new_state);
        self.dirty = true;
    }

    fn emit_state_change(&self, id: QueueItemId, old_state: QueueItemStatus, new_state: QueueItemStatus) {
        let _ = self.event_tx.send(QueueEvent::StateChanged {
            id,
            old_state,
            new_state,
        });
    }

    fn notify_listeners(&self) {
        self.listeners.notify(&self.items);
    }

    fn index_of(&self, id: &QueueItemId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }

    fn ids_with_status(&self, status: QueueItemStatus) -> Vec<QueueItemId> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .map(|item| item.id.clone())
            .collect()
    }

    /// Save the whole list
    async fn save_state(&mut self) {
        if let Err(err) = self.store.save(&self.items).await {
            warn!("queue: failed to save state: {}", err);
        }
        self.dirty = false;
    }

    /// Restore the list persisted by a previous run
    async fn restore_state(&mut self) {
        match self.store.load().await {
            Ok(Some(items)) => {
                info!("queue: restored {} items", items.len());
                self.items = items;
            }
            Ok(None) => {}
            Err(err) => warn!("queue: failed to restore state: {}", err),
        }
    }

    async fn shutdown(&mut self) {
        self.timers.cancel_all();
        let runs: Vec<RunHandle> = self.runs.drain().map(|(_, run)| run).collect();
        for run in runs {
            run.cancellation_token.cancel();
            if let Err(err) = run.join_handle.await {
                warn!("queue: upload task ended abnormally: {}", err);
            }
        }
        self.save_state().await;
        info!("queue: shut down");
    }
}
