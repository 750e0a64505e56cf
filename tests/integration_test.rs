use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use upload_queue::{
    Chunk, ChunkTransport, JsonFileStore, MemoryStore, NewUpload, QueueConfig, QueueError,
    QueueEvent, QueueItem, QueueItemId, QueueItemStatus, StorageAdapter, UploadQueue, UploadQueueHandle,
};

const MIB: u64 = 1024 * 1024;

/// 模拟传输 - 用于测试
struct MockTransport {
    delay: Duration,
    /// 前 n 次分片请求失败
    fail_first: AtomicU32,
    always_fail: AtomicBool,
    attempts: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_first: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn failing_first(delay: Duration, failures: u32) -> Arc<Self> {
        let transport = Self::new(delay);
        transport.fail_first.store(failures, Ordering::SeqCst);
        transport
    }

    fn always_failing(delay: Duration) -> Arc<Self> {
        let transport = Self::new(delay);
        transport.always_fail.store(true, Ordering::SeqCst);
        transport
    }
}

#[async_trait::async_trait]
impl ChunkTransport for MockTransport {
    async fn send_chunk(&self, item: &QueueItem, chunk: &Chunk) -> upload_queue::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(QueueError::transfer(format!("{} chunk {} refused", item.file_name, chunk.index)));
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::transfer("connection reset"));
        }

        Ok(())
    }
}

fn tape(name: &str, size: u64) -> NewUpload {
    NewUpload::new(format!("file:///tapes/{}", name), name, size, "video/mp4", 42)
}

fn start(transport: Arc<MockTransport>, store: Arc<dyn StorageAdapter>) -> UploadQueueHandle {
    UploadQueue::new(QueueConfig::default(), transport, store).unwrap()
}

fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(upload_queue::queue::DEFAULT_STORAGE_KEY))
}

#[tokio::test(start_paused = true)]
async fn test_twelve_mib_file_completes() {
    let transport = MockTransport::new(Duration::from_millis(300));
    let handle = start(transport.clone(), memory_store());
    let queue = handle.queue.clone();

    let id = queue.enqueue(tape("scene-4.mp4", 12 * MIB)).await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, QueueItemStatus::Queued);

    queue.process_queue().await.unwrap();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.progress, 100.0);
    assert_eq!(item.uploaded_bytes, 12_582_912);
    assert!(item.completed_at.unwrap() >= item.created_at);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_does_not_start_transfers() {
    let transport = MockTransport::new(Duration::from_millis(10));
    let handle = start(transport.clone(), memory_store());
    let queue = handle.queue.clone();

    queue.enqueue(tape("a.mp4", MIB)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(queue.get_pending().await.unwrap().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let transport = MockTransport::new(Duration::from_millis(200));
    let handle = start(transport.clone(), memory_store());
    let queue = handle.queue.clone();

    let max_uploading = Arc::new(AtomicUsize::new(0));
    let observed = max_uploading.clone();
    let _subscription = queue
        .subscribe(move |items: &[QueueItem]| {
            let uploading = items.iter().filter(|i| i.status == QueueItemStatus::Uploading).count();
            observed.fetch_max(uploading, Ordering::SeqCst);
        })
        .await
        .unwrap();

    for i in 0..5 {
        queue.enqueue(tape(&format!("take-{}.mp4", i), 11 * MIB)).await.unwrap();
    }
    queue.process_queue().await.unwrap();

    assert_eq!(max_uploading.load(Ordering::SeqCst), 2);
    assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(queue.get_completed().await.unwrap().len(), 5);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_progress_stays_in_bounds() {
    let transport = MockTransport::new(Duration::from_millis(50));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    let violations = Arc::new(Mutex::new(Vec::new()));
    let sink = violations.clone();
    let _subscription = queue
        .subscribe(move |items: &[QueueItem]| {
            for item in items {
                if !(0.0..=100.0).contains(&item.progress) || item.uploaded_bytes > item.file_size {
                    sink.lock().push(format!("{} out of bounds", item.file_name));
                }
                if item.status == QueueItemStatus::Completed
                    && (item.uploaded_bytes != item.file_size || item.completed_at.is_none())
                {
                    sink.lock().push(format!("{} completed early", item.file_name));
                }
                if item.status != QueueItemStatus::Completed && item.completed_at.is_some() {
                    sink.lock().push(format!("{} has stray completion time", item.file_name));
                }
            }
        })
        .await
        .unwrap();

    queue.enqueue(tape("long.mp4", 23 * MIB)).await.unwrap();
    queue.enqueue(tape("empty.mp4", 0)).await.unwrap();
    queue.enqueue(tape("short.mp4", 1)).await.unwrap();
    queue.process_queue().await.unwrap();

    assert!(violations.lock().is_empty(), "{:?}", violations.lock());
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.overall_progress, 100.0);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume() {
    let transport = MockTransport::new(Duration::from_millis(100));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    let id = queue.enqueue(tape("monologue.mp4", 20 * MIB)).await.unwrap();

    let runner = tokio::spawn({
        let queue = queue.clone();
        async move { queue.process_queue().await }
    });

    // 第一个分片完成后暂停
    tokio::time::sleep(Duration::from_millis(150)).await;
    queue.pause(&id).await.unwrap();

    let paused = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(paused.status, QueueItemStatus::Paused);
    assert_eq!(paused.uploaded_bytes, 5 * MIB);

    // 暂停的任务不会让 process_queue 挂起
    runner.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let still_paused = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(still_paused.status, QueueItemStatus::Paused);
    assert_eq!(still_paused.uploaded_bytes, 5 * MIB);

    queue.resume(&id).await.unwrap();
    queue.process_queue().await.unwrap();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.uploaded_bytes, 20 * MIB);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_all_and_resume_all() {
    let transport = MockTransport::new(Duration::from_millis(100));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    for i in 0..2 {
        queue.enqueue(tape(&format!("clip-{}.mp4", i), 15 * MIB)).await.unwrap();
    }

    let runner = tokio::spawn({
        let queue = queue.clone();
        async move { queue.process_queue().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    queue.pause_all().await.unwrap();
    runner.await.unwrap().unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.paused, 2);
    assert_eq!(stats.uploading, 0);

    queue.resume_all().await.unwrap();
    queue.process_queue().await.unwrap();

    assert_eq!(queue.get_completed().await.unwrap().len(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_then_manual_retry() {
    let transport = MockTransport::always_failing(Duration::from_millis(10));
    let handle = start(transport.clone(), memory_store());
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(tape("callback.mp4", 3 * MIB)).await.unwrap();

    let started = tokio::time::Instant::now();
    queue.process_queue().await.unwrap();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert!(item.completed_at.is_none());
    // 一次原始尝试 + 三次重试
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    // 退避 1s + 2s + 4s
    assert!(started.elapsed() >= Duration::from_secs(7));

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Failed { id: failed, error } = event {
            assert_eq!(failed, id);
            assert!(error.contains("refused"));
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    transport.always_fail.store(false, Ordering::SeqCst);
    queue.retry(&id).await.unwrap();
    let revived = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(revived.retry_count, 0);
    assert_ne!(revived.status, QueueItemStatus::Failed);

    queue.process_queue().await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, QueueItemStatus::Completed);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover() {
    let transport = MockTransport::failing_first(Duration::from_millis(10), 2);
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    let id = queue.enqueue(tape("reading.mp4", 7 * MIB)).await.unwrap();
    queue.process_queue().await.unwrap();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.retry_count, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_clear_completed_keeps_others() {
    let transport = MockTransport::new(Duration::from_millis(10));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    let done = queue.enqueue(tape("done.mp4", MIB)).await.unwrap();
    queue.process_queue().await.unwrap();

    let waiting = queue.enqueue(tape("waiting.mp4", MIB)).await.unwrap();
    let held = queue.enqueue(tape("held.mp4", MIB)).await.unwrap();
    queue.pause(&held).await.unwrap();

    queue.clear_completed().await.unwrap();

    let remaining = queue.get_all().await.unwrap();
    let ids: Vec<_> = remaining.iter().map(|i| i.id.clone()).collect();
    assert_eq!(ids, vec![waiting, held]);
    assert!(queue.get(&done).await.unwrap().is_none());
    assert_eq!(queue.get_by_status(QueueItemStatus::Paused).await.unwrap().len(), 1);

    queue.clear_all().await.unwrap();
    assert!(queue.get_all().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remove_cancels_transfer_and_ignores_unknown_ids() {
    let transport = MockTransport::new(Duration::from_millis(100));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    let id = queue.enqueue(tape("cut.mp4", 30 * MIB)).await.unwrap();
    let runner = tokio::spawn({
        let queue = queue.clone();
        async move { queue.process_queue().await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    queue.remove(&id).await.unwrap();
    runner.await.unwrap().unwrap();
    assert!(queue.get_all().await.unwrap().is_empty());

    // 未知 id 静默忽略
    queue.remove(&id).await.unwrap();
    queue.pause(&id).await.unwrap();
    queue.resume(&id).await.unwrap();
    queue.retry(&id).await.unwrap();
    assert!(queue.get_all().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_replays_and_unsubscribes() {
    let transport = MockTransport::new(Duration::from_millis(10));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();

    queue.enqueue(tape("first.mp4", MIB)).await.unwrap();

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    let subscription = queue
        .subscribe(move |items: &[QueueItem]| sink.lock().push(items.len()))
        .await
        .unwrap();
    assert_eq!(*snapshots.lock(), vec![1]);

    queue.enqueue(tape("second.mp4", MIB)).await.unwrap();
    assert_eq!(*snapshots.lock(), vec![1, 2]);

    // 查询不会触发通知
    queue.get_all().await.unwrap();
    queue.stats().await.unwrap();
    assert_eq!(snapshots.lock().len(), 2);

    subscription.unsubscribe();
    queue.enqueue(tape("third.mp4", MIB)).await.unwrap();
    assert_eq!(*snapshots.lock(), vec![1, 2]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_event_stream() {
    let transport = MockTransport::new(Duration::from_millis(10));
    let handle = start(transport, memory_store());
    let queue = handle.queue.clone();
    let mut events = queue.subscribe_events();

    let id = queue.enqueue(tape("slate.mp4", 6 * MIB)).await.unwrap();
    queue.process_queue().await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(matches!(&received[0], QueueEvent::ItemAdded { id: added } if *added == id));
    assert!(received.iter().any(|e| matches!(
        e,
        QueueEvent::StateChanged { old_state: QueueItemStatus::Queued, new_state: QueueItemStatus::Uploading, .. }
    )));
    let progress: Vec<f64> = received
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Progress(progress) => Some(progress.percentage),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[1], 100.0);
    assert!(matches!(
        received.last(),
        Some(QueueEvent::StateChanged { new_state: QueueItemStatus::Completed, .. })
    ));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reload_resets_uploading_items() {
    let store = memory_store();

    let handle = start(MockTransport::new(Duration::from_millis(10)), store.clone());
    let id = handle.queue.enqueue(tape("interrupted.mp4", 9 * MIB)).await.unwrap();
    let mut persisted = handle.queue.get(&id).await.unwrap().unwrap();
    handle.shutdown().await.unwrap();

    // 模拟上次进程在上传途中退出
    persisted.status = QueueItemStatus::Uploading;
    persisted.uploaded_bytes = 5 * MIB;
    store.set_raw(serde_json::to_string(&vec![persisted]).unwrap());

    let handle = start(MockTransport::new(Duration::from_millis(10)), store.clone());
    let queue = handle.queue.clone();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Queued);
    assert_eq!(item.uploaded_bytes, 5 * MIB);

    queue.process_queue().await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, QueueItemStatus::Completed);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restore_accepts_any_string_id() {
    let store = memory_store();

    let handle = start(MockTransport::new(Duration::from_millis(10)), store.clone());
    let first = handle.queue.enqueue(tape("legacy.mp4", MIB)).await.unwrap();
    let second = handle.queue.enqueue(tape("current.mp4", MIB)).await.unwrap();
    let mut legacy = handle.queue.get(&first).await.unwrap().unwrap();
    let current = handle.queue.get(&second).await.unwrap().unwrap();
    handle.shutdown().await.unwrap();

    // 旧版本生成的 id 不是 UUID
    let mut record = serde_json::to_value(&legacy).unwrap();
    record["id"] = "upload_1700000000000_ab12".into();
    store.set_raw(serde_json::to_string(&vec![record, serde_json::to_value(&current).unwrap()]).unwrap());
    legacy.id = QueueItemId::from("upload_1700000000000_ab12");

    let handle = start(MockTransport::new(Duration::from_millis(10)), store.clone());
    let queue = handle.queue.clone();

    let restored = queue.get_all().await.unwrap();
    assert_eq!(restored, vec![legacy.clone(), current.clone()]);

    queue.enqueue(tape("new.mp4", MIB)).await.unwrap();
    queue.process_queue().await.unwrap();
    handle.shutdown().await.unwrap();

    let saved: Vec<QueueItem> = serde_json::from_str(&store.raw().unwrap()).unwrap();
    assert_eq!(saved.len(), 3);
    assert_eq!(saved[0].id, legacy.id);
    assert!(saved.iter().all(|item| item.status == QueueItemStatus::Completed));
}

#[tokio::test]
async fn test_out_of_range_config_is_rejected() {
    let zero_slots = QueueConfig {
        max_concurrent: 0,
        ..Default::default()
    };
    let result = UploadQueue::new(zero_slots.clone(), MockTransport::new(Duration::ZERO), memory_store());
    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    assert!(matches!(UploadQueue::from_config(zero_slots), Err(QueueError::InvalidConfig(_))));

    let zero_chunks = QueueConfig {
        chunk_size: 0,
        ..Default::default()
    };
    assert!(UploadQueue::from_config(zero_chunks).is_err());

    let bad_rate = QueueConfig {
        failure_rate: f64::NAN,
        ..Default::default()
    };
    assert!(UploadQueue::from_config(bad_rate).is_err());
}

#[tokio::test]
async fn test_json_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        state_dir: Some(dir.path().to_path_buf()),
        min_chunk_delay_ms: 1,
        max_chunk_delay_ms: 2,
        ..Default::default()
    };

    let handle = UploadQueue::from_config(config.clone()).unwrap();
    let queue = handle.queue.clone();
    let id = queue.enqueue(tape("persisted.mp4", 2 * MIB).with_submission(77)).await.unwrap();
    queue.process_queue().await.unwrap();
    handle.shutdown().await.unwrap();

    let store = JsonFileStore::new(dir.path(), &config.storage_key);
    assert!(store.path().exists());

    let handle = UploadQueue::from_config(config).unwrap();
    let item = handle.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(item.submission_id, Some(77));
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_calls_after_shutdown_fail() {
    let handle = start(MockTransport::new(Duration::from_millis(10)), memory_store());
    let queue = handle.queue.clone();

    handle.shutdown().await.unwrap();

    assert!(matches!(queue.get_all().await, Err(QueueError::ManagerShutdown)));
}
