use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::transport::{remaining_chunks, ChunkTransport};
use super::types::{QueueItem, QueueItemId};

/// Reports from a running transfer back to the queue.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// 一个分片上传完成
    Progress {
        id: QueueItemId,
        run_id: u64,
        uploaded_bytes: u64,
    },

    /// 本次运行结束
    Finished {
        id: QueueItemId,
        run_id: u64,
        outcome: TransferOutcome,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransferOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

pub(crate) struct UploadWorker {
    pub(crate) run_id: u64,
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) chunk_size: u64,
    pub(crate) report_tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl UploadWorker {
    pub async fn run(self, item: QueueItem) {
        let outcome = self.transfer(&item).await;

        let _ = self.report_tx.send(WorkerMessage::Finished {
            id: item.id,
            run_id: self.run_id,
            outcome,
        });
    }

    async fn transfer(&self, item: &QueueItem) -> TransferOutcome {
        for chunk in remaining_chunks(item.file_size, item.uploaded_bytes, self.chunk_size) {
            let result = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    return TransferOutcome::Cancelled;
                }
                result = self.transport.send_chunk(item, &chunk) => result,
            };

            if let Err(err) = result {
                return TransferOutcome::Failed(err.to_string());
            }

            let _ = self.report_tx.send(WorkerMessage::Progress {
                id: item.id.clone(),
                run_id: self.run_id,
                uploaded_bytes: chunk.end(),
            });
        }

        TransferOutcome::Completed
    }
}
