//! Dispatch side of the coordinator client (spec.md §4.4): routes a
//! returned work batch to a bounded worker pool per direction, pinning
//! same-`streamId` work to the same worker so that the coordinator's
//! returned order is preserved through handler invocation (spec.md §5,
//! "handlers for the same stream run strictly serially").
//!
//! Modeled on `agent::handlers::serve`'s pattern of one task per
//! concurrency slot draining a channel, rather than the unbounded-channel
//! fan-out `coroutines` crate uses: the ordering requirement here means a
//! stream's work must stay on one channel, so a fixed set of per-worker
//! channels (hashed by `streamId`) fits better than a single shared queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use whizbang_core::{MessageId, MessageProcessingStatus, WorkItem};

/// The result a publisher or receptor reports for one work item, destined
/// for the next flush's completions or failures (spec.md §4.3 steps 5/6).
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(MessageProcessingStatus),
    Failed {
        completed_status: MessageProcessingStatus,
        error: String,
    },
}

/// Implemented by host code to publish outbox work or invoke inbox
/// receptors. The core never calls this directly; only the client's
/// dispatch pool does.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbox,
    Inbox,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub direction: Direction,
    pub message_id: MessageId,
    pub outcome: Outcome,
}

/// A fixed set of per-worker channels. `route` sends each item to the
/// worker its `streamId` hashes to (or round-robins unstreamed items,
/// which carry no ordering requirement of their own per spec.md §4.1).
pub struct StreamWorkerPool {
    senders: Vec<mpsc::Sender<WorkItem>>,
    next_unstreamed: AtomicUsize,
}

impl StreamWorkerPool {
    pub fn spawn<H>(
        direction: Direction,
        worker_count: usize,
        channel_capacity: usize,
        handler: Arc<H>,
        results: mpsc::Sender<DispatchResult>,
    ) -> Self
    where
        H: WorkItemHandler + 'static,
    {
        assert!(worker_count > 0, "a dispatch pool needs at least one worker");

        let senders = (0..worker_count)
            .map(|worker_index| {
                let (tx, mut rx) = mpsc::channel::<WorkItem>(channel_capacity);
                let handler = Arc::clone(&handler);
                let results = results.clone();

                tokio::spawn(async move {
                    tracing::debug!(?direction, worker_index, "dispatch worker started");
                    while let Some(item) = rx.recv().await {
                        let message_id = item.message_id;
                        let outcome = handler.handle(&item).await;
                        if results
                            .send(DispatchResult {
                                direction,
                                message_id,
                                outcome,
                            })
                            .await
                            .is_err()
                        {
                            // The client has shut down; nothing left to report to.
                            break;
                        }
                    }
                });

                tx
            })
            .collect();

        Self {
            senders,
            next_unstreamed: AtomicUsize::new(0),
        }
    }

    /// Enqueues `item` on its stream's worker, applying back-pressure if
    /// that worker is still busy with earlier work from the same stream.
    /// This is the desired behavior, not a bug: it's what keeps per-stream
    /// ordering intact (spec.md §5).
    pub async fn route(&self, item: WorkItem) {
        let worker = match item.stream_id {
            Some(stream_id) => {
                (stream_id.as_uuid().as_u128() % self.senders.len() as u128) as usize
            }
            None => self.next_unstreamed.fetch_add(1, Ordering::Relaxed) % self.senders.len(),
        };

        if self.senders[worker].send(item).await.is_err() {
            tracing::warn!("dispatch worker channel closed; item will be reclaimed by lease expiry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whizbang_core::StreamId;

    struct Echo;

    #[async_trait]
    impl WorkItemHandler for Echo {
        async fn handle(&self, _item: &WorkItem) -> Outcome {
            Outcome::Completed(MessageProcessingStatus::HANDLER_INVOKED)
        }
    }

    fn work_item(stream_id: Option<StreamId>) -> WorkItem {
        WorkItem {
            message_id: MessageId::new_v7(),
            destination_or_handler: "dest".to_string(),
            message_type: "Test".to_string(),
            payload: Vec::new(),
            metadata: None,
            stream_id,
            partition_number: 0,
            attempts: 0,
            status: MessageProcessingStatus::STORED,
            batch_flags: whizbang_core::WorkBatchFlags::NEWLY_STORED,
            sequence_order: 0,
        }
    }

    #[tokio::test]
    async fn same_stream_always_routes_to_the_same_worker() {
        let (results_tx, _results_rx) = mpsc::channel(16);
        let pool = StreamWorkerPool::spawn(Direction::Outbox, 8, 16, Arc::new(Echo), results_tx);

        let stream = StreamId::new_v7();
        let expected = (stream.as_uuid().as_u128() % 8) as usize;

        for _ in 0..5 {
            let worker = match work_item(Some(stream)).stream_id {
                Some(s) => (s.as_uuid().as_u128() % pool.senders.len() as u128) as usize,
                None => unreachable!(),
            };
            assert_eq!(worker, expected);
        }
    }

    #[tokio::test]
    async fn unstreamed_items_round_robin_across_workers() {
        let (results_tx, _results_rx) = mpsc::channel(16);
        let pool = StreamWorkerPool::spawn(Direction::Inbox, 4, 16, Arc::new(Echo), results_tx);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let worker = pool.next_unstreamed.fetch_add(1, Ordering::Relaxed) % pool.senders.len();
            seen.insert(worker);
        }
        assert_eq!(seen.len(), 4, "round robin should eventually touch every worker");
    }
}
