//! Request and response types for [`crate::coordinator::process_work_batch`]
//! (spec.md §4.2 "Coordinator client" signature).

use crate::ids::{InstanceId, MessageId, PartitionNumber, StreamId};
use crate::status::{MessageProcessingStatus, WorkBatchFlags};

/// Identity of the caller, upserted into `wh_service_instances` on every
/// flush (spec.md §4.3 step 1).
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    /// `None` leaves any previously-stored metadata untouched.
    pub metadata: Option<serde_json::Value>,
}

/// A message to store in the outbox (spec.md §4.3 step 9).
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub message_id: MessageId,
    pub destination: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub scope: Option<String>,
    pub stream_id: Option<StreamId>,
    pub is_event: bool,
    pub event_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
}

/// A message to store in the inbox (spec.md §4.3 step 10). Subject to
/// idempotent ingestion via the deduplication table.
#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub message_id: MessageId,
    pub handler_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub scope: Option<String>,
    pub stream_id: Option<StreamId>,
    pub is_event: bool,
    pub event_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
}

/// A `(messageId, statusFlags)` pair reporting completion of previously
/// leased work (spec.md §4.3 step 5).
#[derive(Debug, Clone)]
pub struct Completion {
    pub message_id: MessageId,
    pub status_flags: MessageProcessingStatus,
}

/// A `(messageId, completedStatus, error)` triple reporting failed work
/// (spec.md §4.3 step 6).
#[derive(Debug, Clone)]
pub struct Failure {
    pub message_id: MessageId,
    pub completed_status: MessageProcessingStatus,
    pub error: String,
}

/// A receptor-processing-log completion or failure (spec.md §4.3 step 7).
#[derive(Debug, Clone)]
pub struct ReceptorOutcome {
    pub event_id: MessageId,
    pub receptor_name: String,
    pub error: Option<String>,
}

/// A perspective-checkpoint completion or failure (spec.md §4.3 step 7).
#[derive(Debug, Clone)]
pub struct PerspectiveOutcome {
    pub stream_id: StreamId,
    pub perspective_name: String,
    pub last_event_id: Option<MessageId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Completions {
    pub outbox: Vec<Completion>,
    pub inbox: Vec<Completion>,
    pub receptor: Vec<ReceptorOutcome>,
    pub perspective: Vec<PerspectiveOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct Failures {
    pub outbox: Vec<Failure>,
    pub inbox: Vec<Failure>,
    pub receptor: Vec<ReceptorOutcome>,
    pub perspective: Vec<PerspectiveOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessages {
    pub outbox: Vec<NewOutboxMessage>,
    pub inbox: Vec<NewInboxMessage>,
}

/// Explicit lease renewals (spec.md §4.3 step 8): ids the caller still
/// holds work for but hasn't yet completed or failed.
#[derive(Debug, Clone, Default)]
pub struct LeaseRenewals {
    pub outbox: Vec<MessageId>,
    pub inbox: Vec<MessageId>,
}

/// The full input to a single `ProcessWorkBatch` call (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct ProcessWorkBatchInput {
    pub completions: Completions,
    pub failures: Failures,
    pub new_messages: NewMessages,
    pub lease_renewals: LeaseRenewals,
}

impl ProcessWorkBatchInput {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One row of a returned work batch (spec.md §4.2, §4.3 step 15).
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub message_id: MessageId,
    /// The outbox `destination` or inbox `handlerName`, per direction.
    pub destination_or_handler: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub stream_id: Option<StreamId>,
    pub partition_number: PartitionNumber,
    pub attempts: i32,
    pub status: MessageProcessingStatus,
    pub batch_flags: WorkBatchFlags,
    /// Ms-precision insertion time, used purely for intra-stream ordering
    /// within the returned batch (spec.md §4.2).
    pub sequence_order: i64,
}

/// The ordered work returned from a flush (spec.md §4.2, §4.3 step 15).
#[derive(Debug, Clone, Default)]
pub struct WorkBatch {
    pub outbox_work: Vec<WorkItem>,
    pub inbox_work: Vec<WorkItem>,
}

impl WorkBatch {
    pub fn is_empty(&self) -> bool {
        self.outbox_work.is_empty() && self.inbox_work.is_empty()
    }
}
