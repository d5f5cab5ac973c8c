//! Row types for the eight tables that make up the persisted state layout
//! (spec.md §3.2, §6 "Persisted state layout"). Column names here are the
//! stable external contract; table names carry the `wh_` prefix described
//! in §6 (see `migrations/0001_initial.sql`).

use chrono::{DateTime, Utc};

use crate::ids::{InstanceId, MessageId, PartitionNumber, StreamId};
use crate::status::MessageProcessingStatus;

/// A live (or recently-live) service process, heartbeated every flush
/// (spec.md §3.2 "ServiceInstance").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceInstance {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// One partition's current owner (spec.md §3.2 "PartitionAssignment").
/// Rows cascade-delete when their owning `ServiceInstance` is reaped.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PartitionAssignment {
    pub partition_number: PartitionNumber,
    pub instance_id: InstanceId,
    pub assigned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// A durable outbox row: a message produced by this service, destined for
/// an external consumer, leased by at most one instance at a time
/// (spec.md §3.2 "Outbox row").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub message_id: MessageId,
    pub destination: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub scope: Option<String>,
    pub stream_id: Option<StreamId>,
    pub partition_number: PartitionNumber,
    pub status: MessageProcessingStatus,
    pub attempts: i32,
    pub instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A durable inbox row: a message received by this service and awaiting
/// handler invocation / event-store append (spec.md §3.2 "Inbox row").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxRow {
    pub message_id: MessageId,
    pub handler_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub scope: Option<String>,
    pub stream_id: Option<StreamId>,
    pub partition_number: PartitionNumber,
    pub status: MessageProcessingStatus,
    pub attempts: i32,
    pub instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Permanent record that a `messageId` was ever accepted into the inbox
/// (spec.md §3.2 "Deduplication"). Retention policy is a host concern;
/// the core treats this table as unbounded.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeduplicationRow {
    pub message_id: MessageId,
    pub first_seen_at: DateTime<Utc>,
}

/// One append to a stream's event-sourced history (spec.md §3.2
/// "EventStore row"). `(stream_id, version)` is unique; `version` is
/// per-stream contiguous starting at 1; `sequence_number` is drawn from a
/// single global counter shared by all streams.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventStoreRow {
    pub event_id: MessageId,
    pub stream_id: StreamId,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub sequence_number: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-receiver progress, updated by a helper the coordinator invokes on
/// receptor completions/failures (spec.md §3.2 "ReceptorProcessingLog").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReceptorProcessingLogRow {
    pub id: i64,
    pub event_id: MessageId,
    pub receptor_name: String,
    pub status: MessageProcessingStatus,
    pub attempts: i32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Per-perspective-per-stream checkpoint (spec.md §3.2
/// "PerspectiveCheckpoint").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PerspectiveCheckpointRow {
    pub stream_id: StreamId,
    pub perspective_name: String,
    pub last_event_id: Option<MessageId>,
    pub status: MessageProcessingStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Optional ownership table used by alternate claim routines (spec.md
/// §3.2 "ActiveStream"). Not written by the Work Coordinator procedure
/// itself; present for hosts that layer stream-level claims on top of
/// partition-level ones.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveStreamRow {
    pub stream_id: StreamId,
    pub partition_number: PartitionNumber,
    pub assigned_instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
