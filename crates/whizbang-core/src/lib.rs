//! Whizbang's Work Coordinator: a single atomic transactional procedure
//! over a relational database that heartbeats service instances, assigns
//! stream partitions via consistent hashing, accepts completion/failure
//! reports, ingests new outbox/inbox messages (with exactly-once inbox
//! dedup), reclaims expired leases, appends qualifying messages to the
//! event store, and returns the next ordered batch of work.
//!
//! This crate is a library, not a hosted service: it owns the
//! [`coordinator::process_work_batch`] procedure and the data model it
//! runs against, and nothing else. Hosting it behind an RPC surface,
//! scheduling when to call it, and dispatching returned work to handlers
//! are concerns of a calling binary (see `whizbang-client` for the
//! latter).

pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod model;
pub mod partition;
pub mod status;
pub mod types;

pub use config::CoordinatorConfig;
pub use coordinator::process_work_batch;
pub use envelope::{normalize_envelope_type, Envelope};
pub use errors::CoordinatorError;
pub use ids::{InstanceId, MessageId, PartitionNumber, StreamId};
pub use partition::{partition_of_message, partition_of_stream, partition_of_unstreamed_message};
pub use status::{MessageProcessingStatus, WorkBatchFlags};
pub use types::{
    Completion, Completions, Failure, Failures, LeaseRenewals, NewInboxMessage, NewMessages,
    NewOutboxMessage, PerspectiveOutcome, ProcessWorkBatchInput, ReceptorOutcome, ServiceIdentity,
    WorkBatch, WorkItem,
};

/// Embeds and runs the crate's migrations against `pool`, the way
/// `control::cmd::setup` runs `sqlx::migrate!` against a fresh database.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
