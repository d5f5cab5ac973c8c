//! The Work Coordinator procedure (spec.md §4.3): the single atomic
//! operation that heartbeats instances, assigns partitions, accepts
//! completions/failures/new messages, reclaims expired leases, appends
//! qualifying messages to the event store, and returns the next ordered
//! batch of work.
//!
//! Each spec step below is implemented as one or a few runtime
//! (non-macro) `sqlx` statements executed against the same
//! `sqlx::Transaction`, in the style of
//! `automations::executors::persist_action`: several `sqlx::query!` calls
//! chained inside one transaction rather than a single monolithic
//! statement. The runtime query API (`sqlx::query`/`query_as`, not the
//! `query!`/`query_as!` macros) is used throughout so this crate builds
//! without a live database or an offline query cache at compile time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use sqlx::{PgConnection, PgPool};
use tracing::instrument;

use crate::config::CoordinatorConfig;
use crate::errors::CoordinatorError;
use crate::ids::{InstanceId, MessageId, PartitionNumber, StreamId};
use crate::model::{InboxRow, OutboxRow};
use crate::partition::partition_of_message;
use crate::status::{MessageProcessingStatus, WorkBatchFlags};
use crate::types::{
    Completion, Failure, LeaseRenewals, NewInboxMessage, NewOutboxMessage, PerspectiveOutcome,
    ProcessWorkBatchInput, ReceptorOutcome, ServiceIdentity, WorkBatch, WorkItem,
};

const FAILED: i32 = MessageProcessingStatus::FAILED.0;
const PUBLISHED: i32 = MessageProcessingStatus::PUBLISHED.0;
const EVENT_STORED: i32 = MessageProcessingStatus::EVENT_STORED.0;
const STORED: i32 = MessageProcessingStatus::STORED.0;
const HANDLER_INVOKED: i32 = MessageProcessingStatus::HANDLER_INVOKED.0;

/// `ProcessWorkBatch` (spec.md §4.2): runs the entire procedure inside one
/// database transaction and returns the ordered work the caller should
/// process next.
#[instrument(skip_all, fields(instance_id = %identity.instance_id, service = %identity.service_name))]
pub async fn process_work_batch(
    pool: &PgPool,
    identity: &ServiceIdentity,
    input: ProcessWorkBatchInput,
    config: &CoordinatorConfig,
) -> Result<WorkBatch, CoordinatorError> {
    config.validate()?;

    let lease = duration(config.lease_seconds);
    let debug_mode = config.debug_mode();

    let mut txn = pool.begin().await?;

    step1_heartbeat(&mut txn, identity).await?;
    step2_reap_stale_instances(
        &mut txn,
        identity.instance_id,
        duration(config.stale_threshold_seconds),
    )
    .await?;

    let live_instances = live_instance_ids_ordered(&mut txn).await?;
    let n = live_instances.len().max(1) as i64;
    let fair_share = div_ceil(config.partition_count as i64, n);
    let cap = match config.max_partitions_per_instance {
        Some(explicit) => explicit.min(fair_share as i32),
        None => fair_share as i32,
    };

    step4_refresh_owned_partitions(&mut txn, identity.instance_id).await?;

    step5_apply_outbox_completions(&mut txn, &input.completions.outbox, debug_mode).await?;
    step5_apply_inbox_completions(&mut txn, &input.completions.inbox, debug_mode).await?;

    step6_apply_outbox_failures(&mut txn, &input.failures.outbox).await?;
    step6_apply_inbox_failures(&mut txn, &input.failures.inbox).await?;

    step7_apply_receptor_outcomes(&mut txn, &input.completions.receptor, &input.failures.receptor)
        .await?;
    step7_apply_perspective_outcomes(
        &mut txn,
        &input.completions.perspective,
        &input.failures.perspective,
    )
    .await?;

    step8_renew_leases(&mut txn, identity.instance_id, &input.lease_renewals, lease).await?;

    let inserted_outbox = step9_store_new_outbox(
        &mut txn,
        identity.instance_id,
        &input.new_messages.outbox,
        config.partition_count,
        lease,
    )
    .await?;
    let inserted_inbox = step10_store_new_inbox(
        &mut txn,
        identity.instance_id,
        &input.new_messages.inbox,
        config.partition_count,
        lease,
    )
    .await?;

    step11_acquire_partitions_for_new_work(
        &mut txn,
        identity.instance_id,
        &inserted_outbox,
        &inserted_inbox,
        cap,
    )
    .await?;

    step12_claim_orphaned_partitions(&mut txn, identity.instance_id, &live_instances, cap).await?;

    let event_candidates =
        collect_event_candidates(&input.new_messages.outbox, &input.new_messages.inbox, &inserted_inbox);
    step13_append_events(&mut txn, event_candidates).await?;

    let outbox_excluded: Vec<MessageId> = input
        .completions
        .outbox
        .iter()
        .map(|c| c.message_id)
        .chain(input.failures.outbox.iter().map(|f| f.message_id))
        .collect();
    let inbox_excluded: Vec<MessageId> = input
        .completions
        .inbox
        .iter()
        .map(|c| c.message_id)
        .chain(input.failures.inbox.iter().map(|f| f.message_id))
        .collect();

    let reclaimed_outbox =
        step14_claim_orphaned_outbox_rows(&mut txn, identity.instance_id, lease, &outbox_excluded)
            .await?;
    let reclaimed_inbox =
        step14_claim_orphaned_inbox_rows(&mut txn, identity.instance_id, lease, &inbox_excluded)
            .await?;

    let newly_stored_outbox: HashSet<MessageId> =
        inserted_outbox.iter().map(|m| m.message_id).collect();
    let newly_stored_inbox: HashSet<MessageId> =
        inserted_inbox.iter().map(|m| m.message_id).collect();

    // Step 15 returns only rows this flush just stored (step 9/10) or just
    // reclaimed (step 14) — not every row already leased to this instance
    // from an earlier flush, or a still-in-flight lease would be
    // re-returned and double-dispatched before its handler finishes.
    let returnable_outbox: HashSet<MessageId> = newly_stored_outbox
        .iter()
        .copied()
        .chain(reclaimed_outbox.iter().copied())
        .collect();
    let returnable_inbox: HashSet<MessageId> = newly_stored_inbox
        .iter()
        .copied()
        .chain(reclaimed_inbox.iter().copied())
        .collect();

    let outbox_work = step15_return_outbox_work(
        &mut txn,
        identity.instance_id,
        debug_mode,
        &newly_stored_outbox,
        &returnable_outbox,
    )
    .await?;
    let inbox_work = step15_return_inbox_work(
        &mut txn,
        identity.instance_id,
        debug_mode,
        &newly_stored_inbox,
        &returnable_inbox,
    )
    .await?;

    txn.commit().await?;

    tracing::debug!(
        outbox_returned = outbox_work.len(),
        inbox_returned = inbox_work.len(),
        live_instances = n,
        fair_share,
        "completed work coordinator flush"
    );

    Ok(WorkBatch {
        outbox_work,
        inbox_work,
    })
}

fn duration(seconds: i64) -> Duration {
    Duration::from_secs(seconds.max(0) as u64)
}

fn div_ceil(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

/// A message inserted by this flush's step 9 or 10, tracked for step 11's
/// partition acquisition and step 15's `NewlyStored` flag.
struct InsertedMessage {
    message_id: MessageId,
    partition_number: PartitionNumber,
}

struct EventCandidate {
    message_id: MessageId,
    stream_id: StreamId,
    event_type: String,
    payload: Vec<u8>,
    metadata: Option<Vec<u8>>,
    aggregate_id: Option<String>,
    aggregate_type: Option<String>,
}

// --- Step 1: register/heartbeat instance -----------------------------------

async fn step1_heartbeat(
    txn: &mut PgConnection,
    identity: &ServiceIdentity,
) -> Result<(), CoordinatorError> {
    sqlx::query(
        r#"
        INSERT INTO wh_service_instances
            (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at, metadata)
        VALUES ($1, $2, $3, $4, NOW(), NOW(), $5)
        ON CONFLICT (instance_id) DO UPDATE SET
            last_heartbeat_at = NOW(),
            service_name = EXCLUDED.service_name,
            host_name = EXCLUDED.host_name,
            process_id = EXCLUDED.process_id,
            metadata = COALESCE(EXCLUDED.metadata, wh_service_instances.metadata)
        "#,
    )
    .bind(identity.instance_id)
    .bind(&identity.service_name)
    .bind(&identity.host_name)
    .bind(identity.process_id)
    .bind(&identity.metadata)
    .execute(&mut *txn)
    .await?;

    Ok(())
}

// --- Step 2: reap stale instances -------------------------------------------

async fn step2_reap_stale_instances(
    txn: &mut PgConnection,
    this_instance: InstanceId,
    stale_threshold: Duration,
) -> Result<(), CoordinatorError> {
    let reaped = sqlx::query(
        r#"
        DELETE FROM wh_service_instances
        WHERE instance_id <> $1
          AND last_heartbeat_at < NOW() - $2::INTERVAL
        "#,
    )
    .bind(this_instance)
    .bind(stale_threshold)
    .execute(&mut *txn)
    .await?
    .rows_affected();

    if reaped > 0 {
        tracing::warn!(reaped, "reaped stale service instances");
    }

    Ok(())
}

async fn live_instance_ids_ordered(
    txn: &mut PgConnection,
) -> Result<Vec<InstanceId>, CoordinatorError> {
    let rows: Vec<(InstanceId,)> =
        sqlx::query_as("SELECT instance_id FROM wh_service_instances ORDER BY instance_id")
            .fetch_all(&mut *txn)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// --- Step 4: refresh owned partitions ---------------------------------------

async fn step4_refresh_owned_partitions(
    txn: &mut PgConnection,
    instance_id: InstanceId,
) -> Result<(), CoordinatorError> {
    sqlx::query("UPDATE wh_partition_assignments SET last_heartbeat = NOW() WHERE instance_id = $1")
        .bind(instance_id)
        .execute(&mut *txn)
        .await?;

    Ok(())
}

// --- Step 5: apply completions -----------------------------------------------

async fn step5_apply_outbox_completions(
    txn: &mut PgConnection,
    completions: &[Completion],
    debug_mode: bool,
) -> Result<(), CoordinatorError> {
    for completion in completions {
        let updated: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE wh_outbox SET
                status = status | $2,
                instance_id = NULL,
                lease_expiry = NULL,
                published_at = CASE
                    WHEN (status | $2) & $3 = $3 AND published_at IS NULL THEN NOW()
                    ELSE published_at
                END
            WHERE message_id = $1
            RETURNING status
            "#,
        )
        .bind(completion.message_id)
        .bind(completion.status_flags.0)
        .bind(PUBLISHED)
        .fetch_optional(&mut *txn)
        .await?;

        let Some((new_status,)) = updated else {
            continue;
        };

        if !debug_mode && MessageProcessingStatus(new_status).contains(MessageProcessingStatus::PUBLISHED) {
            sqlx::query("DELETE FROM wh_outbox WHERE message_id = $1")
                .bind(completion.message_id)
                .execute(&mut *txn)
                .await?;
        }
    }

    Ok(())
}

async fn step5_apply_inbox_completions(
    txn: &mut PgConnection,
    completions: &[Completion],
    debug_mode: bool,
) -> Result<(), CoordinatorError> {
    for completion in completions {
        let updated: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE wh_inbox SET
                status = status | $2,
                instance_id = NULL,
                lease_expiry = NULL
            WHERE message_id = $1
            RETURNING status
            "#,
        )
        .bind(completion.message_id)
        .bind(completion.status_flags.0)
        .fetch_optional(&mut *txn)
        .await?;

        let Some((new_status,)) = updated else {
            continue;
        };

        if !debug_mode
            && MessageProcessingStatus(new_status).contains(MessageProcessingStatus::EVENT_STORED)
        {
            sqlx::query("DELETE FROM wh_inbox WHERE message_id = $1")
                .bind(completion.message_id)
                .execute(&mut *txn)
                .await?;
        }
    }

    Ok(())
}

// --- Step 6: apply failures ---------------------------------------------------

async fn step6_apply_outbox_failures(
    txn: &mut PgConnection,
    failures: &[Failure],
) -> Result<(), CoordinatorError> {
    for failure in failures {
        sqlx::query(
            r#"
            UPDATE wh_outbox SET
                status = status | $2 | $3,
                error = $4,
                attempts = attempts + 1,
                instance_id = NULL,
                lease_expiry = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(failure.message_id)
        .bind(failure.completed_status.0)
        .bind(FAILED)
        .bind(&failure.error)
        .execute(&mut *txn)
        .await?;
    }

    Ok(())
}

async fn step6_apply_inbox_failures(
    txn: &mut PgConnection,
    failures: &[Failure],
) -> Result<(), CoordinatorError> {
    for failure in failures {
        sqlx::query(
            r#"
            UPDATE wh_inbox SET
                status = status | $2 | $3,
                error = $4,
                attempts = attempts + 1,
                instance_id = NULL,
                lease_expiry = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(failure.message_id)
        .bind(failure.completed_status.0)
        .bind(FAILED)
        .bind(&failure.error)
        .execute(&mut *txn)
        .await?;
    }

    Ok(())
}

// --- Step 7: receptor-processing log / perspective checkpoints ---------------

async fn step7_apply_receptor_outcomes(
    txn: &mut PgConnection,
    completions: &[ReceptorOutcome],
    failures: &[ReceptorOutcome],
) -> Result<(), CoordinatorError> {
    for outcome in completions {
        insert_receptor_log_row(txn, outcome, HANDLER_INVOKED).await?;
    }
    for outcome in failures {
        insert_receptor_log_row(txn, outcome, FAILED).await?;
    }

    Ok(())
}

async fn insert_receptor_log_row(
    txn: &mut PgConnection,
    outcome: &ReceptorOutcome,
    status: i32,
) -> Result<(), CoordinatorError> {
    sqlx::query(
        r#"
        INSERT INTO wh_receptor_processing_log
            (event_id, receptor_name, status, attempts, error, started_at, processed_at)
        VALUES ($1, $2, $3, 1, $4, NOW(), NOW())
        "#,
    )
    .bind(outcome.event_id)
    .bind(&outcome.receptor_name)
    .bind(status)
    .bind(&outcome.error)
    .execute(&mut *txn)
    .await?;

    Ok(())
}

async fn step7_apply_perspective_outcomes(
    txn: &mut PgConnection,
    completions: &[PerspectiveOutcome],
    failures: &[PerspectiveOutcome],
) -> Result<(), CoordinatorError> {
    for outcome in completions {
        upsert_perspective_checkpoint(txn, outcome, HANDLER_INVOKED).await?;
    }
    for outcome in failures {
        upsert_perspective_checkpoint(txn, outcome, FAILED).await?;
    }

    Ok(())
}

async fn upsert_perspective_checkpoint(
    txn: &mut PgConnection,
    outcome: &PerspectiveOutcome,
    status: i32,
) -> Result<(), CoordinatorError> {
    sqlx::query(
        r#"
        INSERT INTO wh_perspective_checkpoints
            (stream_id, perspective_name, last_event_id, status, processed_at, error)
        VALUES ($1, $2, $3, $4, NOW(), $5)
        ON CONFLICT (stream_id, perspective_name) DO UPDATE SET
            last_event_id = COALESCE(EXCLUDED.last_event_id, wh_perspective_checkpoints.last_event_id),
            status = wh_perspective_checkpoints.status | EXCLUDED.status,
            processed_at = EXCLUDED.processed_at,
            error = EXCLUDED.error
        "#,
    )
    .bind(outcome.stream_id)
    .bind(&outcome.perspective_name)
    .bind(outcome.last_event_id)
    .bind(status)
    .bind(&outcome.error)
    .execute(&mut *txn)
    .await?;

    Ok(())
}

// --- Step 8: renew leases ------------------------------------------------------

async fn step8_renew_leases(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    renewals: &LeaseRenewals,
    lease: Duration,
) -> Result<(), CoordinatorError> {
    if !renewals.outbox.is_empty() {
        sqlx::query(
            r#"
            UPDATE wh_outbox SET lease_expiry = NOW() + $1::INTERVAL
            WHERE message_id = ANY($2) AND instance_id = $3
            "#,
        )
        .bind(lease)
        .bind(&renewals.outbox)
        .bind(instance_id)
        .execute(&mut *txn)
        .await?;
    }

    if !renewals.inbox.is_empty() {
        sqlx::query(
            r#"
            UPDATE wh_inbox SET lease_expiry = NOW() + $1::INTERVAL
            WHERE message_id = ANY($2) AND instance_id = $3
            "#,
        )
        .bind(lease)
        .bind(&renewals.inbox)
        .bind(instance_id)
        .execute(&mut *txn)
        .await?;
    }

    Ok(())
}

// --- Step 9: store new outbox messages -----------------------------------------

async fn step9_store_new_outbox(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    messages: &[NewOutboxMessage],
    partition_count: i32,
    lease: Duration,
) -> Result<Vec<InsertedMessage>, CoordinatorError> {
    let mut inserted = Vec::with_capacity(messages.len());

    for message in messages {
        let partition_number =
            partition_of_message(message.stream_id, message.message_id, partition_count);
        let status = if message.is_event {
            MessageProcessingStatus::STORED | MessageProcessingStatus::EVENT_STORED
        } else {
            MessageProcessingStatus::STORED
        };

        sqlx::query(
            r#"
            INSERT INTO wh_outbox
                (message_id, destination, message_type, payload, metadata, scope, stream_id,
                 partition_number, status, attempts, instance_id, lease_expiry, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, NOW() + $11::INTERVAL, NOW())
            "#,
        )
        .bind(message.message_id)
        .bind(&message.destination)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.metadata)
        .bind(&message.scope)
        .bind(message.stream_id)
        .bind(partition_number)
        .bind(status.0)
        .bind(instance_id)
        .bind(lease)
        .execute(&mut *txn)
        .await?;

        inserted.push(InsertedMessage {
            message_id: message.message_id,
            partition_number,
        });
    }

    Ok(inserted)
}

// --- Step 10: store new inbox messages, idempotently ---------------------------

async fn step10_store_new_inbox(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    messages: &[NewInboxMessage],
    partition_count: i32,
    lease: Duration,
) -> Result<Vec<InsertedMessage>, CoordinatorError> {
    let mut inserted = Vec::with_capacity(messages.len());

    for message in messages {
        let first_time: Option<(MessageId,)> = sqlx::query_as(
            r#"
            INSERT INTO wh_dedup (message_id, first_seen_at)
            VALUES ($1, NOW())
            ON CONFLICT (message_id) DO NOTHING
            RETURNING message_id
            "#,
        )
        .bind(message.message_id)
        .fetch_optional(&mut *txn)
        .await?;

        if first_time.is_none() {
            // Duplicate: silently dropped (spec.md §4.3 step 10).
            continue;
        }

        let partition_number =
            partition_of_message(message.stream_id, message.message_id, partition_count);

        sqlx::query(
            r#"
            INSERT INTO wh_inbox
                (message_id, handler_name, message_type, payload, metadata, scope, stream_id,
                 partition_number, status, attempts, instance_id, lease_expiry, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, NOW() + $11::INTERVAL, NOW())
            "#,
        )
        .bind(message.message_id)
        .bind(&message.handler_name)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.metadata)
        .bind(&message.scope)
        .bind(message.stream_id)
        .bind(partition_number)
        .bind(STORED)
        .bind(instance_id)
        .bind(lease)
        .execute(&mut *txn)
        .await?;

        inserted.push(InsertedMessage {
            message_id: message.message_id,
            partition_number,
        });
    }

    Ok(inserted)
}

// --- Step 11: acquire partitions referenced by newly stored messages -----------

async fn step11_acquire_partitions_for_new_work(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    inserted_outbox: &[InsertedMessage],
    inserted_inbox: &[InsertedMessage],
    cap: i32,
) -> Result<(), CoordinatorError> {
    let mut partitions: BTreeSet<PartitionNumber> = BTreeSet::new();
    partitions.extend(inserted_outbox.iter().map(|m| m.partition_number));
    partitions.extend(inserted_inbox.iter().map(|m| m.partition_number));

    if partitions.is_empty() {
        return Ok(());
    }

    acquire_unowned_partitions(txn, instance_id, partitions, cap).await
}

async fn acquire_unowned_partitions(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    candidates: BTreeSet<PartitionNumber>,
    cap: i32,
) -> Result<(), CoordinatorError> {
    let owned: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM wh_partition_assignments WHERE instance_id = $1",
    )
    .bind(instance_id)
    .fetch_one(&mut *txn)
    .await?;

    let mut remaining = (cap as i64 - owned).max(0);

    for partition in candidates {
        if remaining <= 0 {
            break;
        }

        let acquired: Option<(PartitionNumber,)> = sqlx::query_as(
            r#"
            INSERT INTO wh_partition_assignments (partition_number, instance_id, assigned_at, last_heartbeat)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (partition_number) DO NOTHING
            RETURNING partition_number
            "#,
        )
        .bind(partition)
        .bind(instance_id)
        .fetch_optional(&mut *txn)
        .await?;

        if acquired.is_some() {
            remaining -= 1;
        }
    }

    Ok(())
}

// --- Step 12: claim orphaned partitions, load-balanced by rank -----------------

async fn step12_claim_orphaned_partitions(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    live_instances: &[InstanceId],
    cap: i32,
) -> Result<(), CoordinatorError> {
    let n = live_instances.len() as i64;
    let rank = live_instances
        .iter()
        .position(|candidate| *candidate == instance_id)
        .unwrap_or(0) as i64;

    let outbox_partitions: Vec<(PartitionNumber,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT partition_number FROM wh_outbox
        WHERE (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < NOW())
          AND status & $1 = 0
          AND status & $2 = 0
          AND partition_number NOT IN (SELECT partition_number FROM wh_partition_assignments)
        "#,
    )
    .bind(PUBLISHED)
    .bind(FAILED)
    .fetch_all(&mut *txn)
    .await?;

    let inbox_partitions: Vec<(PartitionNumber,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT partition_number FROM wh_inbox
        WHERE (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < NOW())
          AND status & $1 = 0
          AND status & $2 = 0
          AND partition_number NOT IN (SELECT partition_number FROM wh_partition_assignments)
        "#,
    )
    .bind(EVENT_STORED)
    .bind(FAILED)
    .fetch_all(&mut *txn)
    .await?;

    let mut candidates: BTreeSet<PartitionNumber> = BTreeSet::new();
    candidates.extend(outbox_partitions.into_iter().map(|(p,)| p));
    candidates.extend(inbox_partitions.into_iter().map(|(p,)| p));

    let candidates: BTreeSet<PartitionNumber> = candidates
        .into_iter()
        .filter(|partition| n > 0 && (*partition as i64).rem_euclid(n) == rank)
        .collect();

    if candidates.is_empty() {
        return Ok(());
    }

    acquire_unowned_partitions(txn, instance_id, candidates, cap).await
}

// --- Step 13: event store append ------------------------------------------------

fn collect_event_candidates(
    new_outbox: &[NewOutboxMessage],
    new_inbox: &[NewInboxMessage],
    inserted_inbox: &[InsertedMessage],
) -> Vec<EventCandidate> {
    let mut candidates = Vec::new();

    for message in new_outbox {
        if let Some(stream_id) = message.stream_id.filter(|_| message.is_event) {
            candidates.push(EventCandidate {
                message_id: message.message_id,
                stream_id,
                event_type: message
                    .event_type
                    .clone()
                    .unwrap_or_else(|| message.message_type.clone()),
                payload: message.payload.clone(),
                metadata: message.metadata.clone(),
                aggregate_id: message.aggregate_id.clone(),
                aggregate_type: message.aggregate_type.clone(),
            });
        }
    }

    // Inbox messages only become event candidates once actually ingested
    // (i.e. they survived deduplication in step 10).
    let inserted_inbox_ids: HashSet<MessageId> =
        inserted_inbox.iter().map(|m| m.message_id).collect();

    for message in new_inbox {
        if !inserted_inbox_ids.contains(&message.message_id) {
            continue;
        }
        if let Some(stream_id) = message.stream_id.filter(|_| message.is_event) {
            candidates.push(EventCandidate {
                message_id: message.message_id,
                stream_id,
                event_type: message
                    .event_type
                    .clone()
                    .unwrap_or_else(|| message.message_type.clone()),
                payload: message.payload.clone(),
                metadata: message.metadata.clone(),
                aggregate_id: message.aggregate_id.clone(),
                aggregate_type: message.aggregate_type.clone(),
            });
        }
    }

    candidates
}

async fn step13_append_events(
    txn: &mut PgConnection,
    candidates: Vec<EventCandidate>,
) -> Result<(), CoordinatorError> {
    if candidates.is_empty() {
        return Ok(());
    }

    let mut by_stream: BTreeMap<StreamId, Vec<EventCandidate>> = BTreeMap::new();
    for candidate in candidates {
        by_stream.entry(candidate.stream_id).or_default().push(candidate);
    }

    let stream_ids: Vec<StreamId> = by_stream.keys().copied().collect();
    let existing_versions: Vec<(StreamId, i64)> = sqlx::query_as(
        "SELECT stream_id, MAX(version) FROM wh_event_store WHERE stream_id = ANY($1) GROUP BY stream_id",
    )
    .bind(&stream_ids)
    .fetch_all(&mut *txn)
    .await?;

    let mut max_version: HashMap<StreamId, i64> = existing_versions.into_iter().collect();

    for (stream_id, mut events) in by_stream {
        // ROW_NUMBER() PARTITION BY streamId ORDER BY messageId (spec.md §4.3
        // step 13); UUIDv7 message ids are time-ordered, so this is also
        // creation order.
        events.sort_by_key(|event| event.message_id);

        let base = *max_version.entry(stream_id).or_insert(0);

        for (offset, event) in events.into_iter().enumerate() {
            let version = base + offset as i64 + 1;

            // ON CONFLICT tolerates a concurrent coordinator call appending
            // to the same stream: the losing insert is silently dropped
            // (spec.md §4.3 step 13, §7 "Event-store version conflict").
            sqlx::query(
                r#"
                INSERT INTO wh_event_store
                    (event_id, stream_id, aggregate_id, aggregate_type, event_type,
                     payload, metadata, sequence_number, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, nextval('wh_event_sequence'), $8, NOW())
                ON CONFLICT (stream_id, version) DO NOTHING
                "#,
            )
            .bind(event.message_id)
            .bind(stream_id)
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(&event.metadata)
            .bind(version)
            .execute(&mut *txn)
            .await?;
        }
    }

    Ok(())
}

// --- Step 14: claim orphaned rows within owned partitions -----------------------

async fn step14_claim_orphaned_outbox_rows(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    lease: Duration,
    excluded: &[MessageId],
) -> Result<Vec<MessageId>, CoordinatorError> {
    let reclaimed: Vec<(MessageId,)> = sqlx::query_as(
        r#"
        UPDATE wh_outbox SET
            instance_id = $1,
            lease_expiry = NOW() + $2::INTERVAL
        WHERE partition_number IN (SELECT partition_number FROM wh_partition_assignments WHERE instance_id = $1)
          AND (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < NOW())
          AND status & $3 = 0
          AND status & $4 = 0
          AND message_id <> ALL($5)
        RETURNING message_id
        "#,
    )
    .bind(instance_id)
    .bind(lease)
    .bind(PUBLISHED)
    .bind(FAILED)
    .bind(excluded)
    .fetch_all(&mut *txn)
    .await?;

    Ok(reclaimed.into_iter().map(|(id,)| id).collect())
}

async fn step14_claim_orphaned_inbox_rows(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    lease: Duration,
    excluded: &[MessageId],
) -> Result<Vec<MessageId>, CoordinatorError> {
    let reclaimed: Vec<(MessageId,)> = sqlx::query_as(
        r#"
        UPDATE wh_inbox SET
            instance_id = $1,
            lease_expiry = NOW() + $2::INTERVAL
        WHERE partition_number IN (SELECT partition_number FROM wh_partition_assignments WHERE instance_id = $1)
          AND (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < NOW())
          AND status & $3 = 0
          AND status & $4 = 0
          AND message_id <> ALL($5)
        RETURNING message_id
        "#,
    )
    .bind(instance_id)
    .bind(lease)
    .bind(EVENT_STORED)
    .bind(FAILED)
    .bind(excluded)
    .fetch_all(&mut *txn)
    .await?;

    Ok(reclaimed.into_iter().map(|(id,)| id).collect())
}

// --- Step 15: return work ---------------------------------------------------------

async fn step15_return_outbox_work(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    debug_mode: bool,
    newly_stored: &HashSet<MessageId>,
    returnable: &HashSet<MessageId>,
) -> Result<Vec<WorkItem>, CoordinatorError> {
    let returnable: Vec<MessageId> = returnable.iter().copied().collect();

    let rows: Vec<OutboxRow> = sqlx::query_as(
        r#"
        SELECT o.* FROM wh_outbox o
        JOIN wh_partition_assignments pa ON pa.partition_number = o.partition_number
        WHERE pa.instance_id = $1
          AND o.instance_id = $1
          AND o.lease_expiry IS NOT NULL AND o.lease_expiry > NOW()
          AND o.status & $2 = 0
          AND o.status & $3 = 0
          AND o.message_id = ANY($4)
        ORDER BY o.stream_id, o.created_at
        "#,
    )
    .bind(instance_id)
    .bind(FAILED)
    .bind(PUBLISHED)
    .bind(&returnable)
    .fetch_all(&mut *txn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| WorkItem {
            message_id: row.message_id,
            destination_or_handler: row.destination,
            message_type: row.message_type,
            payload: row.payload,
            metadata: row.metadata,
            stream_id: row.stream_id,
            partition_number: row.partition_number,
            attempts: row.attempts,
            status: row.status,
            batch_flags: batch_flags(row.message_id, newly_stored, debug_mode),
            sequence_order: row.created_at.timestamp_millis(),
        })
        .collect())
}

async fn step15_return_inbox_work(
    txn: &mut PgConnection,
    instance_id: InstanceId,
    debug_mode: bool,
    newly_stored: &HashSet<MessageId>,
    returnable: &HashSet<MessageId>,
) -> Result<Vec<WorkItem>, CoordinatorError> {
    let returnable: Vec<MessageId> = returnable.iter().copied().collect();

    let rows: Vec<InboxRow> = sqlx::query_as(
        r#"
        SELECT i.* FROM wh_inbox i
        JOIN wh_partition_assignments pa ON pa.partition_number = i.partition_number
        WHERE pa.instance_id = $1
          AND i.instance_id = $1
          AND i.lease_expiry IS NOT NULL AND i.lease_expiry > NOW()
          AND i.status & $2 = 0
          AND i.status & $3 = 0
          AND i.message_id = ANY($4)
        ORDER BY i.stream_id, i.received_at
        "#,
    )
    .bind(instance_id)
    .bind(FAILED)
    .bind(EVENT_STORED)
    .bind(&returnable)
    .fetch_all(&mut *txn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| WorkItem {
            message_id: row.message_id,
            destination_or_handler: row.handler_name,
            message_type: row.message_type,
            payload: row.payload,
            metadata: row.metadata,
            stream_id: row.stream_id,
            partition_number: row.partition_number,
            attempts: row.attempts,
            status: row.status,
            batch_flags: batch_flags(row.message_id, newly_stored, debug_mode),
            sequence_order: row.received_at.timestamp_millis(),
        })
        .collect())
}

fn batch_flags(
    message_id: MessageId,
    newly_stored: &HashSet<MessageId>,
    debug_mode: bool,
) -> WorkBatchFlags {
    let lifecycle = if newly_stored.contains(&message_id) {
        WorkBatchFlags::NEWLY_STORED
    } else {
        WorkBatchFlags::ORPHANED
    };

    if debug_mode {
        lifecycle | WorkBatchFlags::DEBUG_MODE
    } else {
        lifecycle
    }
}
