//! The partition function (spec.md §4.1): a deterministic, uniform,
//! cross-process-stable mapping from a stream identifier to `[0, P)`.
//!
//! Built on `xxhash-rust`'s XXH3, the same hashing family used elsewhere
//! in this workspace's dependency tree. XXH3 is not cryptographic, which
//! is fine here: the only property this function needs is a stable,
//! well-distributed mapping, not collision resistance against an
//! adversary.

use xxhash_rust::xxh3::xxh3_64;

use crate::ids::{MessageId, PartitionNumber, StreamId};

/// Maps a `streamId` to a partition in `[0, partition_count)`.
///
/// Callers must use the same `partition_count` everywhere in a deployment
/// (spec.md §6: "Changing `P` requires coordinated redeployment").
pub fn partition_of_stream(stream_id: StreamId, partition_count: i32) -> PartitionNumber {
    partition_of_bytes(stream_id.as_uuid().as_bytes(), partition_count)
}

/// Maps a message with no `streamId` to a partition, using its `messageId`
/// as the hash input (spec.md §4.1). These messages are not cross-stream
/// ordered with anything else; the partition only needs to be stable for
/// the lifetime of that single message's leasing.
pub fn partition_of_unstreamed_message(
    message_id: MessageId,
    partition_count: i32,
) -> PartitionNumber {
    partition_of_bytes(message_id.synthetic_partition_key(), partition_count)
}

fn partition_of_bytes(bytes: &[u8], partition_count: i32) -> PartitionNumber {
    assert!(partition_count > 0, "partition_count must be positive");
    (xxh3_64(bytes) % partition_count as u64) as PartitionNumber
}

/// Computes the partition for a message given its optional `streamId`,
/// dispatching to the stream-keyed or message-keyed hash as appropriate.
/// This is the single entry point §4.3 steps 9 and 10 use on ingestion.
pub fn partition_of_message(
    stream_id: Option<StreamId>,
    message_id: MessageId,
    partition_count: i32,
) -> PartitionNumber {
    match stream_id {
        Some(stream_id) => partition_of_stream(stream_id, partition_count),
        None => partition_of_unstreamed_message(message_id, partition_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        let stream = StreamId::new_v7();
        let a = partition_of_stream(stream, 10_000);
        let b = partition_of_stream(stream, 10_000);
        assert_eq!(a, b);
    }

    #[test]
    fn in_range() {
        for _ in 0..1000 {
            let stream = StreamId::new_v7();
            let p = partition_of_stream(stream, 97);
            assert!((0..97).contains(&p));
        }
    }

    #[test]
    fn roughly_uniform() {
        const P: i32 = 16;
        let mut counts = [0u32; P as usize];
        for _ in 0..20_000 {
            let stream = StreamId::new_v7();
            let p = partition_of_stream(stream, P);
            counts[p as usize] += 1;
        }
        let expected = 20_000.0 / P as f64;
        for count in counts {
            let ratio = count as f64 / expected;
            assert!(
                (0.5..1.5).contains(&ratio),
                "bucket count {count} too far from expected {expected}"
            );
        }
    }

    #[test]
    fn unstreamed_messages_still_land_somewhere() {
        let message = MessageId::new_v7();
        let p = partition_of_unstreamed_message(message, 10_000);
        assert!((0..10_000).contains(&p));
    }
}
