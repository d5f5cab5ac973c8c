//! Identifier newtypes used throughout the coordinator.
//!
//! `MessageId`, `StreamId`, and `InstanceId` all wrap a 128-bit [`uuid::Uuid`].
//! `MessageId` and `InstanceId` are always generated as UUIDv7 so that they
//! are time-ordered and monotonic within a single host (spec.md §3.1);
//! `StreamId` is caller-supplied and carries no ordering requirement of its
//! own.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::Type;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            pub fn from_uuid(id: uuid::Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(id: uuid::Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_newtype!(MessageId);
uuid_newtype!(StreamId);
uuid_newtype!(InstanceId);

impl InstanceId {
    /// Generates a fresh per-process identity. Called once at startup by a
    /// hosting binary; the core itself never calls this.
    pub fn generate() -> Self {
        Self::new_v7()
    }
}

impl MessageId {
    /// Derives a synthetic partitioning key for a message with no `streamId`
    /// (spec.md §4.1): such messages still need a partition to land in, but
    /// are not ordered relative to any other message.
    pub fn synthetic_partition_key(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// `PartitionNumber` is an integer in `[0, P)`. Stored as `i32` in Postgres
/// (no unsigned integer type), but always non-negative.
pub type PartitionNumber = i32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_time_ordered() {
        let a = MessageId::new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MessageId::new_v7();
        assert!(a < b, "UUIDv7 ids generated later must sort greater");
    }

    #[test]
    fn display_roundtrips_through_uuid_string() {
        let id = StreamId::new_v7();
        let text = id.to_string();
        let parsed: uuid::Uuid = text.parse().unwrap();
        assert_eq!(parsed, id.as_uuid());
    }
}
