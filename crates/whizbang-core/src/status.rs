//! `MessageProcessingStatus` and `WorkBatchFlags` bit flags (spec.md §3.1).
//!
//! Modeled as transparent integer newtypes in the style of
//! `automations::TaskType`, rather than pulling in a flags crate: the
//! set of bits is small, fixed, and the only operations the coordinator
//! ever performs on them are bitwise OR and membership tests.

use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Bits of a message's lifecycle status. Multiple bits may be set at once;
/// a flush only ever ORs bits in (see `docs` in spec.md §4.3 step 5/6 and
/// the state-machine diagram under "Tie-breaks and edge-case policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(transparent)]
pub struct MessageProcessingStatus(pub i32);

impl MessageProcessingStatus {
    pub const STORED: Self = Self(1);
    pub const EVENT_STORED: Self = Self(2);
    pub const PUBLISHED: Self = Self(4);
    pub const HANDLER_INVOKED: Self = Self(8);
    pub const FAILED: Self = Self(0x8000);

    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn contains(self, bit: Self) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Terminal bit for the outbox lifecycle.
    pub const fn outbox_terminal() -> Self {
        Self::PUBLISHED
    }

    /// Terminal bit for the inbox lifecycle.
    pub const fn inbox_terminal() -> Self {
        Self::EVENT_STORED
    }
}

impl std::ops::BitOr for MessageProcessingStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for MessageProcessingStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

/// Flags on a single row of a returned `WorkBatch` (spec.md §3.1, §4.3 step 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(transparent)]
pub struct WorkBatchFlags(pub i32);

impl WorkBatchFlags {
    pub const NEWLY_STORED: Self = Self(1);
    pub const ORPHANED: Self = Self(2);
    pub const DEBUG_MODE: Self = Self(4);

    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn contains(self, bit: Self) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for WorkBatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_bits_coexist() {
        let status = MessageProcessingStatus::STORED
            | MessageProcessingStatus::EVENT_STORED
            | MessageProcessingStatus::PUBLISHED;

        assert!(status.contains(MessageProcessingStatus::STORED));
        assert!(status.contains(MessageProcessingStatus::EVENT_STORED));
        assert!(status.contains(MessageProcessingStatus::PUBLISHED));
        assert!(!status.contains(MessageProcessingStatus::FAILED));
    }

    #[test]
    fn union_is_monotone() {
        let a = MessageProcessingStatus::STORED;
        let b = a | MessageProcessingStatus::FAILED;
        // Once a bit is set, re-unioning with a subset never clears it.
        assert!((b | MessageProcessingStatus::STORED).contains(MessageProcessingStatus::FAILED));
    }
}
