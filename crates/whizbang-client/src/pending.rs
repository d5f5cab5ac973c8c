//! Accumulates producer inserts and prior-batch results between flushes
//! (spec.md §4.2: "The client batches producer inserts and prior-batch
//! results").

use whizbang_core::{
    Completion, Failure, MessageId, NewInboxMessage, NewOutboxMessage, PerspectiveOutcome,
    ProcessWorkBatchInput, ReceptorOutcome,
};

#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    input: ProcessWorkBatchInput,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        let completions = &self.input.completions;
        let failures = &self.input.failures;
        let new_messages = &self.input.new_messages;
        let renewals = &self.input.lease_renewals;

        completions.outbox.len()
            + completions.inbox.len()
            + completions.receptor.len()
            + completions.perspective.len()
            + failures.outbox.len()
            + failures.inbox.len()
            + failures.receptor.len()
            + failures.perspective.len()
            + new_messages.outbox.len()
            + new_messages.inbox.len()
            + renewals.outbox.len()
            + renewals.inbox.len()
    }

    pub fn push_new_outbox(&mut self, message: NewOutboxMessage) {
        self.input.new_messages.outbox.push(message);
    }

    pub fn push_new_inbox(&mut self, message: NewInboxMessage) {
        self.input.new_messages.inbox.push(message);
    }

    pub fn push_outbox_completion(&mut self, completion: Completion) {
        self.input.completions.outbox.push(completion);
    }

    pub fn push_inbox_completion(&mut self, completion: Completion) {
        self.input.completions.inbox.push(completion);
    }

    pub fn push_outbox_failure(&mut self, failure: Failure) {
        self.input.failures.outbox.push(failure);
    }

    pub fn push_inbox_failure(&mut self, failure: Failure) {
        self.input.failures.inbox.push(failure);
    }

    pub fn push_receptor_completion(&mut self, outcome: ReceptorOutcome) {
        self.input.completions.receptor.push(outcome);
    }

    pub fn push_receptor_failure(&mut self, outcome: ReceptorOutcome) {
        self.input.failures.receptor.push(outcome);
    }

    pub fn push_perspective_completion(&mut self, outcome: PerspectiveOutcome) {
        self.input.completions.perspective.push(outcome);
    }

    pub fn push_perspective_failure(&mut self, outcome: PerspectiveOutcome) {
        self.input.failures.perspective.push(outcome);
    }

    pub fn renew_outbox_lease(&mut self, message_id: MessageId) {
        self.input.lease_renewals.outbox.push(message_id);
    }

    pub fn renew_inbox_lease(&mut self, message_id: MessageId) {
        self.input.lease_renewals.inbox.push(message_id);
    }

    /// Hands over everything accumulated so far, resetting to empty. Only
    /// the flush path calls this.
    pub fn take(&mut self) -> ProcessWorkBatchInput {
        std::mem::take(&mut self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outbox_message() -> NewOutboxMessage {
        NewOutboxMessage {
            message_id: MessageId::new_v7(),
            destination: "orders.topic".to_string(),
            message_type: "OrderPlaced".to_string(),
            payload: Vec::new(),
            metadata: None,
            scope: None,
            stream_id: None,
            is_event: false,
            event_type: None,
            aggregate_id: None,
            aggregate_type: None,
        }
    }

    #[test]
    fn len_counts_across_all_lists() {
        let mut pending = PendingBatch::default();
        assert_eq!(pending.len(), 0);

        pending.push_new_outbox(sample_outbox_message());
        pending.renew_outbox_lease(MessageId::new_v7());
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn take_resets_to_empty() {
        let mut pending = PendingBatch::default();
        pending.push_new_outbox(sample_outbox_message());

        let input = pending.take();
        assert_eq!(input.new_messages.outbox.len(), 1);
        assert_eq!(pending.len(), 0);
    }
}
