//! The payload envelope (spec.md §6 "Payload envelope"): opaque to the
//! core, carried verbatim from producer to consumer. The core never
//! inspects `payload_bytes`/`metadata_bytes`; it only reads `message_id`,
//! `stream_id`, and `is_event` to drive coordination.

use crate::ids::{MessageId, StreamId};

/// A message handed to the coordinator for storage, or returned from it
/// as part of a work batch.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: MessageId,
    /// Fully qualified type name used by the *host* to dispatch the
    /// decoded payload to a handler. Opaque to the core.
    pub message_type: String,
    /// Name used to deserialize the envelope itself. Reader-side
    /// deserialization is keyed on this field; see
    /// [`normalize_envelope_type`] for the tolerance readers must apply.
    pub envelope_type: String,
    pub payload_bytes: Vec<u8>,
    pub metadata_bytes: Option<Vec<u8>>,
    pub stream_id: Option<StreamId>,
    pub is_event: bool,
}

/// Strips an assembly/module qualifier from an envelope type name,
/// leaving the bare type name.
///
/// Readers must tolerate both forms (spec.md §6): a bare name like
/// `OrderPlaced`, and a qualified name like
/// `MyCompany.Orders.OrderPlaced, MyCompany.Orders`. The qualifier, when
/// present, is separated from the type name by a comma; the type name
/// itself may still contain dots (namespace separators), so only the
/// first comma is significant.
pub fn normalize_envelope_type(raw: &str) -> &str {
    match raw.split_once(',') {
        Some((type_name, _assembly)) => type_name.trim(),
        None => raw.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_type_name_is_unchanged() {
        assert_eq!(normalize_envelope_type("OrderPlaced"), "OrderPlaced");
    }

    #[test]
    fn qualified_name_is_stripped_to_bare_type() {
        assert_eq!(
            normalize_envelope_type("MyCompany.Orders.OrderPlaced, MyCompany.Orders, Version=1.0.0"),
            "MyCompany.Orders.OrderPlaced"
        );
    }

    #[test]
    fn whitespace_around_segments_is_trimmed() {
        assert_eq!(
            normalize_envelope_type("  OrderPlaced ,  MyCompany.Orders "),
            "OrderPlaced"
        );
    }
}
