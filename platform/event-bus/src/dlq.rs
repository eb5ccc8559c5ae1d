//! Dead Letter Queue envelopes
//!
//! Failed events are never silently dropped: the original bytes are wrapped
//! with diagnostic context and appended to `dlq.<stream>`. DLQ streams are
//! ordinary streams with a fixed payload shape, but they have no DLQs of
//! their own: their consumers log and drop on failure.

use serde_json::{json, Value};

use crate::envelope::{new_event_id, Envelope, ValidationError};
use crate::log::Offset;
use crate::registry::{FieldKind, PayloadRules};

/// Name of the DLQ for `stream`.
pub fn dlq_stream(stream: &str) -> String {
    format!("dlq.{stream}")
}

pub fn is_dlq_stream(stream: &str) -> bool {
    stream.starts_with("dlq.")
}

/// Payload shape shared by every `dlq.*` schema.
pub fn dlq_rules() -> PayloadRules {
    PayloadRules::new()
        .field("original_stream", FieldKind::str())
        .field("original_offset", FieldKind::str())
        .field("original_envelope", FieldKind::object())
        .field("error_kind", FieldKind::str())
        .field("error_detail", FieldKind::str())
        .field("attempts", FieldKind::Int)
}

/// Wrap a failed event for its DLQ.
///
/// The wrapper gets a fresh `event_id`; `trace_id` is inherited from the
/// original when the bytes still parse, so the decision chain stays
/// traceable even for dirty events.
pub fn wrap_dlq(
    original_stream: &str,
    original_offset: Offset,
    original_bytes: &[u8],
    error_kind: &str,
    error_detail: &str,
    attempts: u32,
) -> Envelope {
    let parsed: Option<Value> = serde_json::from_slice(original_bytes).ok();

    let trace_id = parsed
        .as_ref()
        .and_then(|v| v.get("trace_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    let original_envelope = match parsed {
        Some(value @ Value::Object(_)) => value,
        // Corrupt or non-object input is still preserved, lossily.
        _ => json!({ "raw": String::from_utf8_lossy(original_bytes) }),
    };

    Envelope {
        event_id: new_event_id(),
        trace_id,
        produced_at: chrono::Utc::now().fixed_offset(),
        schema: dlq_stream(original_stream),
        schema_version: 1,
        source_service: None,
        payload: json!({
            "original_stream": original_stream,
            "original_offset": original_offset.to_string(),
            "original_envelope": original_envelope,
            "error_kind": error_kind,
            "error_detail": error_detail,
            "attempts": attempts,
        }),
    }
}

/// Convenience for wrapping a validation failure.
pub fn wrap_validation_failure(
    original_stream: &str,
    original_offset: Offset,
    original_bytes: &[u8],
    error: &ValidationError,
    attempts: u32,
) -> Envelope {
    wrap_dlq(
        original_stream,
        original_offset,
        original_bytes,
        error.kind(),
        &error.to_string(),
        attempts,
    )
}
