//! # Event Envelope
//!
//! Platform-wide event envelope specification for all inter-stage
//! communication.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: one envelope shape for the entire pipeline
//! 2. **Strict v1**: extra fields are rejected; schema evolution uses v2
//!    streams, never in-place field changes
//! 3. **Tracing**: `trace_id` is propagated unchanged across derived events
//!
//! ## Envelope Fields
//!
//! - `event_id`: non-empty opaque string, globally unique (idempotency key)
//! - `trace_id`: non-empty string linking all events of one decision chain
//! - `produced_at`: timestamp with an explicit timezone offset
//! - `schema`: `<layer>.<entity>.<event>.v<major>` (doubles as stream name)
//! - `schema_version`: integer, must equal the major in `schema`
//! - `payload`: object, shape defined per schema in the registry
//! - `source_service`: optional producer name

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Required top-level envelope keys. Anything else (beyond [`OPTIONAL_KEYS`])
/// is rejected in v1.
pub const REQUIRED_KEYS: [&str; 6] = [
    "event_id",
    "trace_id",
    "produced_at",
    "schema",
    "schema_version",
    "payload",
];

/// Optional top-level envelope keys.
pub const OPTIONAL_KEYS: [&str; 1] = ["source_service"];

/// Why an envelope or payload failed validation.
///
/// The variant name doubles as the DLQ `error_kind` (see [`Self::kind`]).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(String),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("unknown field not allowed in v1: {0}")]
    UnknownField(String),

    #[error("field {field} must be {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },

    #[error("invalid timestamp in {field}: {reason}")]
    BadTimestamp { field: String, reason: String },

    #[error("schema_version {version} does not match schema {schema}")]
    VersionMismatch { schema: String, version: i64 },

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("envelope schema {schema} does not match target stream {stream}")]
    StreamMismatch { stream: String, schema: String },

    #[error("payload invalid at {path}: {reason}")]
    PayloadInvalid { path: String, reason: String },

    #[error("schema {0} already registered with different rules")]
    SchemaConflict(String),
}

impl ValidationError {
    /// Stable short name used as `error_kind` in DLQ payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "Malformed",
            ValidationError::NotAnObject => "NotAnObject",
            ValidationError::MissingField(_) => "MissingField",
            ValidationError::UnknownField(_) => "UnknownField",
            ValidationError::TypeMismatch { .. } => "TypeMismatch",
            ValidationError::BadTimestamp { .. } => "BadTimestamp",
            ValidationError::VersionMismatch { .. } => "VersionMismatch",
            ValidationError::UnknownSchema(_) => "UnknownSchema",
            ValidationError::StreamMismatch { .. } => "StreamMismatch",
            ValidationError::PayloadInvalid { .. } => "PayloadInvalid",
            ValidationError::SchemaConflict(_) => "SchemaConflict",
        }
    }
}

/// Standard event envelope following the platform event contract.
///
/// Immutable after append; consumers treat `event_id` as the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event identifier (idempotency key)
    pub event_id: String,

    /// Links all events derived from one upstream decision
    pub trace_id: String,

    /// When the event was produced; the offset is preserved on the wire
    pub produced_at: DateTime<FixedOffset>,

    /// Schema name of form `<layer>.<entity>.<event>.v<major>`
    pub schema: String,

    /// Must equal the major version encoded in `schema`
    pub schema_version: i64,

    /// Service that produced the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,

    /// Event-specific payload; shape is defined by `schema`
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope with a fresh `event_id` and the current time.
    ///
    /// `schema_version` is derived from the `.v<major>` suffix of `schema`;
    /// a malformed schema falls back to version 1 and is caught by
    /// validation on publish.
    pub fn new(schema: impl Into<String>, trace_id: impl Into<String>, payload: Value) -> Self {
        let schema = schema.into();
        let schema_version = schema_major(&schema).unwrap_or(1);
        Self {
            event_id: new_event_id(),
            trace_id: trace_id.into(),
            produced_at: Utc::now().fixed_offset(),
            schema,
            schema_version,
            source_service: None,
            payload,
        }
    }

    /// Create an envelope with an explicit `event_id` (useful for testing)
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Set the producing service name
    pub fn with_source_service(mut self, source_service: impl Into<String>) -> Self {
        self.source_service = Some(source_service.into());
        self
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ValidationError> {
        serde_json::to_vec(self).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Decode wire bytes into an envelope.
    ///
    /// Corrupt bytes or a structurally invalid envelope yield a
    /// [`ValidationError`], never a partially populated envelope. Payload
    /// rules are checked separately by the registry.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        validate_envelope_fields(&value)?;
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// The envelope as a JSON value (for validation and DLQ wrapping).
    pub fn to_value(&self) -> Result<Value, ValidationError> {
        serde_json::to_value(self).map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

/// Mint a new globally unique event id.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mint a new trace id for a fresh decision chain.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Extract the major version from a `.v<major>` schema suffix.
pub fn schema_major(schema: &str) -> Option<i64> {
    let idx = schema.rfind(".v")?;
    let digits = &schema[idx + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Strict v1 envelope-level validation.
///
/// Checks key strictness, per-field types, timezone presence on
/// `produced_at`, and `schema`/`schema_version` agreement. Payload rules are
/// the registry's job; timestamp *ordering* across events is a consumer
/// concern and is never rejected here.
pub fn validate_envelope_fields(value: &Value) -> Result<(), ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    for key in REQUIRED_KEYS {
        if !obj.contains_key(key) {
            return Err(ValidationError::MissingField(key.to_string()));
        }
    }
    for key in obj.keys() {
        if !REQUIRED_KEYS.contains(&key.as_str()) && !OPTIONAL_KEYS.contains(&key.as_str()) {
            return Err(ValidationError::UnknownField(key.clone()));
        }
    }

    require_str(obj, "event_id")?;
    require_str(obj, "trace_id")?;

    let produced_at = require_str(obj, "produced_at")?;
    parse_timestamp(produced_at, "produced_at")?;

    let schema = require_str(obj, "schema")?;
    let version = match obj.get("schema_version") {
        Some(v) => v.as_i64().ok_or(ValidationError::TypeMismatch {
            field: "schema_version".to_string(),
            expected: "integer",
        })?,
        None => return Err(ValidationError::MissingField("schema_version".to_string())),
    };
    match schema_major(schema) {
        // v1 is frozen: the declared integer and the schema suffix must agree.
        Some(major) if major == version && major >= 1 => {}
        _ => {
            return Err(ValidationError::VersionMismatch {
                schema: schema.to_string(),
                version,
            })
        }
    }

    if let Some(svc) = obj.get("source_service") {
        if !svc.is_string() {
            return Err(ValidationError::TypeMismatch {
                field: "source_service".to_string(),
                expected: "string",
            });
        }
    }

    match obj.get("payload") {
        Some(payload) if payload.is_object() => Ok(()),
        Some(_) => Err(ValidationError::TypeMismatch {
            field: "payload".to_string(),
            expected: "object",
        }),
        None => Err(ValidationError::MissingField("payload".to_string())),
    }
}

/// RFC 3339 parse; the format itself guarantees an explicit offset, which is
/// exactly the "timezone must be present" rule.
pub fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<FixedOffset>, ValidationError> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| ValidationError::BadTimestamp {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn require_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, ValidationError> {
    let value = obj
        .get(key)
        .and_then(Value::as_str)
        .ok_or(ValidationError::TypeMismatch {
            field: key.to_string(),
            expected: "non-empty string",
        })?;
    if value.trim().is_empty() {
        return Err(ValidationError::TypeMismatch {
            field: key.to_string(),
            expected: "non-empty string",
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_envelope() -> Value {
        json!({
            "event_id": "evt-1",
            "trace_id": "trace-1",
            "produced_at": "2026-01-01T10:00:00+08:00",
            "schema": "perception.heartbeat.v1",
            "schema_version": 1,
            "payload": {"status": "OK"}
        })
    }

    #[test]
    fn test_valid_envelope_fields() {
        assert!(validate_envelope_fields(&valid_envelope()).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let mut env = valid_envelope();
        env.as_object_mut().unwrap().remove("trace_id");
        assert_eq!(
            validate_envelope_fields(&env),
            Err(ValidationError::MissingField("trace_id".to_string()))
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut env = valid_envelope();
        env.as_object_mut()
            .unwrap()
            .insert("extra".to_string(), json!("nope"));
        assert_eq!(
            validate_envelope_fields(&env),
            Err(ValidationError::UnknownField("extra".to_string()))
        );
    }

    #[test]
    fn test_empty_event_id_rejected() {
        let mut env = valid_envelope();
        env.as_object_mut()
            .unwrap()
            .insert("event_id".to_string(), json!("   "));
        assert!(validate_envelope_fields(&env).is_err());
    }

    #[test]
    fn test_timestamp_without_offset_rejected() {
        let mut env = valid_envelope();
        env.as_object_mut()
            .unwrap()
            .insert("produced_at".to_string(), json!("2026-01-01T10:00:00"));
        assert!(matches!(
            validate_envelope_fields(&env),
            Err(ValidationError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_schema_version_disagreement_rejected() {
        let mut env = valid_envelope();
        env.as_object_mut()
            .unwrap()
            .insert("schema_version".to_string(), json!(2));
        assert!(matches!(
            validate_envelope_fields(&env),
            Err(ValidationError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_non_integer_schema_version_rejected() {
        let mut env = valid_envelope();
        env.as_object_mut()
            .unwrap()
            .insert("schema_version".to_string(), json!("1"));
        assert!(matches!(
            validate_envelope_fields(&env),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_schema_major_parsing() {
        assert_eq!(schema_major("risk.order.approved.v1"), Some(1));
        assert_eq!(schema_major("variables.market.computed.v12"), Some(12));
        assert_eq!(schema_major("no.version.suffix"), None);
        assert_eq!(schema_major("bad.vx1"), None);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let envelope = Envelope::new(
            "perception.heartbeat.v1",
            "trace-7",
            json!({"status": "OK"}),
        )
        .with_source_service("perception-service");

        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_corrupt_bytes_is_contract_violation() {
        let err = Envelope::decode(b"{not json").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_decode_preserves_offset() {
        let envelope = Envelope::decode(
            serde_json::to_vec(&valid_envelope()).unwrap().as_slice(),
        )
        .unwrap();
        assert_eq!(envelope.produced_at.offset().local_minus_utc(), 8 * 3600);
    }
}
