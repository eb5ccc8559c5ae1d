//! # Schema Registry
//!
//! Central registry of per-schema payload rules and the single entry point
//! for validation. Producers pre-check before append and consumers
//! re-validate on read with the same rules, so the contract has exactly one
//! source of truth.
//!
//! Registration is append-only: a schema's rules are frozen once registered;
//! re-registering with identical rules is a no-op, re-registering with
//! different rules fails with `SchemaConflict`. Changed semantics require a
//! new `v2` stream.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use serde_json::Value;

use crate::dlq;
use crate::envelope::{
    parse_timestamp, schema_major, validate_envelope_fields, Envelope, ValidationError,
};

const DEFAULT_MAX_STRING_LEN: usize = 4096;

/// Type rule for a single payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Non-empty string with a maximum length.
    Str { max_len: usize },
    /// RFC 3339 timestamp string with an explicit offset.
    Timestamp,
    Bool,
    Int,
    /// Finite number with optional inclusive bounds. NaN/±Inf never pass.
    Number { min: Option<f64>, max: Option<f64> },
    /// String restricted to a fixed set of values.
    Enum(Vec<&'static str>),
    /// Object; `Some(rules)` validates the nested shape, `None` is free-form.
    Object(Option<PayloadRules>),
}

impl FieldKind {
    /// Non-empty string with the default maximum length.
    pub fn str() -> Self {
        FieldKind::Str {
            max_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Unbounded finite number.
    pub fn number() -> Self {
        FieldKind::Number {
            min: None,
            max: None,
        }
    }

    /// Finite number with an inclusive lower bound.
    pub fn number_min(min: f64) -> Self {
        FieldKind::Number {
            min: Some(min),
            max: None,
        }
    }

    /// Finite number within an inclusive range.
    pub fn number_range(min: f64, max: f64) -> Self {
        FieldKind::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Free-form object (still must be an object).
    pub fn object() -> Self {
        FieldKind::Object(None)
    }

    fn expected(&self) -> &'static str {
        match self {
            FieldKind::Str { .. } => "non-empty string",
            FieldKind::Timestamp => "RFC 3339 timestamp",
            FieldKind::Bool => "boolean",
            FieldKind::Int => "integer",
            FieldKind::Number { .. } => "finite number",
            FieldKind::Enum(_) => "enum string",
            FieldKind::Object(_) => "object",
        }
    }
}

/// Declarative payload shape for one schema.
///
/// Strict like the envelope itself: payload keys outside the declared set
/// are rejected in v1.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PayloadRules {
    fields: BTreeMap<String, FieldRule>,
}

#[derive(Debug, Clone, PartialEq)]
struct FieldRule {
    required: bool,
    kind: FieldKind,
}

impl PayloadRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field.
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldRule {
                required: true,
                kind,
            },
        );
        self
    }

    /// Declare an optional field.
    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldRule {
                required: false,
                kind,
            },
        );
        self
    }

    /// Digest of the rule set, used for idempotent registration.
    pub fn digest(&self) -> u64 {
        // DefaultHasher::new() is keyed deterministically; the Debug
        // rendering is stable because the map is ordered.
        let mut hasher = DefaultHasher::new();
        format!("{:?}", self).hash(&mut hasher);
        hasher.finish()
    }

    /// Validate `payload` against these rules; `path` prefixes error
    /// locations (callers pass `"payload"`).
    pub fn check(&self, payload: &Value, path: &str) -> Result<(), ValidationError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| ValidationError::PayloadInvalid {
                path: path.to_string(),
                reason: "must be an object".to_string(),
            })?;

        for (name, rule) in &self.fields {
            match obj.get(name) {
                Some(value) => check_field(&rule.kind, value, &format!("{path}.{name}"))?,
                None if rule.required => {
                    return Err(ValidationError::PayloadInvalid {
                        path: format!("{path}.{name}"),
                        reason: "missing required field".to_string(),
                    })
                }
                None => {}
            }
        }
        for key in obj.keys() {
            if !self.fields.contains_key(key) {
                return Err(ValidationError::PayloadInvalid {
                    path: format!("{path}.{key}"),
                    reason: "unexpected field not allowed in v1".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn check_field(kind: &FieldKind, value: &Value, path: &str) -> Result<(), ValidationError> {
    let fail = |reason: String| {
        Err(ValidationError::PayloadInvalid {
            path: path.to_string(),
            reason,
        })
    };
    match kind {
        FieldKind::Str { max_len } => match value.as_str() {
            Some(s) if s.trim().is_empty() => fail("must be a non-empty string".to_string()),
            Some(s) if s.len() > *max_len => {
                fail(format!("string exceeds max length {max_len}"))
            }
            Some(_) => Ok(()),
            None => fail(format!("must be {}", kind.expected())),
        },
        FieldKind::Timestamp => match value.as_str() {
            Some(s) => parse_timestamp(s, path).map(|_| ()),
            None => fail(format!("must be {}", kind.expected())),
        },
        FieldKind::Bool => {
            if value.is_boolean() {
                Ok(())
            } else {
                fail(format!("must be {}", kind.expected()))
            }
        }
        FieldKind::Int => {
            if value.as_i64().is_some() {
                Ok(())
            } else {
                fail(format!("must be {}", kind.expected()))
            }
        }
        FieldKind::Number { min, max } => match value.as_f64() {
            Some(n) if !n.is_finite() => fail("must be a finite number".to_string()),
            Some(n) => {
                if let Some(min) = min {
                    if n < *min {
                        return fail(format!("must be >= {min}"));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return fail(format!("must be <= {max}"));
                    }
                }
                Ok(())
            }
            None => fail(format!("must be {}", kind.expected())),
        },
        FieldKind::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(()),
            Some(s) => fail(format!("must be one of {allowed:?}, got {s:?}")),
            None => fail(format!("must be {}", kind.expected())),
        },
        FieldKind::Object(rules) => {
            if !value.is_object() {
                return fail(format!("must be {}", kind.expected()));
            }
            match rules {
                Some(rules) => rules.check(value, path),
                None => Ok(()),
            }
        }
    }
}

struct Registered {
    rules: PayloadRules,
    digest: u64,
}

/// Append-only registry of schema → payload rules.
///
/// Constructed at startup and injected into producers and consumers; there
/// is no process-wide mutable default.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Registered>>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-loaded with every core pipeline stream (see
    /// [`crate::streams`]).
    pub fn with_core_streams() -> Self {
        let registry = Self::new();
        crate::streams::register_core_streams(&registry);
        registry
    }

    /// Register payload rules for a schema.
    ///
    /// Idempotent by rules digest; a duplicate registration with different
    /// rules fails with `SchemaConflict`.
    pub fn register(&self, schema: &str, rules: PayloadRules) -> Result<(), ValidationError> {
        if schema_major(schema).is_none() {
            return Err(ValidationError::VersionMismatch {
                schema: schema.to_string(),
                version: 0,
            });
        }
        let digest = rules.digest();
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = schemas.get(schema) {
            if existing.digest == digest && existing.rules == rules {
                return Ok(());
            }
            return Err(ValidationError::SchemaConflict(schema.to_string()));
        }
        schemas.insert(schema.to_string(), Registered { rules, digest });
        Ok(())
    }

    pub fn is_registered(&self, schema: &str) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(schema)
    }

    /// Full strict validation of a wire-level envelope value: envelope
    /// fields, schema/version agreement, and payload rules.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        validate_envelope_fields(value)?;

        // Checked by validate_envelope_fields; re-borrow without panicking.
        let schema = value
            .get("schema")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingField("schema".to_string()))?;
        let payload = value
            .get("payload")
            .ok_or(ValidationError::MissingField("payload".to_string()))?;

        if let Some(base) = schema.strip_prefix("dlq.") {
            // DLQ streams are themselves streams, but there is no DLQ of a
            // DLQ: such a schema cannot exist.
            if base.starts_with("dlq.") {
                return Err(ValidationError::UnknownSchema(schema.to_string()));
            }
            return dlq::dlq_rules().check(payload, "payload");
        }

        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let registered = schemas
            .get(schema)
            .ok_or_else(|| ValidationError::UnknownSchema(schema.to_string()))?;
        registered.rules.check(payload, "payload")
    }

    /// Validate wire bytes and decode into a typed [`Envelope`].
    pub fn validate_bytes(&self, bytes: &[u8]) -> Result<Envelope, ValidationError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.validate(&value)?;
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heartbeat_rules() -> PayloadRules {
        PayloadRules::new().field("status", FieldKind::str())
    }

    fn envelope_with(schema: &str, payload: Value) -> Value {
        json!({
            "event_id": "evt-1",
            "trace_id": "trace-1",
            "produced_at": "2026-01-01T10:00:00+08:00",
            "schema": schema,
            "schema_version": 1,
            "payload": payload
        })
    }

    #[test]
    fn test_register_is_idempotent_for_same_rules() {
        let registry = SchemaRegistry::new();
        registry
            .register("perception.heartbeat.v1", heartbeat_rules())
            .unwrap();
        registry
            .register("perception.heartbeat.v1", heartbeat_rules())
            .unwrap();
    }

    #[test]
    fn test_register_conflicting_rules_fails() {
        let registry = SchemaRegistry::new();
        registry
            .register("perception.heartbeat.v1", heartbeat_rules())
            .unwrap();
        let different = PayloadRules::new().field("status", FieldKind::Int);
        assert_eq!(
            registry.register("perception.heartbeat.v1", different),
            Err(ValidationError::SchemaConflict(
                "perception.heartbeat.v1".to_string()
            ))
        );
    }

    #[test]
    fn test_register_rejects_schema_without_version_suffix() {
        let registry = SchemaRegistry::new();
        assert!(registry
            .register("perception.heartbeat", heartbeat_rules())
            .is_err());
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let registry = SchemaRegistry::new();
        let env = envelope_with("nobody.home.v1", json!({}));
        assert_eq!(
            registry.validate(&env),
            Err(ValidationError::UnknownSchema("nobody.home.v1".to_string()))
        );
    }

    #[test]
    fn test_payload_missing_field() {
        let registry = SchemaRegistry::new();
        registry
            .register("perception.heartbeat.v1", heartbeat_rules())
            .unwrap();
        let env = envelope_with("perception.heartbeat.v1", json!({}));
        assert!(matches!(
            registry.validate(&env),
            Err(ValidationError::PayloadInvalid { path, .. }) if path == "payload.status"
        ));
    }

    #[test]
    fn test_payload_extra_field_rejected() {
        let registry = SchemaRegistry::new();
        registry
            .register("perception.heartbeat.v1", heartbeat_rules())
            .unwrap();
        let env = envelope_with(
            "perception.heartbeat.v1",
            json!({"status": "OK", "bonus": 1}),
        );
        assert!(registry.validate(&env).is_err());
    }

    #[test]
    fn test_number_range_enforced() {
        let rules = PayloadRules::new().field("score", FieldKind::number_range(0.0, 100.0));
        assert!(rules.check(&json!({"score": 55.5}), "payload").is_ok());
        assert!(rules.check(&json!({"score": 101.0}), "payload").is_err());
        assert!(rules.check(&json!({"score": -1}), "payload").is_err());
    }

    #[test]
    fn test_enum_membership() {
        let rules = PayloadRules::new().field("action", FieldKind::Enum(vec!["BUY", "SELL", "HOLD"]));
        assert!(rules.check(&json!({"action": "BUY"}), "payload").is_ok());
        assert!(rules.check(&json!({"action": "YOLO"}), "payload").is_err());
    }

    #[test]
    fn test_nested_object_rules() {
        let rules = PayloadRules::new().field(
            "order",
            FieldKind::Object(Some(
                PayloadRules::new()
                    .field("order_id", FieldKind::str())
                    .field("qty", FieldKind::number_min(0.0)),
            )),
        );
        assert!(rules
            .check(&json!({"order": {"order_id": "o-1", "qty": 10}}), "payload")
            .is_ok());
        let err = rules
            .check(&json!({"order": {"order_id": "o-1", "qty": -1}}), "payload")
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::PayloadInvalid { path, .. } if path == "payload.order.qty"
        ));
    }

    #[test]
    fn test_string_max_length() {
        let rules = PayloadRules::new().field("memo", FieldKind::Str { max_len: 4 });
        assert!(rules.check(&json!({"memo": "okay"}), "payload").is_ok());
        assert!(rules.check(&json!({"memo": "too long"}), "payload").is_err());
    }

    #[test]
    fn test_dlq_schema_validates_against_dlq_rules() {
        let registry = SchemaRegistry::new();
        let env = envelope_with(
            "dlq.perception.heartbeat.v1",
            json!({
                "original_stream": "perception.heartbeat.v1",
                "original_offset": "0-1",
                "original_envelope": {},
                "error_kind": "MissingField",
                "error_detail": "missing required field: trace_id",
                "attempts": 1
            }),
        );
        assert!(registry.validate(&env).is_ok());
    }

    #[test]
    fn test_dlq_of_dlq_is_rejected() {
        let registry = SchemaRegistry::new();
        let env = envelope_with("dlq.dlq.perception.heartbeat.v1", json!({}));
        assert!(matches!(
            registry.validate(&env),
            Err(ValidationError::UnknownSchema(_))
        ));
    }
}
