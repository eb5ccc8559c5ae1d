//! Golden-event replay harness.
//!
//! Deterministic contract tests: a corpus of fixture envelopes (valid and
//! deliberately dirty) is classified against the schema registry and,
//! depending on the mode, published into the streams its `schema` fields
//! name. Each fixture declares its own verdict in a test-only `expected`
//! field, which is stripped before classification and publish.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use event_bus::{SchemaRegistry, StreamLog};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to read fixtures: {0}")]
    Io(#[from] std::io::Error),

    #[error("fixture {path}: {reason}")]
    BadFixture { path: String, reason: String },

    #[error("no golden events found under {0}")]
    EmptyCorpus(String),

    #[error("store unreachable: {0}")]
    StoreUnavailable(String),

    #[error("invalid fixture rejected by fail_on_invalid: {0}")]
    InvalidFixture(String),
}

/// What to do with fixtures that fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    /// Count invalid fixtures but do not append them.
    #[default]
    SkipInvalid,
    /// Abort on the first invalid fixture.
    FailOnInvalid,
    /// Append invalid fixtures verbatim, to exercise consumer-side DLQ
    /// behavior.
    IncludeInvalid,
}

impl FromStr for ReplayMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "skip_invalid" => Ok(ReplayMode::SkipInvalid),
            "fail_on_invalid" => Ok(ReplayMode::FailOnInvalid),
            "include_invalid" => Ok(ReplayMode::IncludeInvalid),
            other => Err(format!("unknown replay mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Valid,
    Invalid,
}

/// One fixture file, with `expected` already stripped out of the envelope.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub path: PathBuf,
    pub expected: Expected,
    pub envelope: Value,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub published: usize,
    pub skipped: usize,
    /// Fixtures whose classification disagreed with their `expected` tag.
    pub failed: usize,
}

/// Load fixtures in stable lexicographic order.
pub fn load_fixtures(dir: &Path) -> Result<Vec<Fixture>, ReplayError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("json")
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(ReplayError::EmptyCorpus(dir.display().to_string()));
    }

    let mut fixtures = Vec::with_capacity(paths.len());
    for path in paths {
        let display = path.display().to_string();
        let contents = fs::read_to_string(&path)?;
        let mut envelope: Value =
            serde_json::from_str(&contents).map_err(|e| ReplayError::BadFixture {
                path: display.clone(),
                reason: e.to_string(),
            })?;

        let expected = envelope
            .as_object_mut()
            .and_then(|obj| obj.remove("expected"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ReplayError::BadFixture {
                path: display.clone(),
                reason: "missing test-only field 'expected'".to_string(),
            })?;
        let expected = match expected.as_str() {
            "valid" => Expected::Valid,
            "invalid" => Expected::Invalid,
            other => {
                return Err(ReplayError::BadFixture {
                    path: display,
                    reason: format!("expected must be 'valid' or 'invalid', got '{other}'"),
                })
            }
        };

        fixtures.push(Fixture {
            path,
            expected,
            envelope,
        });
    }
    Ok(fixtures)
}

/// Classify every fixture and publish per the mode. `log` is `None` for a
/// dry run (classification only).
pub async fn run_replay(
    fixture_dir: &Path,
    mode: ReplayMode,
    registry: &SchemaRegistry,
    log: Option<Arc<dyn StreamLog>>,
) -> Result<ReplaySummary, ReplayError> {
    let fixtures = load_fixtures(fixture_dir)?;
    let mut summary = ReplaySummary {
        total: fixtures.len(),
        ..ReplaySummary::default()
    };

    for fixture in fixtures {
        let name = fixture
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| fixture.path.display().to_string());

        let verdict = registry.validate(&fixture.envelope);
        let classified_valid = verdict.is_ok();

        match (fixture.expected, classified_valid) {
            (Expected::Valid, true) | (Expected::Invalid, false) => {}
            (Expected::Valid, false) => {
                summary.failed += 1;
                tracing::error!(
                    fixture = %name,
                    error = %verdict.unwrap_err(),
                    "fixture expected valid but was rejected"
                );
            }
            (Expected::Invalid, true) => {
                summary.failed += 1;
                tracing::error!(
                    fixture = %name,
                    "fixture expected invalid but was accepted"
                );
            }
        }

        if classified_valid {
            summary.valid += 1;
        } else {
            summary.invalid += 1;
            if mode == ReplayMode::FailOnInvalid {
                return Err(ReplayError::InvalidFixture(name));
            }
            if mode == ReplayMode::SkipInvalid {
                summary.skipped += 1;
                tracing::info!(fixture = %name, "skip-invalid");
                continue;
            }
        }

        // Target stream comes from the envelope itself, never from config.
        if let Some(log) = &log {
            let stream = fixture
                .envelope
                .get("schema")
                .and_then(Value::as_str)
                .unwrap_or("unknown.v1")
                .to_string();
            let bytes =
                serde_json::to_vec(&fixture.envelope).map_err(|e| ReplayError::BadFixture {
                    path: name.clone(),
                    reason: e.to_string(),
                })?;
            log.append(&stream, bytes)
                .await
                .map_err(|e| ReplayError::StoreUnavailable(e.to_string()))?;
            summary.published += 1;
            tracing::info!(fixture = %name, stream = %stream, "published");
        }
    }

    Ok(summary)
}
