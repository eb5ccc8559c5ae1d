//! Replay harness tests against the in-repo golden-event corpus.

use std::path::PathBuf;
use std::sync::Arc;

use event_bus::{InMemoryLog, SchemaRegistry};
use golden_replay::{load_fixtures, run_replay, Expected, ReplayError, ReplayMode};

fn golden_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("contracts")
        .join("golden_events")
        .join("v1")
}

#[test]
fn test_corpus_loads_in_lexicographic_order() {
    let fixtures = load_fixtures(&golden_dir()).unwrap();
    assert!(fixtures.len() >= 14, "corpus unexpectedly small");

    let names: Vec<String> = fixtures
        .iter()
        .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    // The expected tag never survives into the envelope.
    for fixture in &fixtures {
        assert!(fixture.envelope.get("expected").is_none());
    }
}

#[test]
fn test_corpus_covers_required_dirty_cases() {
    let fixtures = load_fixtures(&golden_dir()).unwrap();
    let invalid: Vec<String> = fixtures
        .iter()
        .filter(|f| f.expected == Expected::Invalid)
        .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
        .collect();

    for marker in [
        "missing_trace_id",
        "unknown_field",
        "price_zero",
        "negative_volume",
        "wrong_schema_version",
    ] {
        assert!(
            invalid.iter().any(|name| name.contains(marker)),
            "corpus lacks a {marker} fixture"
        );
    }

    // Duplicate event_id pair: both structurally valid, dedup is the
    // consumer's job.
    let duplicates: Vec<&golden_replay::Fixture> = fixtures
        .iter()
        .filter(|f| {
            f.envelope["event_id"]
                .as_str()
                .map(|id| id == "evt-dup-0001")
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(duplicates.len(), 2);
    assert!(duplicates.iter().all(|f| f.expected == Expected::Valid));
}

#[tokio::test]
async fn test_every_fixture_classifies_as_expected() {
    let registry = SchemaRegistry::with_core_streams();
    let summary = run_replay(&golden_dir(), ReplayMode::SkipInvalid, &registry, None)
        .await
        .unwrap();

    assert_eq!(summary.failed, 0, "classification mismatches: {summary:?}");
    assert_eq!(summary.total, summary.valid + summary.invalid);
    assert_eq!(summary.invalid, 5);
    assert_eq!(summary.skipped, 5);
    assert_eq!(summary.published, 0, "dry run publishes nothing");
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let registry = SchemaRegistry::with_core_streams();
    let first = run_replay(&golden_dir(), ReplayMode::SkipInvalid, &registry, None)
        .await
        .unwrap();
    let second = run_replay(&golden_dir(), ReplayMode::SkipInvalid, &registry, None)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_skip_invalid_publishes_only_valid_fixtures() {
    let registry = SchemaRegistry::with_core_streams();
    let log = Arc::new(InMemoryLog::new());
    let summary = run_replay(
        &golden_dir(),
        ReplayMode::SkipInvalid,
        &registry,
        Some(log.clone()),
    )
    .await
    .unwrap();

    assert_eq!(summary.published, summary.valid);
    // Streams are derived from each envelope's schema field.
    assert!(!log.entries("perception.market_data.collected.v1").is_empty());
    assert!(!log.entries("risk.order.approved.v1").is_empty());
    assert!(log
        .stream_names()
        .iter()
        .all(|name| !name.starts_with("dlq.")));
}

#[tokio::test]
async fn test_include_invalid_publishes_dirty_fixtures_verbatim() {
    let registry = SchemaRegistry::with_core_streams();
    let log = Arc::new(InMemoryLog::new());
    let summary = run_replay(
        &golden_dir(),
        ReplayMode::IncludeInvalid,
        &registry,
        Some(log.clone()),
    )
    .await
    .unwrap();

    assert_eq!(summary.published, summary.total);
    assert_eq!(summary.skipped, 0);

    // The missing-trace_id fixture went out exactly as it was on disk.
    let dirty = log
        .entries("perception.market_data.collected.v1")
        .iter()
        .map(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).unwrap())
        .find(|v| v.get("trace_id").is_none());
    assert!(dirty.is_some(), "dirty fixture must be appended verbatim");
}

#[tokio::test]
async fn test_fail_on_invalid_aborts() {
    let registry = SchemaRegistry::with_core_streams();
    let result = run_replay(&golden_dir(), ReplayMode::FailOnInvalid, &registry, None).await;
    assert!(matches!(result, Err(ReplayError::InvalidFixture(_))));
}
