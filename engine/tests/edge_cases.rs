//! Edge case tests for closet-engine
//!
//! These tests cover boundary conditions and unusual inputs across modules.

use closet_engine::{
    batch_export, execute_batch, merge_items, merge_with_report, retry_with_backoff,
    retry_with_backoff_if, AttemptError, BatchOptions, BatchResult, CircuitBreaker, CircuitConfig, CircuitError, CircuitState, Error,
    ExportFormat, ManualClock, MockTransport, Record, RetryOptions, SessionStatus, SessionSync,
    SyncOutcome, TtlCache,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn record(id: &str, at: u64) -> Record {
    Record::new(id, at, json!({ "name": id }))
}

fn ids(records: &[Record]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

// ============================================================================
// Record Edge Cases
// ============================================================================

#[test]
fn record_without_updated_at_defaults_to_zero() {
    let record = Record::from_value(json!({"id": "a", "name": "Tee"})).unwrap();
    assert_eq!(record.updated_at, 0);
    assert_eq!(record.field("name"), Some(&json!("Tee")));
}

#[test]
fn record_keeps_unknown_fields_through_a_round_trip() {
    let input = json!({
        "id": "look-1",
        "ownerId": "alice",
        "updatedAt": 1700000000000u64,
        "items": ["a", "b"],
        "meta": {"season": "fall", "score": 0.5}
    });

    let record = Record::from_value(input.clone()).unwrap();
    assert_eq!(record.owner_id.as_deref(), Some("alice"));
    assert_eq!(serde_json::to_value(&record).unwrap(), input);
}

#[test]
fn record_rejects_non_objects_and_blank_ids() {
    assert!(matches!(
        Record::from_value(json!(["a"])),
        Err(Error::InvalidPayload(_))
    ));
    assert!(matches!(
        Record::from_value(json!({"id": "   "})),
        Err(Error::InvalidRecord(_))
    ));
    assert!(Record::from_value(json!({"name": "no id"})).is_err());
}

#[test]
fn unicode_ids_merge_like_any_other() {
    let server = vec![record("日本語", 1), record("🎉", 2)];
    let local = vec![record("日本語", 3), record("Привет", 0)];

    let merged = merge_items(server, local);

    assert_eq!(ids(&merged), vec!["日本語", "🎉", "Привет"]);
}

// ============================================================================
// Merge Edge Cases
// ============================================================================

#[test]
fn merge_of_two_empty_collections_is_empty() {
    let outcome = merge_with_report(Vec::<Record>::new(), Vec::new());
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.report.total(), 0);
    assert!(!outcome.report.server_changed());
}

#[test]
fn tie_keeps_server_payload() {
    let server = vec![Record::new("a", 100, json!({"color": "server"}))];
    let local = vec![Record::new("a", 100, json!({"color": "local"}))];

    let merged = merge_items(server, local);

    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].field("color"), Some(&json!("server")));
}

#[test]
fn local_only_records_survive_with_zero_timestamps() {
    let server = vec![record("s", 50)];
    let local = vec![record("l1", 0), record("l2", 0)];

    let outcome = merge_with_report(server, local);

    assert_eq!(outcome.report.local_only, 2);
    assert_eq!(ids(&outcome.records), vec!["s", "l1", "l2"]);
}

#[test]
fn merging_twice_changes_nothing() {
    let server = vec![record("a", 3), record("b", 1)];
    let local = vec![record("a", 5), record("c", 2)];

    let once = merge_items(server, local);
    let twice = merge_items(once.clone(), once.clone());

    assert_eq!(once, twice);
}

#[test]
fn merge_preserves_owner_and_payload_of_winner() {
    let server = vec![record("a", 1).with_owner("alice")];
    let local = vec![Record::new("a", 2, json!({"name": "edited"}))];

    let merged = merge_items(server, local);

    assert_eq!(merged[0].owner_id, None);
    assert_eq!(merged[0].field("name"), Some(&json!("edited")));
}

// ============================================================================
// Cache Edge Cases
// ============================================================================

#[test]
fn zero_ttl_is_visible_until_the_clock_moves() {
    let clock = ManualClock::new(500);
    let cache = TtlCache::with_clock(Duration::from_secs(1), clock.clone());

    cache.set("k", 1u32, Duration::ZERO);
    assert_eq!(cache.get("k"), Some(1));

    clock.advance(1);
    assert_eq!(cache.get("k"), None);
}

#[test]
fn cache_shared_between_threads() {
    let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    cache.insert(format!("{n}:{i}"), i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), 800);
    assert_eq!(cache.get("7:99"), Some(99));
}

// ============================================================================
// Retry Edge Cases
// ============================================================================

#[tokio::test(start_paused = true)]
async fn zero_retries_means_one_attempt() {
    let calls = AtomicUsize::new(0);

    let outcome = retry_with_backoff(
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("network unreachable") }
        },
        &RetryOptions::none(),
    )
    .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_cancels_a_hung_attempt() {
    let options = RetryOptions::none().with_timeout(Duration::from_millis(50));

    let outcome = retry_with_backoff(
        || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(())
        },
        &options,
    )
    .await;

    let err = outcome.into_result().unwrap_err();
    assert!(err.to_string().contains("timeout"));
}

// ============================================================================
// Circuit Breaker Edge Cases
// ============================================================================

#[tokio::test]
async fn breaker_shared_across_tasks() {
    let clock = ManualClock::new(0);
    let breaker = Arc::new(CircuitBreaker::with_clock(
        "shared",
        CircuitConfig::new(3, 1, Duration::from_secs(30)),
        clock,
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            breaker
                .execute(|| async { Err::<(), _>("refused") })
                .await
        }));
    }

    let mut rejected = 0;
    for handle in handles {
        if let Err(CircuitError::Open { .. }) = handle.await.unwrap() {
            rejected += 1;
        }
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.failures() + breaker.rejections(), 10);
    assert_eq!(rejected as u64, breaker.rejections());
    assert!(breaker.failures() >= 3);
}

#[tokio::test(start_paused = true)]
async fn retried_timeouts_trip_the_breaker() {
    let breaker = CircuitBreaker::with_clock(
        "slow",
        CircuitConfig::new(3, 1, Duration::from_secs(30)),
        ManualClock::new(0),
    );
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let options = RetryOptions::default()
        .with_max_retries(5)
        .with_initial_delay(Duration::from_millis(10))
        .without_jitter();

    let outcome = retry_with_backoff_if(
        || {
            breaker.execute_with_timeout(Duration::from_millis(50), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            })
        },
        &options,
        |err: &AttemptError<CircuitError<AttemptError<String>>>| {
            matches!(err, AttemptError::Failed(CircuitError::Inner(_)))
        },
    )
    .await;

    // Three timeouts open the circuit, the fourth attempt is shed
    assert_eq!(outcome.attempts, 4);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.failures(), 3);
    assert_eq!(breaker.rejections(), 1);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(matches!(
        outcome.result,
        Err(AttemptError::Failed(CircuitError::Open { .. }))
    ));
}

// ============================================================================
// Batch Edge Cases
// ============================================================================

#[tokio::test]
async fn parallelism_larger_than_batch_size() {
    let items: Vec<u32> = (0..7).collect();

    let result: BatchResult<u32, ()> =
        execute_batch(&items, |&n| async move { Ok(n) }, BatchOptions::new(2, 50)).await;

    let mut values = result.successful;
    values.sort_unstable();
    assert_eq!(values, items);
}

#[tokio::test]
async fn every_item_failing_still_resolves() {
    let items = vec!["a", "b", "c"];

    let result: BatchResult<(), String> = execute_batch(
        &items,
        |item| {
            let item = item.to_string();
            async move { Err(format!("{item} failed")) }
        },
        BatchOptions::default(),
    )
    .await;

    assert_eq!(result.total, 3);
    assert!(result.successful.is_empty());
    let mut indices = result.failed_indices();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn csv_export_of_records() {
    let records = vec![
        Record::new("a", 1, json!({"name": "Oxford, blue"})),
        Record::new("b", 2, json!({"name": "Chino"})),
    ];

    let csv = batch_export(&records, ExportFormat::Csv).unwrap();
    let mut lines = csv.lines();

    let header = lines.next().unwrap();
    assert!(header.contains("id"));
    assert!(header.contains("name"));
    assert!(csv.contains("\"Oxford, blue\""));
    assert_eq!(lines.count(), 2);
}

// ============================================================================
// Session Edge Cases
// ============================================================================

#[tokio::test]
async fn session_over_a_shared_transport() {
    let transport = Arc::new(MockTransport::with_server_items(vec![record("a", 1)]));
    let first = SessionSync::new(transport.clone());
    let second = SessionSync::new(transport.clone());

    let outcome = first
        .run(&SessionStatus::authenticated("alice"), vec![record("b", 2)], |_| {})
        .await;
    assert!(outcome.is_synced());

    let mut seen = Vec::new();
    let outcome = second
        .run(&SessionStatus::authenticated("alice"), vec![], |merged| {
            seen = merged.to_vec()
        })
        .await;

    assert!(matches!(outcome, SyncOutcome::Synced(_)));
    assert_eq!(ids(&seen), vec!["b", "a"]);
    assert_eq!(transport.fetch_calls(), 2);
}
