//! Bounded fetch orchestrator: retry, degrade and deadline behaviour
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::sync::Arc;
use std::time::Duration;

use modbridge::fetch::{FetchOutcome, FetchPolicy, TelemetryFetcher};
use modbridge::telemetry::SOURCE_TAG;
use tokio::time::Instant;
use tracing_test::traced_test;

use support::{wait_until, ReadStep, ScriptedConnector, DEVICE_ID};

fn fetcher(connector: &ScriptedConnector) -> TelemetryFetcher {
    TelemetryFetcher::new(
        Arc::new(connector.clone()),
        DEVICE_ID,
        FetchPolicy::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_connect_retried_until_success() {
    let connector = ScriptedConnector::new()
        .failing_connects(3)
        .reading(vec![230, 231, 229], vec![5, 6, 7]);
    let fetcher = fetcher(&connector);

    let started = Instant::now();
    let outcome = fetcher.fetch_once().await;

    assert_eq!(connector.connect_attempts(), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(45));
    let record = match outcome {
        FetchOutcome::Record(record) => record,
        other => panic!("expected a populated record, got {:?}", other),
    };
    assert_eq!(record.voltage(), &[230, 231, 229]);
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_connect_failures_are_logged_with_attempt_number() {
    let connector = ScriptedConnector::new().failing_connects(2);
    let fetcher = fetcher(&connector);

    fetcher.connect_with_retry().await;

    assert!(logs_contain("Modbus connection attempt #1 failed"));
    assert!(logs_contain("Modbus connection attempt #2 failed"));
    assert!(logs_contain("reachable after 3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_successful_read_matches_transport() {
    let connector = ScriptedConnector::new().reading(vec![-1, 0, 32767], vec![12, -12, 0]);
    let fetcher = fetcher(&connector);

    let started = Instant::now();
    let record = fetcher.fetch().await.unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(record.device_id(), DEVICE_ID);
    assert_eq!(record.voltage(), &[-1, 0, 32767]);
    assert_eq!(record.current(), &[12, -12, 0]);
    assert_eq!(record.source_tag(), SOURCE_TAG);
    assert!(!record.is_degraded());
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_voltage_read_error_degrades_after_backoff() {
    let connector = ScriptedConnector::new().then(ReadStep::Fail("illegal data address"));
    let fetcher = fetcher(&connector);

    let started = Instant::now();
    let outcome = fetcher.fetch_once().await;

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    let record = match outcome {
        FetchOutcome::Degraded(record) => record,
        other => panic!("expected a degraded record, got {:?}", other),
    };
    assert!(record.voltage().is_empty());
    assert!(record.current().is_empty());
    assert_eq!(record.source_tag(), "");
    // Current range is never attempted after a voltage failure
    assert_eq!(connector.reads(), 1);
    assert!(logs_contain("illegal data address"));
}

#[tokio::test(start_paused = true)]
async fn test_current_read_error_discards_voltage() {
    let connector = ScriptedConnector::new()
        .then(ReadStep::Values(vec![230, 231, 229]))
        .then(ReadStep::Fail("gateway target failed to respond"));
    let fetcher = fetcher(&connector);

    let record = fetcher.fetch().await.unwrap();

    assert!(record.is_degraded());
    assert!(record.voltage().is_empty());
    assert!(record.current().is_empty());
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_slow_read_is_abandoned_at_deadline() {
    let connector = ScriptedConnector::new()
        .then(ReadStep::Slow(Duration::from_secs(12), vec![1, 1, 1]))
        .then(ReadStep::Values(vec![2, 2, 2]));
    let fetcher = fetcher(&connector);

    let started = Instant::now();
    let outcome = fetcher.fetch_once().await;

    assert_eq!(outcome, FetchOutcome::TimedOut);
    assert_eq!(started.elapsed(), Duration::from_secs(9));
    assert!(logs_contain("Aborting modbus task"));

    // The abandoned read releases its connection and never reaches the current range
    wait_until(|| connector.sources_dropped() == 1).await;
    assert_eq!(connector.reads(), 1);
    assert_eq!(connector.remaining_steps(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retry_does_not_bleed_into_next_record() {
    let connector = ScriptedConnector::new()
        .then(ReadStep::Slow(Duration::from_secs(12), vec![9, 9, 9]))
        .reading(vec![230, 231, 229], vec![5, 6, 7]);
    let fetcher = fetcher(&connector);

    let started = Instant::now();
    let record = fetcher.fetch_until_record().await;

    // Retried immediately after the deadline
    assert_eq!(started.elapsed(), Duration::from_secs(9));
    assert_eq!(connector.connect_attempts(), 2);
    assert_eq!(record.voltage(), &[230, 231, 229]);
    assert_eq!(record.current(), &[5, 6, 7]);
    assert_eq!(record.source_tag(), SOURCE_TAG);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retry_delay_is_honoured() {
    let connector = ScriptedConnector::new()
        .then(ReadStep::Slow(Duration::from_secs(12), vec![9, 9, 9]))
        .reading(vec![1, 2, 3], vec![4, 5, 6]);
    let policy = FetchPolicy {
        timeout_retry_delay: Duration::from_secs(2),
        ..FetchPolicy::default()
    };
    let fetcher = TelemetryFetcher::new(Arc::new(connector.clone()), DEVICE_ID, policy);

    let started = Instant::now();
    let record = fetcher.fetch_until_record().await;

    assert_eq!(started.elapsed(), Duration::from_secs(11));
    assert_eq!(record.voltage(), &[1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_every_invocation_opens_a_fresh_connection() {
    let connector = ScriptedConnector::new()
        .reading(vec![1, 1, 1], vec![1, 1, 1])
        .reading(vec![2, 2, 2], vec![2, 2, 2]);
    let fetcher = fetcher(&connector);

    let first = fetcher.fetch().await.unwrap();
    let second = fetcher.fetch().await.unwrap();

    assert_eq!(first.voltage(), &[1, 1, 1]);
    assert_eq!(second.voltage(), &[2, 2, 2]);
    assert_eq!(connector.connect_attempts(), 2);
    wait_until(|| connector.sources_dropped() == 2).await;
}
