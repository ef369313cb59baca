//! Connection Lifecycle Tests
//!
//! Discovery ordering, the retry bound, backoff timing, validate-before-reuse
//! and manual teardown, driven through scripted driver and prober doubles.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{affected, cache, config, quick_retry, rows, ScriptedDriver, ScriptedProber, HOST};
use dbreach::{acquire, discover, BackoffPolicy, CacheState, DbReachError, DiscoverySettings, RetryPolicy};

// ============================================================================
// Port discovery
// ============================================================================

#[tokio::test]
async fn test_discovery_stops_at_first_accepting_port() {
    let driver = ScriptedDriver::accepting(&[30015]);
    let prober = ScriptedProber::reachable(&[443, 30015, 39015, 30013]);
    let settings = DiscoverySettings::with_fallbacks(vec![30015, 39015, 30013]);

    let report = discover(&driver, &prober, &config(443), &settings, Duration::from_secs(5)).await;

    assert_eq!(report.discovered, Some(30015));
    assert_eq!(prober.probed(), vec![443, 30015]);
    assert_eq!(driver.state().connects, vec![443, 30015]);
    // Throwaway connection released immediately
    assert_eq!(driver.state().closed, vec![1]);
}

#[tokio::test]
async fn test_discovery_skips_driver_for_unreachable_candidates() {
    let driver = ScriptedDriver::accepting(&[443, 39015]);
    let prober = ScriptedProber::reachable(&[39015]);
    let settings = DiscoverySettings::with_fallbacks(vec![30015, 39015, 30013]);

    let report = discover(&driver, &prober, &config(443), &settings, Duration::from_secs(5)).await;

    assert_eq!(report.discovered, Some(39015));
    assert_eq!(driver.state().connects, vec![39015]);

    let attempted: Vec<bool> = report.candidates.iter().map(|c| c.driver_attempted).collect();
    assert_eq!(attempted, vec![false, false, true]);
    assert!(report.candidates[0].probe_error.as_deref().unwrap().contains("refused"));
}

#[tokio::test]
async fn test_discovery_deduplicates_configured_port() {
    let driver = ScriptedDriver::default();
    let prober = ScriptedProber::reachable(&[]);
    let settings = DiscoverySettings::with_fallbacks(vec![5432, 6432, 5432, 5433]);

    let report = discover(&driver, &prober, &config(5432), &settings, Duration::from_secs(5)).await;

    assert_eq!(report.discovered, None);
    assert_eq!(report.effective_port(), 5432);
    assert_eq!(prober.probed(), vec![5432, 6432, 5433]);
}

#[tokio::test]
async fn test_discovery_records_driver_rejection() {
    let driver = ScriptedDriver::accepting(&[]);
    let prober = ScriptedProber::reachable(&[443]);
    let settings = DiscoverySettings::with_fallbacks(Vec::<u16>::new());

    let report = discover(&driver, &prober, &config(443), &settings, Duration::from_secs(5)).await;

    assert_eq!(report.discovered, None);
    let outcome = &report.candidates[0];
    assert!(outcome.reachable);
    assert!(outcome.driver_attempted);
    assert!(!outcome.accepted);
    assert!(outcome.driver_error.as_deref().unwrap().contains("does not speak the protocol"));
}

// ============================================================================
// Acquirer
// ============================================================================

#[tokio::test]
async fn test_acquire_makes_exactly_max_attempts_calls() {
    let driver = ScriptedDriver::accepting(&[]);

    let err = acquire(&driver, &config(443), &quick_retry(3)).await.unwrap_err();

    assert_eq!(driver.state().connects.len(), 3);
    assert_eq!(err.error_code(), "CONNECTION_EXHAUSTED");
}

#[tokio::test]
async fn test_acquire_single_call_on_success() {
    let driver = ScriptedDriver::accepting(&[443]);

    let session = acquire(&driver, &config(443), &quick_retry(3)).await.unwrap();

    assert_eq!(session.id, 1);
    assert_eq!(driver.state().connects, vec![443]);
}

#[tokio::test]
async fn test_acquire_recovers_after_transient_failures() {
    let driver = ScriptedDriver::accepting(&[443]);
    driver.state().fail_next = 2;

    let session = acquire(&driver, &config(443), &quick_retry(3)).await.unwrap();

    assert_eq!(session.id, 1);
    assert_eq!(driver.state().connects.len(), 3);
}

#[tokio::test]
async fn test_exhaustion_keeps_attempt_count_and_last_error() {
    let driver = ScriptedDriver::accepting(&[]);

    let err = acquire(&driver, &config(443), &quick_retry(4)).await.unwrap_err();

    let DbReachError::ConnectionExhausted(exhausted) = &err else {
        panic!("expected ConnectionExhausted, got {err:?}");
    };
    assert_eq!(exhausted.attempts, 4);
    assert_eq!(exhausted.target, format!("{HOST}:443"));
    assert!(exhausted.last_error().contains("does not speak the protocol"));
    assert_eq!(exhausted.history.len(), 4);
    assert!(exhausted.history[3].backoff.is_none());

    let details = err.details().unwrap();
    assert!(details[0].starts_with("attempt 1/4:"));
    assert!(details.iter().all(|line| !line.contains("s3cret")));
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_timing() {
    let driver = ScriptedDriver::accepting(&[]);
    let policy = RetryPolicy { max_attempts: 3, base_backoff: Duration::from_millis(100), ..RetryPolicy::default() };

    let started = tokio::time::Instant::now();
    let _ = acquire(&driver, &config(443), &policy).await;
    let elapsed = started.elapsed();

    // 100ms + 200ms, nothing after the final attempt
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_linear_backoff_timing() {
    let driver = ScriptedDriver::accepting(&[]);
    let policy = RetryPolicy {
        max_attempts: 4,
        base_backoff: Duration::from_millis(100),
        backoff: BackoffPolicy::Linear,
        ..RetryPolicy::default()
    };

    let started = tokio::time::Instant::now();
    let _ = acquire(&driver, &config(443), &policy).await;
    let elapsed = started.elapsed();

    // 100ms + 200ms + 300ms
    assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "elapsed {elapsed:?}");
}

// ============================================================================
// Validator / cache
// ============================================================================

#[tokio::test]
async fn test_first_request_transitions_empty_to_live() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::reachable(&[443]);
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));
    assert_eq!(cache.state(), CacheState::Empty);

    cache.get_or_create().await.unwrap();

    assert_eq!(cache.state(), CacheState::Live);
    assert_eq!(driver.state().opened, 1);
    // A fresh connection is not pinged
    assert!(driver.state().pings.is_empty());
}

#[tokio::test]
async fn test_live_handle_reused_after_liveness_check() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));

    cache.get_or_create().await.unwrap();
    cache.get_or_create().await.unwrap();
    cache.get_or_create().await.unwrap();

    assert_eq!(driver.state().opened, 1);
    assert_eq!(driver.state().pings, vec![1, 1]);
}

#[tokio::test]
async fn test_stale_handle_discarded_and_replaced() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));
    cache.get_or_create().await.unwrap();

    driver.state().ping_fails = true;
    cache.get_or_create().await.unwrap();
    driver.state().ping_fails = false;
    cache.get_or_create().await.unwrap();

    let state = driver.state();
    assert_eq!(state.opened, 2);
    assert_eq!(state.closed, vec![1]);
    // The stale session is never pinged again; the replacement is
    assert_eq!(state.pings, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_liveness_check_is_bounded() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));
    cache.get_or_create().await.unwrap();

    driver.state().ping_hangs = true;
    let started = tokio::time::Instant::now();
    let repaired = tokio::time::timeout(Duration::from_secs(3600), cache.get_or_create()).await;

    assert!(repaired.is_ok(), "liveness check was not bounded");
    assert!(repaired.unwrap().is_ok());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3), "{elapsed:?}");

    let state = driver.state();
    assert_eq!(state.opened, 2);
    assert_eq!(state.closed, vec![1]);
    assert_eq!(cache.state(), CacheState::Live);
}

#[tokio::test]
async fn test_close_errors_on_stale_handle_are_swallowed() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));
    cache.get_or_create().await.unwrap();

    {
        let mut state = driver.state();
        state.ping_fails = true;
        state.close_fails = true;
    }

    assert!(cache.get_or_create().await.is_ok());
    assert_eq!(cache.state(), CacheState::Live);
}

#[tokio::test]
async fn test_failed_repair_leaves_cache_empty() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(2));
    cache.get_or_create().await.unwrap();

    {
        let mut state = driver.state();
        state.ping_fails = true;
        state.accepting.clear();
    }

    let err = cache.get_or_create().await.map(|_| ()).unwrap_err();
    assert_eq!(err.error_code(), "CONNECTION_EXHAUSTED");
    assert_eq!(cache.state(), CacheState::Empty);
    assert_eq!(driver.state().closed, vec![1]);
}

#[tokio::test]
async fn test_manual_teardown() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(3));
    cache.get_or_create().await.unwrap();

    assert!(cache.close().await);
    assert_eq!(cache.state(), CacheState::Empty);
    assert!(!cache.close().await);

    cache.get_or_create().await.unwrap();
    assert_eq!(driver.state().opened, 2);
    assert_eq!(driver.state().closed, vec![1]);
}

#[tokio::test]
async fn test_discovered_port_is_per_attempt_by_default() {
    let driver = ScriptedDriver::accepting(&[30015]);
    let prober = ScriptedProber::reachable(&[443, 30015]);
    let discovery = DiscoverySettings::with_fallbacks(vec![30015]);
    let mut cache = cache(&driver, &prober, 443, discovery, quick_retry(3));

    cache.get_or_create().await.unwrap();

    assert_eq!(driver.state().connects, vec![443, 30015, 30015]);
    assert_eq!(cache.config().port, 443);
    assert_eq!(cache.last_discovery().unwrap().discovered, Some(30015));
}

#[tokio::test]
async fn test_discovered_port_persisted_when_opted_in() {
    let driver = ScriptedDriver::accepting(&[30015]);
    let prober = ScriptedProber::reachable(&[443, 30015]);
    let discovery = DiscoverySettings { persist_discovered: true, ..DiscoverySettings::with_fallbacks(vec![30015]) };
    let mut cache = cache(&driver, &prober, 443, discovery, quick_retry(3));

    cache.get_or_create().await.unwrap();
    cache.close().await;
    cache.get_or_create().await.unwrap();

    assert_eq!(cache.config().port, 30015);
    assert_eq!(cache.configured_port(), 443);
    // Second discovery pass starts from the adopted port
    assert_eq!(driver.state().connects, vec![443, 30015, 30015, 30015, 30015]);
}

#[tokio::test]
async fn test_failed_discovery_falls_back_to_configured_port_with_retries() {
    let driver = ScriptedDriver::accepting(&[]);
    let prober = ScriptedProber::reachable(&[443]);
    let discovery = DiscoverySettings::with_fallbacks(vec![30015]);
    let mut cache = cache(&driver, &prober, 443, discovery, quick_retry(2));

    let err = cache.get_or_create().await.map(|_| ()).unwrap_err();

    // One discovery connect on 443 (30015 unreachable), then two acquire attempts
    assert_eq!(driver.state().connects, vec![443, 443, 443]);
    let DbReachError::ConnectionExhausted(exhausted) = err else {
        panic!("expected ConnectionExhausted");
    };
    assert_eq!(exhausted.attempts, 2);
    assert_eq!(exhausted.target, format!("{HOST}:443"));
}

// ============================================================================
// Cursor
// ============================================================================

#[tokio::test]
async fn test_cursor_fetches_rows_in_order() {
    let driver = ScriptedDriver::accepting(&[443]);
    let prober = ScriptedProber::default();
    let mut cache = cache(&driver, &prober, 443, DiscoverySettings::disabled(), quick_retry(1));
    driver.push_result(rows(&["NAME"], vec![vec![json!("Lamp")], vec![json!("Desk")], vec![json!("Chair")]]));
    driver.push_result(affected(2));

    let mut cursor = cache.get_or_create().await.unwrap();
    cursor.execute("SELECT NAME FROM T WHERE ID > ?", &[1_i64.into()]).await.unwrap();

    assert_eq!(cursor.columns(), ["NAME".to_string()]);
    assert_eq!(cursor.rowcount(), 3);
    assert_eq!(cursor.fetch_one(), Some(vec![json!("Lamp")]));
    assert_eq!(cursor.fetch_all(), vec![vec![json!("Desk")], vec![json!("Chair")]]);
    assert_eq!(cursor.fetch_one(), None);

    cursor.execute("DELETE FROM T WHERE ID > ?", &[1_i64.into()]).await.unwrap();
    assert_eq!(cursor.rowcount(), 2);
    cursor.commit().await.unwrap();

    assert_eq!(driver.state().commits, 1);
    assert_eq!(driver.state().statements.len(), 2);
}
