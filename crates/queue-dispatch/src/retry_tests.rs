//! Tests for retry policy module

use super::*;
use std::time::Duration;

// ============================================================================
// RetryPolicy Tests
// ============================================================================

#[test]
fn test_retry_policy_default_values() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.initial_delay, Duration::from_secs(1));
    assert_eq!(policy.max_delay, Duration::from_secs(60));
    assert_eq!(policy.backoff_multiplier, 2.0);
    assert!(policy.use_jitter);
    assert_eq!(policy.total_attempts(), 4);
}

#[test]
fn test_retry_policy_from_backoff_config() {
    let config = BackoffConfig {
        initial_delay_ms: 250,
        max_delay_ms: 2_000,
        multiplier: 3.0,
    };
    let policy = RetryPolicy::from_backoff(&config).without_jitter();

    assert_eq!(policy.calculate_delay(0), Duration::from_millis(250));
    assert_eq!(policy.calculate_delay(1), Duration::from_millis(750));
    assert_eq!(policy.calculate_delay(2), Duration::from_millis(2_000));
    assert!(policy.should_retry(1_000_000));
}

#[test]
fn test_retry_policy_calculate_delay_without_jitter() {
    let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(16), 2.0)
        .without_jitter();

    assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
    assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
    assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));

    // Would be 32s but capped
    assert_eq!(policy.calculate_delay(5), Duration::from_secs(16));
}

#[test]
fn test_huge_attempt_numbers_stay_capped() {
    let policy = RetryPolicy::default().without_jitter();
    assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(60));
}

#[test]
fn test_retry_policy_calculate_delay_with_jitter() {
    let policy = RetryPolicy::new(5, Duration::from_secs(4), Duration::from_secs(60), 2.0);

    for _ in 0..20 {
        let delay = policy.calculate_delay(0);
        assert!(delay >= Duration::from_secs(3));
        assert!(delay <= Duration::from_secs(5));
    }
}

#[test]
fn test_jitter_percent_is_clamped() {
    let policy = RetryPolicy::default().with_jitter_percent(4.0);
    assert_eq!(policy.jitter_percent, 1.0);
}

#[test]
fn test_error_retry_hint_is_a_floor() {
    let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(60), 2.0)
        .without_jitter();
    let error = QueueError::ConnectionFailed {
        message: "refused".to_string(),
    };

    assert_eq!(policy.delay_for(&error, 0), Duration::from_secs(5));

    let no_hint = QueueError::ProviderError {
        provider: "sqs".to_string(),
        code: "InternalError".to_string(),
        message: "oops".to_string(),
    };
    assert_eq!(policy.delay_for(&no_hint, 0), Duration::from_millis(10));
}

// ============================================================================
// RetryState Tests
// ============================================================================

#[test]
fn test_retry_state_grows_and_resets() {
    let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1), 2.0)
        .without_jitter();
    let error = QueueError::ProviderError {
        provider: "sqs".to_string(),
        code: "InternalError".to_string(),
        message: "oops".to_string(),
    };

    let mut state = RetryState::new();
    assert!(state.can_retry(&policy));
    assert_eq!(state.on_failure(&policy, &error), Duration::from_millis(100));
    assert_eq!(state.on_failure(&policy, &error), Duration::from_millis(200));
    assert!(!state.can_retry(&policy));

    state.reset();
    assert_eq!(state.attempt, 0);
    assert!(state.can_retry(&policy));
}
