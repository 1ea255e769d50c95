use super::*;

fn small_limiter() -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        per_client_limit: 3,
        per_client_window: Duration::from_secs(10),
        global_limit: 5,
        global_window: Duration::from_secs(10),
    })
}

#[test]
fn per_client_allows_up_to_limit() {
    let rl = small_limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    for i in 0..3 {
        assert!(rl.check_and_record_at(client, now).is_ok(), "request {i} should succeed");
    }
    assert!(matches!(
        rl.check_and_record_at(client, now),
        Err(RateLimitError::PerClientExceeded { limit: 3, window_secs: 10 })
    ));
}

#[test]
fn global_allows_up_to_limit() {
    let rl = small_limiter();
    let now = Instant::now();

    // Use distinct clients to avoid hitting per-client limit first.
    for i in 0..5 {
        assert!(rl.check_and_record_at(Uuid::new_v4(), now).is_ok(), "request {i} should succeed");
    }
    assert!(matches!(
        rl.check_and_record_at(Uuid::new_v4(), now),
        Err(RateLimitError::GlobalExceeded { .. })
    ));
}

#[test]
fn window_expiry_allows_new_requests() {
    let rl = small_limiter();
    let client = Uuid::new_v4();
    let start = Instant::now();

    for _ in 0..3 {
        rl.check_and_record_at(client, start).unwrap();
    }
    assert!(rl.check_and_record_at(client, start).is_err());

    let after_window = start + Duration::from_secs(10) + Duration::from_millis(1);
    assert!(rl.check_and_record_at(client, after_window).is_ok());
}

#[test]
fn distinct_clients_do_not_interfere() {
    let rl = small_limiter();
    let client_a = Uuid::new_v4();
    let client_b = Uuid::new_v4();
    let now = Instant::now();

    for _ in 0..3 {
        rl.check_and_record_at(client_a, now).unwrap();
    }
    assert!(rl.check_and_record_at(client_a, now).is_err());
    assert!(rl.check_and_record_at(client_b, now).is_ok());
}

#[test]
fn forget_clears_connection_history() {
    let rl = small_limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    for _ in 0..3 {
        rl.check_and_record_at(client, now).unwrap();
    }
    rl.forget(client);
    assert!(rl.check_and_record_at(client, now).is_ok());
}

#[test]
fn rejection_is_retryable_with_stable_code() {
    let err = RateLimitError::PerClientExceeded { limit: 1, window_secs: 1 };
    assert_eq!(err.error_code(), "E_RATE_LIMITED");
    assert!(err.retryable());
}
