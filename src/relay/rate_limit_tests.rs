use super::*;

fn limiter(limit: usize, window_ms: u64) -> SlidingWindowCounter {
    SlidingWindowCounter::new(limit, Duration::from_millis(window_ms))
}

#[test]
fn allows_within_limit() {
    let counter = limiter(5, 60_000);
    for _ in 0..5 {
        assert!(counter.check("alice::r.test"));
    }
}

#[test]
fn blocks_over_limit() {
    let counter = limiter(3, 60_000);
    for _ in 0..3 {
        assert!(counter.check("alice::r.test"));
    }
    assert!(!counter.check("alice::r.test"));
}

#[test]
fn window_expiry_frees_capacity() {
    let counter = limiter(2, 30);
    assert!(counter.check("k"));
    assert!(counter.check("k"));
    assert!(!counter.check("k"));
    std::thread::sleep(Duration::from_millis(50));
    assert!(counter.check("k"));
}

#[test]
fn keys_are_independent() {
    let counter = limiter(1, 60_000);
    assert!(counter.check("a"));
    assert!(!counter.check("a"));
    assert!(counter.check("b"));
}

#[test]
fn explicit_limit_overrides_default() {
    let counter = limiter(100, 60_000);
    assert!(counter.check_with_limit("k", 2));
    assert!(counter.check_with_limit("k", 2));
    assert!(!counter.check_with_limit("k", 2));
}

#[test]
fn zero_limit_always_rejects() {
    let counter = limiter(10, 60_000);
    assert!(!counter.check_with_limit("k", 0));
}

#[test]
fn remaining_counts_down() {
    let counter = limiter(3, 60_000);
    assert_eq!(counter.remaining("k"), 3);
    counter.check("k");
    assert_eq!(counter.remaining("k"), 2);
    counter.check("k");
    counter.check("k");
    assert_eq!(counter.remaining("k"), 0);
}

#[test]
fn cleanup_drops_expired_buckets() {
    let counter = limiter(5, 20);
    counter.check("a");
    counter.check("b");
    assert_eq!(counter.tracked_keys(), 2);
    std::thread::sleep(Duration::from_millis(40));
    counter.cleanup();
    assert_eq!(counter.tracked_keys(), 0);
}

#[test]
fn cleanup_keeps_live_buckets() {
    let counter = limiter(5, 60_000);
    counter.check("a");
    counter.cleanup();
    assert_eq!(counter.tracked_keys(), 1);
}
