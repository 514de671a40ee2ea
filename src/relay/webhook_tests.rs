use super::*;

#[test]
fn signature_is_deterministic_hmac() {
    let payload = br#"{"message_id":"m1","type":"message"}"#;
    let sig = compute_webhook_signature(payload, "secret-token");
    assert!(sig.starts_with("sha256="));
    assert_eq!(sig.len(), "sha256=".len() + 64);
    assert_eq!(sig, compute_webhook_signature(payload, "secret-token"));
}

#[test]
fn signature_depends_on_key_and_payload() {
    let payload = b"payload";
    let sig = compute_webhook_signature(payload, "token-a");
    assert_ne!(sig, compute_webhook_signature(payload, "token-b"));
    assert_ne!(sig, compute_webhook_signature(b"other", "token-a"));
}

#[test]
fn public_ip_classification() {
    for private in [
        "127.0.0.1",
        "10.0.0.5",
        "192.168.1.1",
        "172.16.0.1",
        "169.254.1.1",
        "0.0.0.0",
        "100.64.0.1",
        "::1",
        "fc00::1",
        "fe80::1",
    ] {
        assert!(!is_public_ip(private.parse().unwrap()), "{private} should be non-public");
    }
    for public in ["93.184.216.34", "8.8.8.8", "2606:2800:220:1::1"] {
        assert!(is_public_ip(public.parse().unwrap()), "{public} should be public");
    }
}

#[tokio::test]
async fn url_validation_requires_https() {
    assert!(validate_webhook_url("http://example.com/hook").await.is_err());
    assert!(validate_webhook_url("ftp://example.com/hook").await.is_err());
    assert!(validate_webhook_url("not a url").await.is_err());
}

#[tokio::test]
async fn url_validation_rejects_literal_private_ips() {
    assert!(validate_webhook_url("https://127.0.0.1/hook").await.is_err());
    assert!(validate_webhook_url("https://10.1.2.3/hook").await.is_err());
    assert!(validate_webhook_url("https://[::1]/hook").await.is_err());
}

#[tokio::test]
async fn url_validation_accepts_literal_public_ip() {
    assert!(validate_webhook_url("https://93.184.216.34/hook").await.is_ok());
}

#[test]
fn circuit_opens_after_threshold_failures() {
    let breaker = WebhookCircuitBreaker::new(Duration::from_secs(3600));
    for _ in 0..4 {
        breaker.record_failure("a::r.test");
        assert!(breaker.is_available("a::r.test"));
    }
    breaker.record_failure("a::r.test");
    assert!(!breaker.is_available("a::r.test"));
}

#[test]
fn success_resets_failure_count() {
    let breaker = WebhookCircuitBreaker::new(Duration::from_secs(3600));
    for _ in 0..4 {
        breaker.record_failure("a::r.test");
    }
    breaker.record_success("a::r.test");
    for _ in 0..4 {
        breaker.record_failure("a::r.test");
    }
    assert!(breaker.is_available("a::r.test"));
}

#[test]
fn cooldown_half_opens_circuit() {
    let breaker = WebhookCircuitBreaker::new(Duration::from_millis(20));
    for _ in 0..5 {
        breaker.record_failure("a::r.test");
    }
    assert!(!breaker.is_available("a::r.test"));
    std::thread::sleep(Duration::from_millis(40));
    assert!(breaker.is_available("a::r.test"));
    // A probe success closes it for real.
    breaker.record_success("a::r.test");
    assert!(breaker.is_available("a::r.test"));
}

#[test]
fn circuits_are_per_agent() {
    let breaker = WebhookCircuitBreaker::new(Duration::from_secs(3600));
    for _ in 0..5 {
        breaker.record_failure("a::r.test");
    }
    assert!(!breaker.is_available("a::r.test"));
    assert!(breaker.is_available("b::r.test"));
}

#[test]
fn retry_schedule_matches_spec() {
    let seconds: Vec<u64> = RETRY_DELAYS.iter().map(Duration::as_secs).collect();
    assert_eq!(seconds, vec![0, 5, 300, 1800, 7200]);
}
