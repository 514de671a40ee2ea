use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingTier3 {
    calls: AtomicUsize,
    key: String,
    fail: bool,
}

#[async_trait]
impl Tier3Resolver for CountingTier3 {
    async fn resolve(&self, _name: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("rpc connection error");
        }
        Ok(self.key.clone())
    }
}

fn tier3(key: &str, fail: bool) -> Arc<CountingTier3> {
    Arc::new(CountingTier3 {
        calls: AtomicUsize::new(0),
        key: key.to_string(),
        fail,
    })
}

#[tokio::test]
async fn tier3_resolves_dot_free_domains() {
    let backend = tier3("b64-key", false);
    let resolver = SmartResolver::new("relay.test").with_tier3(backend.clone());
    let key = resolver
        .resolve_public_key("agent::namespace", None, "http://relay.test")
        .await
        .unwrap();
    assert_eq!(key, "b64-key");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tier3_cache_hit_skips_backend() {
    let backend = tier3("b64-key", false);
    let resolver = SmartResolver::new("relay.test").with_tier3(backend.clone());
    for _ in 0..3 {
        resolver
            .resolve_public_key("agent::namespace", None, "http://relay.test")
            .await
            .unwrap();
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidate_forces_fresh_lookup() {
    let backend = tier3("b64-key", false);
    let resolver = SmartResolver::new("relay.test").with_tier3(backend.clone());
    resolver
        .resolve_public_key("agent::namespace", None, "http://relay.test")
        .await
        .unwrap();
    resolver.invalidate("agent::namespace");
    resolver
        .resolve_public_key("agent::namespace", None, "http://relay.test")
        .await
        .unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_all_clears_every_entry() {
    let backend = tier3("b64-key", false);
    let resolver = SmartResolver::new("relay.test").with_tier3(backend.clone());
    resolver
        .resolve_public_key("a::ns1", None, "http://relay.test")
        .await
        .unwrap();
    resolver
        .resolve_public_key("b::ns2", None, "http://relay.test")
        .await
        .unwrap();
    resolver.invalidate_all();
    resolver
        .resolve_public_key("a::ns1", None, "http://relay.test")
        .await
        .unwrap();
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn tier3_backend_errors_propagate() {
    let backend = tier3("", true);
    let resolver = SmartResolver::new("relay.test").with_tier3(backend);
    assert!(
        resolver
            .resolve_public_key("agent::namespace", None, "http://relay.test")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn dot_free_domain_without_tier3_fails() {
    let resolver = SmartResolver::new("relay.test");
    let err = resolver
        .resolve_public_key("agent::namespace", None, "http://relay.test")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tier-3"));
}

#[tokio::test]
async fn invalid_address_rejected_before_any_tier() {
    let resolver = SmartResolver::new("relay.test");
    assert!(
        resolver
            .resolve_public_key("not-an-address", None, "http://relay.test")
            .await
            .is_err()
    );
}

#[test]
fn cache_respects_ttl() {
    let mut resolver = SmartResolver::new("relay.test");
    resolver.cache_ttl = Duration::from_millis(10);
    resolver.cache_put("a::ns", "key");
    assert_eq!(resolver.cache_get("a::ns").as_deref(), Some("key"));
    std::thread::sleep(Duration::from_millis(25));
    assert!(resolver.cache_get("a::ns").is_none());
}
