use super::*;
use crate::relay::storage::Storage;

fn storage() -> Storage {
    Storage::open_in_memory().unwrap()
}

#[test]
fn classify_exact_pattern() {
    assert_eq!(
        classify_pattern("spammer::evil.com"),
        Some(Pattern::Exact("spammer::evil.com".into()))
    );
}

#[test]
fn classify_domain_wildcard() {
    assert_eq!(
        classify_pattern("*::evil.com"),
        Some(Pattern::Domain("evil.com".into()))
    );
}

#[test]
fn classify_normalizes_case() {
    assert_eq!(
        classify_pattern("Spammer::Evil.COM"),
        Some(Pattern::Exact("spammer::evil.com".into()))
    );
}

#[test]
fn classify_rejects_invalid() {
    assert_eq!(classify_pattern("no-separator"), None);
    assert_eq!(classify_pattern(""), None);
    assert_eq!(classify_pattern("*::"), None);
}

#[tokio::test]
async fn exact_block_matches_only_that_address() {
    let storage = storage();
    let list = AllowBlockList::new();
    list.add_blocked(&storage, "spammer::evil.com").await.unwrap();
    assert!(list.is_blocked("spammer::evil.com"));
    assert!(!list.is_blocked("other::evil.com"));
    assert!(!list.is_blocked("spammer::good.com"));
}

#[tokio::test]
async fn domain_block_matches_whole_domain() {
    let storage = storage();
    let list = AllowBlockList::new();
    list.add_blocked(&storage, "*::evil.com").await.unwrap();
    assert!(list.is_blocked("anyone::evil.com"));
    assert!(list.is_blocked("other::evil.com"));
    assert!(!list.is_blocked("anyone::good.com"));
}

#[tokio::test]
async fn add_and_remove_round_trip() {
    let storage = storage();
    let list = AllowBlockList::new();
    assert!(list.add_blocked(&storage, "bad::x.com").await.unwrap());
    assert!(list.is_blocked("bad::x.com"));
    assert!(list.remove_blocked(&storage, "bad::x.com").await.unwrap());
    assert!(!list.is_blocked("bad::x.com"));
    assert!(!list.remove_blocked(&storage, "bad::x.com").await.unwrap());
}

#[tokio::test]
async fn duplicate_add_is_idempotent() {
    let storage = storage();
    let list = AllowBlockList::new();
    assert!(list.add_blocked(&storage, "bad::x.com").await.unwrap());
    assert!(!list.add_blocked(&storage, "bad::x.com").await.unwrap());
    assert!(list.is_blocked("bad::x.com"));
}

#[tokio::test]
async fn invalid_pattern_rejected() {
    let storage = storage();
    let list = AllowBlockList::new();
    assert!(list.add_blocked(&storage, "garbage").await.is_err());
}

#[tokio::test]
async fn allowlist_is_separate_from_blocklist() {
    let storage = storage();
    let list = AllowBlockList::new();
    list.add_allowed(&storage, "friend::good.com").await.unwrap();
    list.add_allowed(&storage, "*::partner.com").await.unwrap();
    assert!(list.is_allowed("friend::good.com"));
    assert!(list.is_allowed("anyone::partner.com"));
    assert!(!list.is_allowed("stranger::other.com"));
    assert!(!list.is_blocked("friend::good.com"));
}

#[tokio::test]
async fn load_replaces_state_from_db() {
    let storage = storage();
    let writer = AllowBlockList::new();
    writer.add_blocked(&storage, "bad::x.com").await.unwrap();
    writer.add_allowed(&storage, "*::good.com").await.unwrap();

    let fresh = AllowBlockList::new();
    fresh.add_blocked(&storage, "stale::y.com").await.ok();
    fresh.load(&storage).await.unwrap();
    assert!(fresh.is_blocked("bad::x.com"));
    assert!(fresh.is_allowed("any::good.com"));
}

#[test]
fn invariant_only_listed_patterns_block() {
    // Spec property: is_blocked(a) holds exactly for exact matches and
    // wildcard-domain members.
    let list = AllowBlockList::new();
    {
        let mut set = list.blocked.write().unwrap();
        set.insert(&Pattern::Exact("a::one.com".into()));
        set.insert(&Pattern::Domain("two.com".into()));
    }
    assert!(list.is_blocked("a::one.com"));
    assert!(list.is_blocked("x::two.com"));
    assert!(list.is_blocked("y::two.com"));
    for not_blocked in ["b::one.com", "a::three.com", "two.com", "a"] {
        assert!(!list.is_blocked(not_blocked), "{not_blocked} wrongly blocked");
    }
}
