//! End-to-end encrypted exchange: two SDK agents talking through one
//! relay's real ingress pipeline and store-and-forward tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use uam::protocol::types::b64_decode;
use uam::relay::config::Settings;
use uam::relay::ingress::process_envelope;
use uam::relay::server::RelayState;
use uam::relay::storage::Storage;
use uam::sdk::agent::Agent;
use uam::sdk::config::SdkConfig;
use uam::sdk::handshake::TrustPolicy;
use uam::sdk::key_manager::KeyManager;
use uam::sdk::resolver::AddressResolver;
use uam::sdk::transport::Transport;

const RELAY_DOMAIN: &str = "r.test";

/// Transport that submits through the relay's real ingress pipeline and
/// polls the store-and-forward tier — the HTTP transport minus HTTP.
struct InProcessTransport {
    state: Arc<RelayState>,
    address: String,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, wire: &Value) -> Result<()> {
        let agent = self
            .state
            .storage
            .get_agent_by_address(&self.address)
            .await?
            .ok_or_else(|| anyhow!("agent not registered: {}", self.address))?;
        process_envelope(&self.state, &agent, wire)
            .await
            .map_err(|err| anyhow!("relay rejected send: {} ({})", err.code, err.detail))?;
        Ok(())
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>> {
        let stored = self.state.storage.get_stored_messages(&self.address, limit).await?;
        let ids: Vec<i64> = stored.iter().map(|msg| msg.id).collect();
        self.state.storage.mark_messages_delivered(&ids).await?;
        Ok(stored.into_iter().map(|msg| msg.envelope).collect())
    }
}

/// Tier-1 resolution against the relay's agent table, without HTTP.
struct InProcessResolver {
    keys: StdMutex<HashMap<String, String>>,
}

#[async_trait]
impl AddressResolver for InProcessResolver {
    async fn resolve_public_key(
        &self,
        address: &str,
        _token: Option<&str>,
        _relay_url: &str,
    ) -> Result<String> {
        self.keys
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("no agent registered at {address}"))
    }
}

struct World {
    state: Arc<RelayState>,
    resolver: Arc<InProcessResolver>,
    _dir: tempfile::TempDir,
}

async fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.relay_domain = RELAY_DOMAIN.to_string();
    settings.data_dir = dir.path().to_path_buf();
    settings.federation_enabled = false;
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let state = RelayState::build(settings, storage).await.unwrap();
    World {
        state,
        resolver: Arc::new(InProcessResolver {
            keys: StdMutex::new(HashMap::new()),
        }),
        _dir: dir,
    }
}

/// Register an agent with the relay and wire it up with the in-process
/// transport and resolver.
async fn spawn_agent(world: &World, name: &str, policy: TrustPolicy) -> Agent {
    let home = world._dir.path().join(name);
    let mut config = SdkConfig::new(name);
    config.key_dir = home.join("keys");
    config.data_dir = home;
    config.relay_domain = RELAY_DOMAIN.to_string();
    config.relay_url = "http://relay.invalid".to_string();
    config.trust_policy = policy;
    config.auto_register = false;

    let address = format!("{name}::{RELAY_DOMAIN}");
    let token = format!("tok-{name}");
    KeyManager::new(config.key_dir.clone())
        .save_token(name, &token)
        .unwrap();

    let transport = InProcessTransport {
        state: Arc::clone(&world.state),
        address: address.clone(),
    };
    let mut agent = Agent::with_parts(config, world.resolver.clone(), Some(Box::new(transport)));
    agent.connect().await.unwrap();

    world
        .state
        .storage
        .register_agent(&address, &agent.public_key(), &token)
        .await
        .unwrap();
    world.state.reputation.init_score(&address, 30).await.unwrap();
    world
        .resolver
        .keys
        .lock()
        .unwrap()
        .insert(address, agent.public_key());
    agent
}

#[tokio::test]
async fn basic_encrypted_exchange() {
    let world = world().await;
    let mut alice = spawn_agent(&world, "alice", TrustPolicy::AutoAccept).await;
    let mut bob = spawn_agent(&world, "bob", TrustPolicy::AutoAccept).await;

    let message_id = alice.send("bob::r.test", "Hi Bob").await.unwrap();

    // The wire form stored at the relay never contains the plaintext.
    let stored = world
        .state
        .storage
        .get_stored_messages("bob::r.test", 50)
        .await
        .unwrap();
    assert!(!stored.is_empty());
    for msg in &stored {
        assert!(!msg.envelope.to_string().contains("Hi Bob"));
    }

    // Bob's inbox yields exactly the one user message, decrypted and
    // verified; the handshake.request was consumed by the trust layer.
    let messages = bob.inbox(50).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, message_id);
    assert_eq!(messages[0].content, "Hi Bob");
    assert_eq!(messages[0].from_address, "alice::r.test");
    assert!(messages[0].verified);

    // Alice's inbox drains bob's handshake.accept and the receipt.read;
    // neither surfaces as a user message, and the accept pins bob.
    let alice_view = alice.inbox(50).await.unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].message_type, "receipt.read");
}

#[tokio::test]
async fn handshake_completion_pins_both_sides() {
    let world = world().await;
    let mut alice = spawn_agent(&world, "alice", TrustPolicy::AutoAccept).await;
    let mut bob = spawn_agent(&world, "bob", TrustPolicy::AutoAccept).await;

    alice.send("bob::r.test", "first contact").await.unwrap();
    bob.inbox(50).await.unwrap(); // consumes request, auto-accepts
    alice.inbox(50).await.unwrap(); // consumes accept

    // Both agents can now exchange without further handshakes, and the
    // dedup layer sees each envelope exactly once.
    let reply_id = bob.send("alice::r.test", "hello back").await.unwrap();
    let alice_msgs = alice.inbox(50).await.unwrap();
    let user_msgs: Vec<_> = alice_msgs
        .iter()
        .filter(|msg| msg.message_type == "message")
        .collect();
    assert_eq!(user_msgs.len(), 1);
    assert_eq!(user_msgs[0].message_id, reply_id);
    assert_eq!(user_msgs[0].content, "hello back");
}

#[tokio::test]
async fn nonce_is_fresh_per_envelope() {
    let world = world().await;
    let mut alice = spawn_agent(&world, "alice", TrustPolicy::AutoAccept).await;
    let _bob = spawn_agent(&world, "bob", TrustPolicy::AutoAccept).await;

    alice.send("bob::r.test", "one").await.unwrap();
    alice.send("bob::r.test", "two").await.unwrap();

    let stored = world
        .state
        .storage
        .get_stored_messages("bob::r.test", 50)
        .await
        .unwrap();
    let nonces: Vec<String> = stored
        .iter()
        .filter(|msg| msg.envelope["type"] == "message")
        .map(|msg| msg.envelope["nonce"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(nonces.len(), 2);
    assert_ne!(nonces[0], nonces[1]);
    for nonce in nonces {
        assert_eq!(b64_decode(&nonce).unwrap().len(), 24);
    }
}
