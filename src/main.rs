use anyhow::Result;
use clap::{Parser, Subcommand};
use uam::relay::config::Settings;
use uam::relay::server::RelayServer;
use uam::sdk::agent::Agent;
use uam::sdk::config::SdkConfig;
use uam::sdk::handshake::TrustPolicy;

#[derive(Parser)]
#[command(author, version, about = "UAM — Universal Agent Messaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server.
    Relay,
    /// Show this agent's address, public key, and fingerprint.
    Identity {
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Print this agent's signed contact card.
    Card {
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Send an encrypted message to another agent.
    Send {
        to: String,
        message: String,
        #[arg(long, default_value = "agent")]
        name: String,
        #[arg(long)]
        trust_policy: Option<String>,
    },
    /// Fetch and decrypt pending messages.
    Inbox {
        #[arg(long, default_value = "agent")]
        name: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List pending handshake requests.
    Pending {
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Approve a pending handshake request.
    Approve {
        address: String,
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Deny a pending handshake request.
    Deny {
        address: String,
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Block an address or *::domain pattern.
    Block {
        pattern: String,
        #[arg(long, default_value = "agent")]
        name: String,
    },
    /// Remove a block pattern.
    Unblock {
        pattern: String,
        #[arg(long, default_value = "agent")]
        name: String,
    },
}

fn agent_config(name: &str, trust_policy: Option<&str>) -> Result<SdkConfig> {
    let mut config = SdkConfig::new(name);
    if let Some(policy) = trust_policy {
        config.trust_policy = TrustPolicy::parse(policy)
            .ok_or_else(|| anyhow::anyhow!("unknown trust policy: {policy}"))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Relay => {
            let settings = Settings::from_env();
            RelayServer::new(settings).await?.run().await?;
        }
        Commands::Identity { name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.connect().await?;
            println!("Address:     {}", agent.address()?);
            println!("Public key:  {}", agent.public_key());
            let vk = uam::protocol::deserialize_verify_key(&agent.public_key())?;
            println!("Fingerprint: {}", uam::protocol::public_key_fingerprint(&vk));
        }
        Commands::Card { name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.connect().await?;
            println!("{}", serde_json::to_string_pretty(&agent.contact_card()?)?);
        }
        Commands::Send {
            to,
            message,
            name,
            trust_policy,
        } => {
            let mut agent = Agent::new(agent_config(&name, trust_policy.as_deref())?);
            let message_id = agent.send(&to, &message).await?;
            println!("sent {message_id}");
        }
        Commands::Inbox { name, limit } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            let messages = agent.inbox(limit).await?;
            if messages.is_empty() {
                println!("no new messages");
            }
            for msg in messages {
                println!("[{}] {}: {}", msg.timestamp, msg.from_address, msg.content);
            }
        }
        Commands::Pending { name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            let pending = agent.pending().await?;
            if pending.is_empty() {
                println!("no pending handshakes");
            }
            for entry in pending {
                println!("{} (received {})", entry.address, entry.received_at);
            }
        }
        Commands::Approve { address, name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.approve(&address).await?;
            println!("approved {address}");
        }
        Commands::Deny { address, name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.deny(&address).await?;
            println!("denied {address}");
        }
        Commands::Block { pattern, name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.block(&pattern).await?;
            println!("blocked {pattern}");
        }
        Commands::Unblock { pattern, name } => {
            let mut agent = Agent::new(agent_config(&name, None)?);
            agent.unblock(&pattern).await?;
            println!("unblocked {pattern}");
        }
    }
    Ok(())
}
