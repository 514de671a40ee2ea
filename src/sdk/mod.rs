pub mod agent;
pub mod config;
pub mod contact_book;
pub mod handshake;
pub mod key_manager;
pub mod message;
pub mod resolver;
pub mod transport;

pub use agent::{Agent, SendOptions};
pub use config::SdkConfig;
pub use contact_book::{ContactBook, ContactUpdate, TrustState};
pub use handshake::{HandshakeManager, TrustPolicy};
pub use message::ReceivedMessage;
pub use resolver::{AddressResolver, SmartResolver, Tier3Resolver};
pub use transport::{HttpTransport, Transport};
