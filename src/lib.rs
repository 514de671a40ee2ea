pub mod bridge;
pub mod dns;
pub mod mcp;
pub mod protocol;
pub mod relay;
pub mod sdk;
