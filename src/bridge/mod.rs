pub mod a2a;

pub use a2a::{A2aBridgeMetadata, contact_from_a2a, contact_to_a2a};
