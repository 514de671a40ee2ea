use serde::{Deserialize, Serialize};

use super::errors::ProtocolError;

/// A parsed, normalized UAM address: `name::domain`.
///
/// Normalization lowercases both parts; equality is byte equality after
/// normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    name: String,
    domain: String,
}

impl Address {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.name, self.domain)
    }
}

impl std::str::FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s)
    }
}

/// Parse and normalize a `name::domain` address.
///
/// Grammar: `name` matches `[a-z0-9][a-z0-9-]*` after lowercasing,
/// `domain` is non-empty, and neither part may contain whitespace or a
/// further `::` separator.
pub fn parse_address(s: &str) -> Result<Address, ProtocolError> {
    let s = s.trim();
    if s.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidAddress(format!(
            "address contains whitespace: '{s}'"
        )));
    }
    let Some((name, domain)) = s.split_once("::") else {
        return Err(ProtocolError::InvalidAddress(format!(
            "expected 'name::domain', got '{s}'"
        )));
    };
    if domain.contains("::") {
        return Err(ProtocolError::InvalidAddress(format!(
            "multiple '::' separators in '{s}'"
        )));
    }

    let name = name.to_lowercase();
    let domain = domain.to_lowercase();

    let mut chars = name.chars();
    let valid_name = match chars.next() {
        Some(first) => {
            first.is_ascii_lowercase() || first.is_ascii_digit()
        }
        None => false,
    } && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_name {
        return Err(ProtocolError::InvalidAddress(format!(
            "name must match [a-z0-9][a-z0-9-]*, got '{name}'"
        )));
    }
    if domain.is_empty() {
        return Err(ProtocolError::InvalidAddress(
            "domain must be non-empty".to_string(),
        ));
    }

    Ok(Address { name, domain })
}

/// Extract the domain part of an address string, if it has one.
///
/// Used on hot relay paths where the full grammar check already ran at
/// envelope parse time.
pub fn domain_of(address: &str) -> Option<&str> {
    address.split_once("::").map(|(_, domain)| domain)
}

#[cfg(test)]
#[path = "address_tests.rs"]
mod tests;
