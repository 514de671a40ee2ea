//! DNS TXT identity records: `v=uam1; key=ed25519:<b64>; relay=<url>`
//! published at `_uam.<domain>`. Tag names are matched case-insensitively
//! and whitespace around separators is tolerated.

use hickory_resolver::TokioResolver;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtIdentity {
    pub public_key: String,
    pub relay: Option<String>,
}

/// Render the TXT record an agent publishes to prove domain control.
pub fn generate_txt_record(public_key_b64: &str, relay_url: &str) -> String {
    format!("v=uam1; key=ed25519:{public_key_b64}; relay={relay_url}")
}

/// Parse a TXT record string. Returns `None` unless the record declares
/// `v=uam1` and carries an `ed25519:` key.
pub fn parse_txt_record(text: &str) -> Option<TxtIdentity> {
    let mut version_ok = false;
    let mut public_key: Option<String> = None;
    let mut relay: Option<String> = None;

    for part in text.split(';') {
        let Some((tag, value)) = part.split_once('=') else {
            continue;
        };
        let tag = tag.trim().to_lowercase();
        let value = value.trim();
        match tag.as_str() {
            "v" => version_ok = value.eq_ignore_ascii_case("uam1"),
            "key" => {
                // Tag names are case-insensitive; the key material is not.
                let scheme_ok = value
                    .get(..8)
                    .map(|prefix| prefix.eq_ignore_ascii_case("ed25519:"))
                    .unwrap_or(false);
                if scheme_ok {
                    public_key = Some(value[8..].trim().to_string());
                }
            }
            "relay" => relay = Some(value.to_string()),
            _ => {}
        }
    }

    if !version_ok {
        return None;
    }
    public_key.map(|public_key| TxtIdentity { public_key, relay })
}

/// Query `_uam.<domain>` for a UAM identity record. Returns the first
/// record that parses. Never errors; lookup failures are `None`.
pub async fn lookup_txt_identity(resolver: &TokioResolver, domain: &str) -> Option<TxtIdentity> {
    let name = format!("_uam.{domain}.");
    let lookup = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        resolver.txt_lookup(name.clone()),
    )
    .await
    .ok()?
    .ok()?;
    for record in lookup.iter() {
        let text: String = record
            .txt_data()
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();
        if let Some(identity) = parse_txt_record(&text) {
            return Some(identity);
        }
        debug!(%name, "TXT record present but not a UAM identity");
    }
    None
}

#[cfg(test)]
#[path = "dns_tests.rs"]
mod tests;
