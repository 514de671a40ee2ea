//! On-disk key material: `<name>.key` holds the base64 Ed25519 seed,
//! `<name>.token` the relay bearer token. Both are owner-readable only;
//! signing keys never leave this machine.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::info;

pub struct KeyManager {
    key_dir: PathBuf,
    signing_key: Option<SigningKey>,
}

impl KeyManager {
    pub fn new(key_dir: PathBuf) -> Self {
        Self {
            key_dir,
            signing_key: None,
        }
    }

    /// Load the agent's keypair from `<name>.key`, generating one on
    /// first run. Idempotent.
    pub fn load_or_generate(&mut self, name: &str) -> Result<()> {
        if self.signing_key.is_some() {
            return Ok(());
        }
        ensure_private_dir(&self.key_dir)?;
        let key_path = self.key_dir.join(format!("{name}.key"));

        let signing_key = if key_path.exists() {
            let text = fs::read_to_string(&key_path)
                .with_context(|| format!("failed to read {}", key_path.display()))?;
            let bytes = STANDARD.decode(text.trim()).map_err(|err| {
                anyhow!(
                    "invalid key file at {}: expected base64 32-byte seed ({err})",
                    key_path.display()
                )
            })?;
            let seed: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
                anyhow!(
                    "invalid key length at {}: expected 32 decoded bytes, got {}",
                    key_path.display(),
                    v.len()
                )
            })?;
            SigningKey::from_bytes(&seed)
        } else {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            write_private(&key_path, STANDARD.encode(seed).as_bytes())?;
            info!(name, "generated new agent keypair");
            SigningKey::from_bytes(&seed)
        };

        self.signing_key = Some(signing_key);
        Ok(())
    }

    pub fn signing_key(&self) -> &SigningKey {
        self.signing_key
            .as_ref()
            .expect("load_or_generate must run before key access")
    }

    pub fn verify_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }

    /// Stored bearer token from a previous registration, if any.
    pub fn load_token(&self, name: &str) -> Option<String> {
        let token_path = self.key_dir.join(format!("{name}.token"));
        let token = fs::read_to_string(token_path).ok()?;
        let token = token.trim().to_string();
        (!token.is_empty()).then_some(token)
    }

    /// Persist the bearer token for the returning-user flow.
    pub fn save_token(&self, name: &str, token: &str) -> Result<()> {
        ensure_private_dir(&self.key_dir)?;
        write_private(&self.key_dir.join(format!("{name}.token")), token.as_bytes())
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create key dir: {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set key dir permissions: {}", dir.display()))?;
    }
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "key_manager_tests.rs"]
mod tests;
