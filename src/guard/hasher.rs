//! Keyed one-way hashing of client identifiers.
//!
//! Client addresses never reach the filesystem or the logs in clear.
//! They are reduced to `HMAC-SHA256(server_key, ip)`, hex encoded, which
//! is stable across restarts and useless without the key.
//!
//! The key is 32 bytes from the OS CSPRNG, generated on first run and
//! stored with 0600 permissions in the data directory.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const HASH_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct ClientHasher {
    /// Keyed state, cloned per hash
    mac: HmacSha256,
}

impl std::fmt::Debug for ClientHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHasher").finish_non_exhaustive()
    }
}

impl ClientHasher {
    pub fn new(key: &[u8; HASH_KEY_LEN]) -> Result<Self> {
        let mac = <HmacSha256 as Mac>::new_from_slice(key)
            .context("HMAC key initialization should not fail")?;
        Ok(Self { mac })
    }

    /// Load the key at `key_path`, creating it on first use.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        ensure_hash_key(key_path)?;
        Self::new(&read_hash_key(key_path)?)
    }

    /// 64 lowercase hex chars.
    pub fn hash(&self, client_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(client_id.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

/// Create the key file if it does not exist yet.
pub fn ensure_hash_key(key_path: &Path) -> Result<()> {
    if key_path.exists() {
        return Ok(());
    }

    if let Some(parent) = key_path.parent() {
        crate::paths::create_dir_with_mode(parent)?;
    }

    let mut key = [0u8; HASH_KEY_LEN];
    rand::rng().fill(&mut key);

    fs::write(key_path, key).context("Failed to write client hash key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set client hash key permissions")?;
    }

    tracing::info!("Generated client hash key at {}", key_path.display());
    Ok(())
}

pub fn read_hash_key(key_path: &Path) -> Result<[u8; HASH_KEY_LEN]> {
    let bytes = fs::read(key_path)
        .with_context(|| format!("Failed to read client hash key {}", key_path.display()))?;

    if bytes.len() != HASH_KEY_LEN {
        anyhow::bail!(
            "Client hash key has unexpected length {} (expected {})",
            bytes.len(),
            HASH_KEY_LEN
        );
    }

    let mut key = [0u8; HASH_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Unkeyed SHA-256, hex encoded. Used for grouping, never for identity.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `n` random bytes from the OS CSPRNG, hex encoded.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill(&mut bytes[..]);
    hex_encode(&bytes)
}
