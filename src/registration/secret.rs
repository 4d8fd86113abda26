//! Device secret sources and stamp derivation

use crate::store::Store;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Persistent location of a single secret value
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Stored value, `None` if nothing has been stored yet
    async fn load(&self) -> Result<Option<String>>;

    async fn save(&self, value: &str) -> Result<()>;
}

/// U-Boot environment variable, read with `fw_printenv` and written with `fw_setenv`
#[derive(Debug, Clone)]
pub struct FirmwareEnv {
    key: String,
}

impl FirmwareEnv {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl SecretStore for FirmwareEnv {
    async fn load(&self) -> Result<Option<String>> {
        let output = Command::new("fw_printenv").arg(&self.key).output().await?;
        if !output.status.success() {
            return Err(anyhow!(
                "fw_printenv error for {}: {}",
                self.key,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_printenv(&stdout))
    }

    async fn save(&self, value: &str) -> Result<()> {
        let output = Command::new("fw_setenv")
            .arg(&self.key)
            .arg(value)
            .output()
            .await?;
        if !output.status.success() {
            return Err(anyhow!(
                "fw_setenv error for {}: {}",
                self.key,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// `KEY=value` output of `fw_printenv KEY`
fn parse_printenv(output: &str) -> Option<String> {
    let (_, value) = output.split_once('=')?;
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}

/// Secret kept in the client record of the local store (local testing)
pub struct StoreSecrets {
    store: Arc<Store>,
}

impl StoreSecrets {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SecretStore for StoreSecrets {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.store.secret_key())
    }

    async fn save(&self, value: &str) -> Result<()> {
        let value = value.to_string();
        self.store
            .blocking(move |store| store.set_secret_key(&value))
            .await?;
        Ok(())
    }
}

/// The device secret and whether it predates this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub value: String,
    pub existing: bool,
}

/// Read the secret, or generate and persist a new one
pub async fn load_or_generate(source: &dyn SecretStore) -> Secret {
    match source.load().await {
        Ok(Some(value)) => {
            return Secret {
                value,
                existing: true,
            }
        }
        Ok(None) => debug!("No device secret stored, generating one"),
        Err(e) => debug!("Device secret unavailable ({:#}), generating one", e),
    }

    let value = generate_secret();
    if let Err(e) = source.save(&value).await {
        warn!("Error saving device secret: {:#}", e);
    }
    Secret {
        value,
        existing: false,
    }
}

/// hex(SHA-256(32 random bytes))
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(Sha256::digest(bytes))
}

/// hex(SHA-256(mac ++ secret))
pub fn stamp(mac: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mac.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
