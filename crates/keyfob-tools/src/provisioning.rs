//! Provisioning files.
//!
//! Keys travel as hex strings, messages and PINs as plain text. A file is
//! only checked when a device is built from it, so a bad key or an
//! oversized message is reported with the field that caused it.

use anyhow::{bail, Context, Result};
use keyfob_core::{CarRecord, DeviceState, Pin, SessionConfig};
use keyfob_crypto::{AuthorityPublicKey, SharedSecret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Everything a car needs at boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarProvisioning {
    /// Car identity.
    pub car_id: u32,
    /// Board-link key, hex.
    pub shared_secret: String,
    /// Feature authority public key, hex (SEC1 compressed).
    pub authority_public_key: String,
    /// Revealed on unlock.
    pub unlock_message: String,
    /// Revealed per feature; entry `n - 1` belongs to feature `n`.
    #[serde(default)]
    pub feature_messages: Vec<String>,
    /// Hardened-mode protocol timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_timeout_ms: Option<u64>,
}

impl CarProvisioning {
    /// Reads a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path.as_ref())
    }

    /// Writes a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(path.as_ref(), self)
    }

    /// Protocol configuration for the car.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let secret = SharedSecret::from_hex(&self.shared_secret).context("shared_secret")?;
        Ok(SessionConfig::new(authority_key(&self.authority_public_key)?)
            .with_secret(secret)
            .with_timeout(timeout(self.protocol_timeout_ms)))
    }

    /// Factory car record.
    pub fn record(&self) -> Result<CarRecord> {
        let features: Vec<&[u8]> = self
            .feature_messages
            .iter()
            .map(|m| m.as_bytes())
            .collect();
        CarRecord::new(self.unlock_message.as_bytes(), &features).context("car messages")
    }
}

/// Factory pairing of a fob built paired.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FobPairing {
    /// Car the fob is paired to.
    pub car_id: u32,
    /// Six-character pairing PIN.
    pub pin: String,
    /// Board-link key, hex.
    pub shared_secret: String,
}

/// Everything a fob needs at boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FobProvisioning {
    /// Present for fobs built paired.
    #[serde(default)]
    pub paired: Option<FobPairing>,
    /// Feature authority public key, hex (SEC1 compressed).
    pub authority_public_key: String,
    /// Hardened-mode protocol timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_timeout_ms: Option<u64>,
}

impl FobProvisioning {
    /// Reads a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path.as_ref())
    }

    /// Writes a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(path.as_ref(), self)
    }

    /// Protocol configuration for the fob. The key comes from the factory
    /// pairing, if any.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut config = SessionConfig::new(authority_key(&self.authority_public_key)?)
            .with_timeout(timeout(self.protocol_timeout_ms));
        if let Some(pairing) = &self.paired {
            config = config.with_secret(
                SharedSecret::from_hex(&pairing.shared_secret).context("paired.shared_secret")?,
            );
        }
        Ok(config)
    }

    /// State the fob boots with when its store is erased or corrupt.
    pub fn factory_state(&self) -> Result<DeviceState> {
        let pairing = match &self.paired {
            Some(pairing) => pairing,
            None => return Ok(DeviceState::unpaired()),
        };
        let pin = Pin::from_slice(pairing.pin.as_bytes()).context("paired.pin")?;
        let secret =
            SharedSecret::from_hex(&pairing.shared_secret).context("paired.shared_secret")?;
        Ok(DeviceState::paired(pairing.car_id, pin, secret))
    }
}

fn authority_key(hex: &str) -> Result<AuthorityPublicKey> {
    AuthorityPublicKey::from_hex(hex).context("authority_public_key")
}

fn timeout(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    if path.exists() && path.is_dir() {
        bail!("{} is a directory", path.display());
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}
