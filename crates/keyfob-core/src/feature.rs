//! Signed feature grants: enable on the fob, verify on the car.
//!
//! Package format (hex on the operator line, 138 characters):
//!
//! ```text
//! ┌─────────────┬────────────────┬─────────────────┐
//! │ car_id [4]  │ feature_id [1] │ signature [64]  │
//! └─────────────┴────────────────┴─────────────────┘
//! ```

use crate::message::MAX_FEATURES;
use crate::state::{DeviceState, FeatureGrant, FeatureSet};
use crate::{Error, Policy, Result};
use keyfob_crypto::sign::SIGNATURE_BYTES;
use keyfob_crypto::{AuthorityKeyPair, AuthorityPublicKey};
use tracing::debug;

/// Encoded package length in bytes.
pub const PACKAGE_BYTES: usize = 4 + 1 + SIGNATURE_BYTES;

/// Encoded package length in hex characters.
pub const PACKAGE_HEX_LEN: usize = PACKAGE_BYTES * 2;

/// A grant of one feature to one car, as distributed to operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeaturePackage {
    /// Car the feature is granted to.
    pub car_id: u32,
    /// Feature number.
    pub feature_id: u8,
    /// Authority signature over `(car_id, feature_id)`.
    pub signature: [u8; SIGNATURE_BYTES],
}

impl FeaturePackage {
    /// Signs a new package with the authority key.
    pub fn sign(authority: &AuthorityKeyPair, car_id: u32, feature_id: u8) -> Self {
        Self {
            car_id,
            feature_id,
            signature: authority.sign_feature(car_id, feature_id),
        }
    }

    /// Checks the signature against `authority`.
    pub fn verify(&self, authority: &AuthorityPublicKey) -> Result<()> {
        authority.verify_feature(self.car_id, self.feature_id, &self.signature)?;
        Ok(())
    }

    /// Wire bytes.
    pub fn to_bytes(&self) -> [u8; PACKAGE_BYTES] {
        let mut out = [0u8; PACKAGE_BYTES];
        out[..4].copy_from_slice(&self.car_id.to_le_bytes());
        out[4] = self.feature_id;
        out[5..].copy_from_slice(&self.signature);
        out
    }

    /// Parses wire bytes, which must be exactly [`PACKAGE_BYTES`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PACKAGE_BYTES {
            return Err(Error::Malformed(format!(
                "feature package must be {} bytes, got {}",
                PACKAGE_BYTES,
                bytes.len()
            )));
        }
        let mut signature = [0u8; SIGNATURE_BYTES];
        signature.copy_from_slice(&bytes[5..]);
        Ok(Self {
            car_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            feature_id: bytes[4],
            signature,
        })
    }

    /// Lower-case hex of the wire bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parses hex. Surrounding whitespace is ignored.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::Malformed(format!("feature package hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// The grant a fob stores.
    pub fn grant(&self) -> FeatureGrant {
        FeatureGrant {
            feature_id: self.feature_id,
            signature: self.signature,
        }
    }
}

/// Fob side: validates a hex package and appends its grant to `state`.
///
/// Checks, in order: hex decodes, fob is paired, car id matches, feature id
/// has a message slot on the car, list not full, feature not present,
/// signature valid. `state` is untouched unless every check passes.
///
/// # Returns
/// The enabled feature id.
pub fn enable(state: &mut DeviceState, authority: &AuthorityPublicKey, package_hex: &str) -> Result<u8> {
    let package = FeaturePackage::from_hex(package_hex)?;
    let pairing = state.pairing.as_ref().ok_or(Policy::NotPaired)?;

    if package.car_id != pairing.car_id {
        return Err(Policy::WrongCarId.into());
    }
    if !is_known_feature(package.feature_id) {
        return Err(Policy::UnknownFeature.into());
    }
    if state.features.is_full() {
        return Err(Policy::FeatureListFull.into());
    }
    if state.features.contains(package.feature_id) {
        return Err(Policy::DuplicateFeature.into());
    }
    package.verify(authority)?;

    state.features.try_push(package.grant())?;
    debug!(feature_id = package.feature_id, "feature enabled");
    Ok(package.feature_id)
}

/// Car side: re-verifies every grant a fob presents at start.
///
/// All-or-nothing: any wrong car id, bad signature or feature without a
/// message slot rejects the whole set.
///
/// # Returns
/// Feature ids in presentation order.
pub fn verify_start(
    features: &FeatureSet,
    car_id: u32,
    authority: &AuthorityPublicKey,
) -> Result<Vec<u8>> {
    if features.car_id != car_id {
        return Err(Policy::WrongCarId.into());
    }
    let mut verified = Vec::with_capacity(features.grants().len());
    for grant in features.grants() {
        authority.verify_feature(car_id, grant.feature_id, &grant.signature)?;
        if !is_known_feature(grant.feature_id) {
            return Err(Policy::UnknownFeature.into());
        }
        verified.push(grant.feature_id);
    }
    Ok(verified)
}

/// Feature ids the car has a message slot for.
fn is_known_feature(feature_id: u8) -> bool {
    (1..=MAX_FEATURES as u8).contains(&feature_id)
}
