//! Feature-grant signatures (ECDSA P-256 over SHA-256).
//!
//! The feature authority signs `(car_id, feature_id)` offline. Its public key
//! is baked into both devices: the fob verifies a grant before storing it and
//! the car verifies it again at start time.
//!
//! Signed bytes:
//!
//! ```text
//! "feature" || car_id (u32, little-endian) || feature_id (u8)
//! ```
//!
//! Signatures use the fixed 64-byte `r || s` encoding. Public keys are SEC1
//! compressed points (33 bytes).

use crate::{Error, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use std::fmt;
use zeroize::Zeroizing;

/// Domain context prefixed to every signed grant.
pub const FEATURE_CONTEXT: &[u8] = b"feature";

/// Encoded signature length.
pub const SIGNATURE_BYTES: usize = 64;

/// Encoded (compressed SEC1) public key length.
pub const PUBLIC_KEY_BYTES: usize = 33;

/// Encoded secret scalar length.
pub const SECRET_KEY_BYTES: usize = 32;

/// Grant message: `car_id` then `feature_id`, fixed width, no padding.
pub fn feature_message(car_id: u32, feature_id: u8) -> [u8; 5] {
    let mut msg = [0u8; 5];
    msg[..4].copy_from_slice(&car_id.to_le_bytes());
    msg[4] = feature_id;
    msg
}

fn signed_bytes(car_id: u32, feature_id: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FEATURE_CONTEXT.len() + 5);
    bytes.extend_from_slice(FEATURE_CONTEXT);
    bytes.extend_from_slice(&feature_message(car_id, feature_id));
    bytes
}

/// Feature authority signing key. Never present on a car or fob.
pub struct AuthorityKeyPair {
    signing_key: SigningKey,
}

impl AuthorityKeyPair {
    /// Generate a new random key pair using the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restore a key pair from its 32-byte secret scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is wrong or the scalar is zero or out of range.
    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        if secret.len() != SECRET_KEY_BYTES {
            return Err(Error::InvalidLength {
                expected: SECRET_KEY_BYTES,
                actual: secret.len(),
            });
        }
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|_| Error::InvalidPrivateKey("not a valid P-256 scalar".into()))?;
        Ok(Self { signing_key })
    }

    /// Restore a key pair from a hex-encoded secret scalar.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(text.trim())?);
        Self::from_bytes(&bytes)
    }

    /// Secret scalar (for writing the authority's key file).
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_BYTES]> {
        let mut out = Zeroizing::new([0u8; SECRET_KEY_BYTES]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Public half, for provisioning devices.
    pub fn public_key(&self) -> AuthorityPublicKey {
        AuthorityPublicKey {
            key: VerifyingKey::from(&self.signing_key),
        }
    }

    /// Sign a grant of `feature_id` to `car_id`.
    pub fn sign_feature(&self, car_id: u32, feature_id: u8) -> [u8; SIGNATURE_BYTES] {
        let signature: Signature = self.signing_key.sign(&signed_bytes(car_id, feature_id));
        let mut out = [0u8; SIGNATURE_BYTES];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

impl fmt::Debug for AuthorityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Feature authority verification key, baked into cars and fobs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorityPublicKey {
    key: VerifyingKey,
}

impl AuthorityPublicKey {
    /// Parse a SEC1-encoded point (compressed or uncompressed).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::InvalidPublicKey("not a valid P-256 point".into()))?;
        Ok(Self { key })
    }

    /// Parse a hex-encoded SEC1 point.
    pub fn from_hex(text: &str) -> Result<Self> {
        Self::from_bytes(&hex::decode(text.trim())?)
    }

    /// Compressed SEC1 encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_BYTES] {
        let point = self.key.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_BYTES];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Hex of the compressed SEC1 encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Check that `signature` grants `feature_id` to `car_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSignature` for any mismatch, including
    /// signatures that are not well-formed encodings.
    pub fn verify_feature(
        &self,
        car_id: u32,
        feature_id: u8,
        signature: &[u8; SIGNATURE_BYTES],
    ) -> Result<()> {
        let signature =
            Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
        self.key
            .verify(&signed_bytes(car_id, feature_id), &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Debug for AuthorityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorityPublicKey({})", self.to_hex())
    }
}
