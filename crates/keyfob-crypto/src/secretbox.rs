//! Secretbox-style authenticated encryption for board-link messages.
//!
//! Every message except PAIR is sealed with the pairing's [`SharedSecret`]
//! before it reaches the serial line.
//!
//! Sealed layout:
//!
//! ```text
//! ┌──────────────┬──────────────────┬───────────┐
//! │ nonce [24]   │ ciphertext [len] │ tag [16]  │
//! └──────────────┴──────────────────┴───────────┘
//! ```
//!
//! The nonce is drawn from the OS RNG for every message, so XChaCha20's
//! 192-bit nonce space makes collisions negligible without any counter state
//! surviving across reboots.

use crate::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Shared secret length in bytes.
pub const KEY_BYTES: usize = 32;

/// XChaCha20 nonce length in bytes.
pub const NONCE_BYTES: usize = 24;

/// Poly1305 tag length in bytes.
pub const TAG_BYTES: usize = 16;

/// Bytes a sealed message carries on top of its plaintext.
pub const HEADER_BYTES: usize = NONCE_BYTES + TAG_BYTES;

/// Symmetric key shared by a car and its paired fobs.
///
/// Cleared from memory on drop. Equality is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_BYTES]);

impl SharedSecret {
    /// Generate a fresh secret from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// Wrap a key from a slice, which must be exactly [`KEY_BYTES`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| Error::InvalidLength {
            expected: KEY_BYTES,
            actual: bytes.len(),
        })?;
        Ok(Self(key))
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(text.trim())?);
        Self::from_slice(&bytes)
    }

    /// Hex-encode the key (for provisioning files only).
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Seal `plaintext` under `key`, authenticating `aad` alongside it.
///
/// # Returns
/// `nonce || ciphertext || tag`, exactly `plaintext.len() + HEADER_BYTES` long.
///
/// # Example
/// ```
/// use keyfob_crypto::secretbox::{open, seal, HEADER_BYTES};
/// use keyfob_crypto::SharedSecret;
///
/// let key = SharedSecret::from_bytes([0x42; 32]);
/// let sealed = seal(&key, b"nonce", b"boardmsgU").unwrap();
/// assert_eq!(sealed.len(), 5 + HEADER_BYTES);
/// assert_eq!(&*open(&key, &sealed, b"boardmsgU").unwrap(), b"nonce");
/// ```
pub fn seal(key: &SharedSecret, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Encryption("XChaCha20-Poly1305 encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a message produced by [`seal`].
///
/// # Errors
///
/// Returns `Error::Decryption` if the input is shorter than [`HEADER_BYTES`],
/// was sealed under another key or `aad`, or was modified in transit.
pub fn open(key: &SharedSecret, sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < HEADER_BYTES {
        return Err(Error::Decryption("sealed message truncated".into()));
    }

    let (nonce, ciphertext_and_tag) = sealed.split_at(NONCE_BYTES);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| Error::Decryption("XChaCha20-Poly1305 authentication failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AAD: &[u8] = b"boardmsgH";

    #[test]
    fn test_roundtrip_all_lengths() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        for len in [0usize, 1, 4, 42, 200, 216] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let sealed = seal(&key, &plaintext, AAD).unwrap();
            assert_eq!(sealed.len(), len + HEADER_BYTES);
            let opened = open(&key, &sealed, AAD).unwrap();
            assert_eq!(&*opened, &plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let key2 = SharedSecret::from_bytes([0x43; KEY_BYTES]);
        let sealed = seal(&key1, b"secret message", AAD).unwrap();
        assert!(open(&key2, &sealed, AAD).is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let sealed = seal(&key, b"\x01\x02\x03\x04", b"boardmsgH").unwrap();
        assert!(open(&key, &sealed, b"boardmsgU").is_err());
    }

    #[test]
    fn test_tampered_byte_fails() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let sealed = seal(&key, b"secret message", AAD).unwrap();
        for i in 0..sealed.len() {
            let mut corrupted = sealed.clone();
            corrupted[i] ^= 0x01;
            assert!(open(&key, &corrupted, AAD).is_err(), "byte {} flip accepted", i);
        }
    }

    #[test]
    fn test_truncated_fails() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let sealed = seal(&key, b"", AAD).unwrap();
        assert!(open(&key, &sealed[..HEADER_BYTES - 1], AAD).is_err());
        assert!(open(&key, &[], AAD).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let a = seal(&key, b"same", AAD).unwrap();
        let b = seal(&key, b"same", AAD).unwrap();
        assert_ne!(a[..NONCE_BYTES], b[..NONCE_BYTES]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_secret_hex() {
        let key = SharedSecret::generate();
        let parsed = SharedSecret::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
        assert_ne!(key, SharedSecret::generate());

        assert!(matches!(
            SharedSecret::from_hex("abcd"),
            Err(Error::InvalidLength { expected: 32, actual: 2 })
        ));
        assert!(matches!(SharedSecret::from_hex("zz"), Err(Error::Hex(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SharedSecret::from_bytes([0xAB; KEY_BYTES]);
        assert_eq!(format!("{:?}", key), "SharedSecret(..)");
    }
}
