//! Cryptographic primitives for the car/fob access protocol.
//!
//! This crate provides the two primitives the protocol engine is built on:
//! - Secretbox-style authenticated encryption for board-link messages
//!   (XChaCha20-Poly1305, random 24-byte nonce, see [`secretbox`])
//! - Feature-grant signatures issued by the offline feature authority
//!   (ECDSA P-256 over SHA-256, see [`sign`])
//!
//! Security notes:
//! - Shared secrets are zeroized on drop and compared in constant time
//! - Decryption and verification fail closed and never reveal why
//! - No logging of key material

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod secretbox;
pub mod sign;

pub use error::{Error, Result};
pub use secretbox::SharedSecret;
pub use sign::{AuthorityKeyPair, AuthorityPublicKey};
