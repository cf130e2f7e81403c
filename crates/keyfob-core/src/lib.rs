//! Core protocol engine for the car/fob access protocol.
//!
//! This crate implements the protocol layer between a vehicle controller and
//! its key fob:
//! - Message framing over a raw byte channel, with every message except
//!   PAIR sealed under the pairing's shared secret ([`message`], [`link`])
//! - Checksummed, fixed-size device records ([`state`])
//! - PIN-gated pairing ([`pairing`])
//! - Nonce challenge-response unlock ([`unlock`])
//! - Signed feature grants, verified on enable and again on start ([`feature`])
//! - The two device roles and the fob's operator shell ([`car`], [`fob`])
//!
//! Hardware is reached only through the `keyfob_platform` traits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod car;
pub mod config;
pub mod error;
pub mod feature;
pub mod fob;
pub mod link;
pub mod message;
pub mod pairing;
pub mod state;
pub mod unlock;

pub use car::{Car, CarEvent, CarStatus};
pub use config::SessionConfig;
pub use error::{Error, ErrorKind, Policy, Result};
pub use feature::FeaturePackage;
pub use fob::{Fob, FobShell};
pub use link::MessageLink;
pub use message::{Message, MessageType};
pub use state::{CarRecord, DeviceState, FeatureGrant, FeatureSet, PairingRecord, Pin};
