//! Nonce challenge-response unlock.
//!
//! ```text
//! fob                         car
//!  │── HANDSHAKE () ──────────▶│  issue fresh nonce N
//!  │◀───────── HANDSHAKE (N) ──│
//!  │── UNLOCK (N) ────────────▶│  N == outstanding nonce?
//!  │◀─────────────── ACK (ok) ─│  nonce consumed either way
//! ```
//!
//! The car hands a nonce to anyone who asks and never rate-limits or locks
//! out. An attacker on the wire can request and probe indefinitely.

use crate::link::MessageLink;
use crate::message::{Message, MessageType};
use crate::{Error, Result};
use keyfob_platform::ByteChannel;
use rand::{CryptoRng, RngCore};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Car-side record of the single outstanding nonce.
#[derive(Debug, Default)]
pub struct NonceGate {
    outstanding: Option<u32>,
}

impl NonceGate {
    /// Gate with no nonce outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh nonce, replacing any outstanding one.
    pub fn issue<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> u32 {
        let nonce = rng.next_u32();
        self.outstanding = Some(nonce);
        nonce
    }

    /// Checks an echoed nonce and consumes the outstanding one.
    ///
    /// Returns false if nothing was outstanding.
    pub fn redeem(&mut self, echoed: u32) -> bool {
        match self.outstanding.take() {
            Some(nonce) => nonce.to_le_bytes().ct_eq(&echoed.to_le_bytes()).into(),
            None => false,
        }
    }

    /// Whether a nonce is waiting to be echoed.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Drops the outstanding nonce.
    pub fn clear(&mut self) {
        self.outstanding = None;
    }
}

/// Fob side: runs the handshake and unlock exchange.
///
/// # Errors
///
/// - `Error::Denied` if the car answers ACK failure
/// - `Error::Malformed` if the nonce reply or ACK has the wrong shape
/// - `Error::Timeout` if `timeout` passes first
pub fn request<C: ByteChannel>(link: &mut MessageLink<C>, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));

    link.send(&Message::handshake_request())?;
    let reply = link.receive_until(MessageType::Handshake, remaining())?;
    let nonce = reply.nonce()?;
    debug!("nonce received");

    link.send(&Message::unlock(nonce))?;
    let ack = link.receive_until(MessageType::Ack, remaining())?;
    if ack.ack_success()? {
        debug!("unlock accepted");
        Ok(())
    } else {
        debug!("unlock denied");
        Err(Error::Denied)
    }
}
