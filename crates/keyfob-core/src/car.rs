//! Car role: answers handshakes, gates unlock on the nonce, verifies start.
//!
//! The car is event driven. Each [`Car::step`] reads one message and reacts
//! according to the current phase:
//!
//! | phase            | HANDSHAKE        | UNLOCK                         | START           |
//! |------------------|------------------|--------------------------------|-----------------|
//! | idle             | issue nonce      | ACK failure                    | drop            |
//! | awaiting unlock  | issue new nonce  | ACK, unlock on match, else idle| drop            |
//! | awaiting start   | drop             | ACK failure                    | verify, to idle |
//!
//! With a protocol timeout configured, the awaiting phases fall back to idle
//! once it passes. The idle phase waits forever.

use crate::config::SessionConfig;
use crate::feature;
use crate::link::MessageLink;
use crate::message::{Message, MessageType};
use crate::state::{CarRecord, Persisted};
use crate::unlock::NonceGate;
use crate::{ErrorKind, Result};
use keyfob_platform::{ByteChannel, RecordStore};
use rand::{CryptoRng, RngCore};
use std::io::Write;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Visible car state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarStatus {
    /// Not yet unlocked.
    Locked,
    /// Unlocked by a fob.
    Unlocked,
    /// Started with a verified feature set.
    Started,
}

/// What one [`Car::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarEvent {
    /// Sentinel byte read; nothing to do.
    Nothing,
    /// Answered a HANDSHAKE with a fresh nonce.
    NonceIssued,
    /// Nonce matched; unlock message revealed and ACK success sent.
    Unlocked,
    /// Nonce missing or wrong; ACK failure sent.
    UnlockRejected,
    /// Start verified; these features were revealed.
    Started {
        /// Feature ids, in the order presented.
        features: Vec<u8>,
    },
    /// Start refused; nothing revealed.
    StartRejected,
    /// Message ignored in this phase, malformed, or unauthenticated.
    Dropped,
    /// An awaiting phase ran out of time and the car went back to idle.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingUnlock,
    AwaitingStart,
}

/// The car device.
pub struct Car<C, S, R, W> {
    car_id: u32,
    link: MessageLink<C>,
    record: Persisted<CarRecord, S>,
    config: SessionConfig,
    rng: R,
    output: W,
    gate: NonceGate,
    phase: Phase,
    deadline: Option<Instant>,
    status: CarStatus,
}

impl<C, S, R, W> Car<C, S, R, W>
where
    C: ByteChannel,
    S: RecordStore,
    R: RngCore + CryptoRng,
    W: Write,
{
    /// Boots the car.
    ///
    /// `factory` provides the record when the store is erased or corrupt.
    ///
    /// # Errors
    ///
    /// `Policy::NotPaired` if `config` carries no shared secret, or a
    /// storage driver error.
    pub fn boot(
        car_id: u32,
        channel: C,
        store: S,
        factory: impl FnOnce() -> CarRecord,
        config: SessionConfig,
        rng: R,
        output: W,
    ) -> Result<Self> {
        let key = config
            .shared_secret
            .clone()
            .ok_or(crate::Policy::NotPaired)?;
        let record = Persisted::open(store, factory)?;
        info!(car_id, "car booted");
        Ok(Self {
            car_id,
            link: MessageLink::new(channel, Some(key)),
            record,
            config,
            rng,
            output,
            gate: NonceGate::new(),
            phase: Phase::Idle,
            deadline: None,
            status: CarStatus::Locked,
        })
    }

    /// Car identity.
    pub fn car_id(&self) -> u32 {
        self.car_id
    }

    /// Visible state.
    pub fn status(&self) -> CarStatus {
        self.status
    }

    /// Persisted messages.
    pub fn record(&self) -> &CarRecord {
        self.record.get()
    }

    /// Operator channel.
    pub fn output(&self) -> &W {
        &self.output
    }

    /// Board link.
    pub fn link_mut(&mut self) -> &mut MessageLink<C> {
        &mut self.link
    }

    /// Whether the car is between protocol runs.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Reads and handles one message.
    ///
    /// # Errors
    ///
    /// Link or operator-channel failures. Protocol-level refusals are
    /// reported as events, never as errors.
    pub fn step(&mut self) -> Result<CarEvent> {
        let message = match self.link.receive_before(self.deadline) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(CarEvent::Nothing),
            Err(e) if e.kind() == ErrorKind::ProtocolTimeout => {
                warn!(phase = ?self.phase, "protocol timeout, back to idle");
                self.reset();
                return Ok(CarEvent::TimedOut);
            }
            Err(e) if e.is_droppable() => {
                warn!(error = %e, "dropping bad message");
                return Ok(CarEvent::Dropped);
            }
            Err(e) => return Err(e),
        };

        match (self.phase, message.kind) {
            (Phase::Idle | Phase::AwaitingUnlock, MessageType::Handshake) => self.issue_nonce(),
            (_, MessageType::Unlock) => self.handle_unlock(&message),
            (Phase::AwaitingStart, MessageType::Start) => self.handle_start(&message),
            (phase, kind) => {
                debug!(?phase, ?kind, "ignoring message");
                Ok(CarEvent::Dropped)
            }
        }
    }

    /// Steps until the link fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }

    fn issue_nonce(&mut self) -> Result<CarEvent> {
        let nonce = self.gate.issue(&mut self.rng);
        self.link.send(&Message::handshake_reply(nonce))?;
        self.enter(Phase::AwaitingUnlock);
        debug!("nonce issued");
        Ok(CarEvent::NonceIssued)
    }

    fn handle_unlock(&mut self, message: &Message) -> Result<CarEvent> {
        let accepted = match message.nonce() {
            Ok(echoed) => self.gate.redeem(echoed),
            Err(_) => {
                self.gate.clear();
                false
            }
        };

        if !accepted {
            self.link.send(&Message::ack(false))?;
            if self.phase == Phase::AwaitingUnlock {
                self.reset();
            }
            warn!("unlock rejected");
            return Ok(CarEvent::UnlockRejected);
        }

        self.output.write_all(self.record.get().unlock_message())?;
        self.output.write_all(b"\n")?;
        self.output.flush()?;
        self.link.send(&Message::ack(true))?;
        self.status = CarStatus::Unlocked;
        self.enter(Phase::AwaitingStart);
        info!(car_id = self.car_id, "car unlocked");
        Ok(CarEvent::Unlocked)
    }

    fn handle_start(&mut self, message: &Message) -> Result<CarEvent> {
        self.reset();

        let verified = message
            .feature_set()
            .and_then(|features| {
                feature::verify_start(&features, self.car_id, &self.config.authority_key)
            });
        let features = match verified {
            Ok(features) => features,
            Err(e) => {
                warn!(error = %e, "start rejected");
                return Ok(CarEvent::StartRejected);
            }
        };

        let record = self.record.get();
        for &id in &features {
            if let Some(text) = record.feature_message(id) {
                self.output.write_all(text)?;
                self.output.write_all(b"\n")?;
            }
        }
        self.output.flush()?;
        self.status = CarStatus::Started;
        info!(car_id = self.car_id, count = features.len(), "car started");
        Ok(CarEvent::Started { features })
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.deadline = self.config.protocol_timeout.map(|t| Instant::now() + t);
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.deadline = None;
        self.gate.clear();
    }
}

impl<C, S, R, W> std::fmt::Debug for Car<C, S, R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Car")
            .field("car_id", &self.car_id)
            .field("phase", &self.phase)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
