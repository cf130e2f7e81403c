//! Persisted device state.
//!
//! Each device keeps one fixed-size record in non-volatile storage:
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────────┬─────────────────┐
//! │ magic [4]  │ version [1] │ body             │ checksum [8]    │
//! └────────────┴─────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! `checksum` is XXH64 (seed 0) over every preceding byte. A record with the
//! wrong size, magic, version or checksum is rejected as corrupt, so a torn
//! write can never be read back as a valid "paired" state.

use crate::message::{read_u32_le, MAX_FEATURES};
use crate::{Error, Policy, Result};
use keyfob_crypto::secretbox::KEY_BYTES;
use keyfob_crypto::sign::SIGNATURE_BYTES;
use keyfob_crypto::SharedSecret;
use keyfob_platform::RecordStore;
use std::fmt;
use std::hash::Hasher;
use subtle::ConstantTimeEq;
use tracing::{debug, error};
use twox_hash::XxHash64;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// PIN length in bytes.
pub const PIN_BYTES: usize = 6;

/// Length of one car message slot (unlock or feature).
pub const MESSAGE_SLOT_BYTES: usize = 64;

/// Record format version.
pub const RECORD_VERSION: u8 = 1;

/// Fob record magic ("KFOB").
pub const FOB_MAGIC: u32 = u32::from_le_bytes(*b"KFOB");

/// Car record magic ("KCAR").
pub const CAR_MAGIC: u32 = u32::from_le_bytes(*b"KCAR");

const HEADER_BYTES: usize = 5;
const CHECKSUM_BYTES: usize = 8;
const GRANT_BYTES: usize = 1 + SIGNATURE_BYTES;

/// Pairing PIN. Compared in constant time, cleared on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin([u8; PIN_BYTES]);

impl Pin {
    /// Parses a PIN, which must be exactly [`PIN_BYTES`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let pin: [u8; PIN_BYTES] = bytes
            .try_into()
            .map_err(|_| Error::Malformed(format!("PIN must be {} bytes", PIN_BYTES)))?;
        Ok(Self(pin))
    }

    /// Constant-time check of an operator-supplied candidate.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == PIN_BYTES && bool::from(self.0.ct_eq(candidate))
    }

    /// Raw PIN bytes.
    pub fn as_bytes(&self) -> &[u8; PIN_BYTES] {
        &self.0
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Pin {}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(..)")
    }
}

/// What a paired fob knows about its car.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingRecord {
    /// Car identity.
    pub car_id: u32,
    /// PIN that authorizes pairing further fobs.
    pub pin: Pin,
    /// Board-link key shared with the car.
    pub secret: SharedSecret,
}

/// One authority-signed feature grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureGrant {
    /// Feature number.
    pub feature_id: u8,
    /// Authority signature over `(car_id, feature_id)`.
    pub signature: [u8; SIGNATURE_BYTES],
}

/// Grants held by a fob, in enable order.
///
/// Never holds more than [`MAX_FEATURES`] grants or two grants for the
/// same feature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureSet {
    /// Car these grants were issued for.
    pub car_id: u32,
    grants: Vec<FeatureGrant>,
}

impl FeatureSet {
    /// Empty set for `car_id`.
    pub fn new(car_id: u32) -> Self {
        Self {
            car_id,
            grants: Vec::new(),
        }
    }

    /// Builds a set from decoded grants, enforcing the size and uniqueness rules.
    pub fn from_grants(car_id: u32, grants: Vec<FeatureGrant>) -> Result<Self> {
        let mut set = Self::new(car_id);
        for grant in grants {
            set.try_push(grant)?;
        }
        Ok(set)
    }

    /// Appends a grant.
    ///
    /// # Errors
    ///
    /// - `Policy::FeatureListFull` if [`MAX_FEATURES`] grants are held
    /// - `Policy::DuplicateFeature` if the feature is already present
    pub fn try_push(&mut self, grant: FeatureGrant) -> Result<()> {
        if self.is_full() {
            return Err(Policy::FeatureListFull.into());
        }
        if self.contains(grant.feature_id) {
            return Err(Policy::DuplicateFeature.into());
        }
        self.grants.push(grant);
        Ok(())
    }

    /// Number of grants held.
    pub fn count(&self) -> u8 {
        self.grants.len() as u8
    }

    /// Grants in enable order.
    pub fn grants(&self) -> &[FeatureGrant] {
        &self.grants
    }

    /// Whether `feature_id` is already granted.
    pub fn contains(&self, feature_id: u8) -> bool {
        self.grants.iter().any(|g| g.feature_id == feature_id)
    }

    /// Whether no more grants fit.
    pub fn is_full(&self) -> bool {
        self.grants.len() >= MAX_FEATURES
    }
}

/// Fob state.
///
/// `pairing` is `None` until the fob is paired; there is no way back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Pairing record, present once paired.
    pub pairing: Option<PairingRecord>,
    /// Accumulated feature grants.
    pub features: FeatureSet,
}

impl DeviceState {
    /// Unpaired fob with no features.
    pub fn unpaired() -> Self {
        Self::default()
    }

    /// Factory state of a fob built paired to `car_id`.
    pub fn paired(car_id: u32, pin: Pin, secret: SharedSecret) -> Self {
        Self {
            pairing: Some(PairingRecord {
                car_id,
                pin,
                secret,
            }),
            features: FeatureSet::new(car_id),
        }
    }

    /// Whether the fob is paired.
    pub fn is_paired(&self) -> bool {
        self.pairing.is_some()
    }
}

/// Car state: the messages it reveals on unlock and per feature.
#[derive(Clone, PartialEq, Eq)]
pub struct CarRecord {
    unlock_message: [u8; MESSAGE_SLOT_BYTES],
    feature_messages: [[u8; MESSAGE_SLOT_BYTES]; MAX_FEATURES],
}

impl CarRecord {
    /// Builds a record. Each message is at most [`MESSAGE_SLOT_BYTES`] long;
    /// missing feature messages are left empty.
    pub fn new(unlock_message: &[u8], feature_messages: &[&[u8]]) -> Result<Self> {
        if feature_messages.len() > MAX_FEATURES {
            return Err(Error::Malformed(format!(
                "{} feature messages, limit {}",
                feature_messages.len(),
                MAX_FEATURES
            )));
        }
        let mut record = Self {
            unlock_message: slot(unlock_message)?,
            feature_messages: [[0u8; MESSAGE_SLOT_BYTES]; MAX_FEATURES],
        };
        for (dst, msg) in record.feature_messages.iter_mut().zip(feature_messages) {
            *dst = slot(msg)?;
        }
        Ok(record)
    }

    /// Unlock message without trailing padding.
    pub fn unlock_message(&self) -> &[u8] {
        trim_slot(&self.unlock_message)
    }

    /// Message for feature `feature_id` (1-based), without trailing padding.
    pub fn feature_message(&self, feature_id: u8) -> Option<&[u8]> {
        let index = (feature_id as usize).checked_sub(1)?;
        self.feature_messages.get(index).map(|m| trim_slot(m))
    }
}

impl Default for CarRecord {
    fn default() -> Self {
        Self {
            unlock_message: [0u8; MESSAGE_SLOT_BYTES],
            feature_messages: [[0u8; MESSAGE_SLOT_BYTES]; MAX_FEATURES],
        }
    }
}

impl fmt::Debug for CarRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarRecord").finish_non_exhaustive()
    }
}

fn slot(message: &[u8]) -> Result<[u8; MESSAGE_SLOT_BYTES]> {
    if message.len() > MESSAGE_SLOT_BYTES {
        return Err(Error::Malformed(format!(
            "message of {} bytes exceeds slot of {}",
            message.len(),
            MESSAGE_SLOT_BYTES
        )));
    }
    let mut out = [0u8; MESSAGE_SLOT_BYTES];
    out[..message.len()].copy_from_slice(message);
    Ok(out)
}

fn trim_slot(slot: &[u8]) -> &[u8] {
    let end = slot.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &slot[..end]
}

/// A fixed-size persisted record.
pub trait Record: Clone {
    /// Magic at the start of the record.
    const MAGIC: u32;
    /// Total encoded size, header and checksum included.
    const SIZE: usize;

    /// Appends the body (everything between header and checksum).
    fn encode_body(&self, out: &mut Vec<u8>);

    /// Parses a body of exactly `SIZE - 13` bytes.
    fn decode_body(body: &[u8]) -> Result<Self>;

    /// Encodes the complete record.
    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(Self::SIZE));
        out.extend_from_slice(&Self::MAGIC.to_le_bytes());
        out.push(RECORD_VERSION);
        self.encode_body(&mut out);
        out.resize(Self::SIZE - CHECKSUM_BYTES, 0);
        let checksum = checksum(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Decodes and integrity-checks a complete record.
    ///
    /// # Errors
    ///
    /// `Error::StorageCorruption` on any size, magic, version, checksum or
    /// body inconsistency.
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::StorageCorruption(format!(
                "record is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        let (content, tail) = bytes.split_at(Self::SIZE - CHECKSUM_BYTES);
        let mut stored = [0u8; CHECKSUM_BYTES];
        stored.copy_from_slice(tail);
        if checksum(content) != u64::from_le_bytes(stored) {
            return Err(Error::StorageCorruption("checksum mismatch".into()));
        }
        if read_u32_le(content) != Self::MAGIC {
            return Err(Error::StorageCorruption("bad magic".into()));
        }
        if content[4] != RECORD_VERSION {
            return Err(Error::StorageCorruption(format!(
                "unsupported version {}",
                content[4]
            )));
        }
        Self::decode_body(&content[HEADER_BYTES..]).map_err(|e| match e {
            Error::StorageCorruption(_) => e,
            other => Error::StorageCorruption(other.to_string()),
        })
    }
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

impl Record for DeviceState {
    const MAGIC: u32 = FOB_MAGIC;
    const SIZE: usize = 256;

    fn encode_body(&self, out: &mut Vec<u8>) {
        match &self.pairing {
            Some(p) => {
                out.push(1);
                out.extend_from_slice(&p.car_id.to_le_bytes());
                out.extend_from_slice(p.pin.as_bytes());
                out.extend_from_slice(p.secret.as_bytes());
            }
            None => {
                out.push(0);
                out.resize(out.len() + 4 + PIN_BYTES + KEY_BYTES, 0);
            }
        }
        out.extend_from_slice(&self.features.car_id.to_le_bytes());
        out.push(self.features.count());
        for grant in self.features.grants() {
            out.push(grant.feature_id);
            out.extend_from_slice(&grant.signature);
        }
        let unused = MAX_FEATURES - self.features.grants().len();
        out.resize(out.len() + unused * GRANT_BYTES, 0);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        const PAIRING_BYTES: usize = 1 + 4 + PIN_BYTES + KEY_BYTES;
        const FEATURES_BYTES: usize = 4 + 1 + MAX_FEATURES * GRANT_BYTES;
        if body.len() < PAIRING_BYTES + FEATURES_BYTES {
            return Err(Error::StorageCorruption("fob record body too short".into()));
        }

        let pairing = match body[0] {
            0 => None,
            1 => Some(PairingRecord {
                car_id: read_u32_le(&body[1..5]),
                pin: Pin::from_slice(&body[5..5 + PIN_BYTES])?,
                secret: SharedSecret::from_slice(&body[5 + PIN_BYTES..PAIRING_BYTES])?,
            }),
            other => {
                return Err(Error::StorageCorruption(format!(
                    "paired flag {:#04x}",
                    other
                )))
            }
        };

        let features = &body[PAIRING_BYTES..PAIRING_BYTES + FEATURES_BYTES];
        let car_id = read_u32_le(&features[0..4]);
        let count = features[4] as usize;
        if count > MAX_FEATURES {
            return Err(Error::StorageCorruption(format!("feature count {}", count)));
        }
        let grants = features[5..]
            .chunks_exact(GRANT_BYTES)
            .take(count)
            .map(|chunk| {
                let mut signature = [0u8; SIGNATURE_BYTES];
                signature.copy_from_slice(&chunk[1..]);
                FeatureGrant {
                    feature_id: chunk[0],
                    signature,
                }
            })
            .collect();

        Ok(Self {
            pairing,
            features: FeatureSet::from_grants(car_id, grants)?,
        })
    }
}

impl Record for CarRecord {
    const MAGIC: u32 = CAR_MAGIC;
    const SIZE: usize = HEADER_BYTES + (1 + MAX_FEATURES) * MESSAGE_SLOT_BYTES + CHECKSUM_BYTES;

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.unlock_message);
        for message in &self.feature_messages {
            out.extend_from_slice(message);
        }
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut slots = body.chunks_exact(MESSAGE_SLOT_BYTES);
        let mut next = || -> Result<[u8; MESSAGE_SLOT_BYTES]> {
            let chunk = slots
                .next()
                .ok_or_else(|| Error::StorageCorruption("car record body too short".into()))?;
            let mut out = [0u8; MESSAGE_SLOT_BYTES];
            out.copy_from_slice(chunk);
            Ok(out)
        };
        let unlock_message = next()?;
        let mut feature_messages = [[0u8; MESSAGE_SLOT_BYTES]; MAX_FEATURES];
        for message in feature_messages.iter_mut() {
            *message = next()?;
        }
        Ok(Self {
            unlock_message,
            feature_messages,
        })
    }
}

/// A record held in memory and mirrored to a [`RecordStore`].
///
/// Changes go through [`Persisted::update`], which stages them on a copy,
/// persists the copy, and only then makes it current.
pub struct Persisted<R, S> {
    value: R,
    store: S,
}

impl<R: Record, S: RecordStore> Persisted<R, S> {
    /// Loads the record, falling back to `default` when the store is erased
    /// or the record is corrupt. The fallback is persisted immediately.
    ///
    /// # Errors
    ///
    /// Only driver failures; corruption is handled by the fallback.
    pub fn open(mut store: S, default: impl FnOnce() -> R) -> Result<Self> {
        let loaded = match store.load()? {
            None => {
                debug!(magic = R::MAGIC, "no record stored, writing default");
                None
            }
            Some(bytes) => match R::decode(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(magic = R::MAGIC, error = %e, "stored record rejected, writing default");
                    None
                }
            },
        };

        let value = match loaded {
            Some(value) => value,
            None => {
                let value = default();
                store.persist(&value.encode())?;
                value
            }
        };
        Ok(Self { value, store })
    }

    /// Current committed value.
    pub fn get(&self) -> &R {
        &self.value
    }

    /// Applies `f` to a copy, persists it, then commits it.
    ///
    /// If `f` or the persist fails, the current value is unchanged.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut R) -> Result<T>) -> Result<T> {
        let mut staged = self.value.clone();
        let out = f(&mut staged)?;
        self.store.persist(&staged.encode())?;
        self.value = staged;
        Ok(out)
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}
