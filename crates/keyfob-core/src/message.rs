//! Board-link messages and their payload layouts.
//!
//! Wire frame:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────────────────────────────────┐
//! │ tag [1]  │ len [1]  │ payload: len bytes (PAIR)                 │
//! │          │          │   or nonce[24] || ct[len] || mac[16]      │
//! └──────────┴──────────┴───────────────────────────────────────────┘
//! ```
//!
//! All multi-byte integers are little-endian.

use crate::state::{FeatureGrant, FeatureSet, PairingRecord, Pin, PIN_BYTES};
use crate::{Error, Result};
use keyfob_crypto::secretbox::{HEADER_BYTES, KEY_BYTES};
use keyfob_crypto::sign::SIGNATURE_BYTES;
use keyfob_crypto::SharedSecret;
use std::fmt;
use zeroize::Zeroizing;

/// Tag byte meaning "nothing received".
pub const TAG_NONE: u8 = 0x00;
/// Tag for HANDSHAKE ('H').
pub const TAG_HANDSHAKE: u8 = 0x48;
/// Tag for UNLOCK ('U').
pub const TAG_UNLOCK: u8 = 0x55;
/// Tag for START ('S').
pub const TAG_START: u8 = 0x53;
/// Tag for ACK ('A').
pub const TAG_ACK: u8 = 0x41;
/// Tag for PAIR ('P').
pub const TAG_PAIR: u8 = 0x50;

/// Largest plaintext payload: a sealed frame body must fit in 256 bytes.
pub const MAX_PAYLOAD: usize = 256 - HEADER_BYTES;

/// Most features a fob can hold and a car can reveal.
pub const MAX_FEATURES: usize = 3;

/// Domain context authenticated with every sealed message, followed by the tag.
pub const AAD_CONTEXT: &[u8] = b"boardmsg";

/// Nonce payload length.
pub const NONCE_BYTES: usize = 4;

/// PAIR payload length.
pub const PAIR_PAYLOAD_BYTES: usize = 4 + PIN_BYTES + KEY_BYTES;

/// ACK success byte.
pub const ACK_SUCCESS: u8 = 0x01;
/// ACK failure byte.
pub const ACK_FAILURE: u8 = 0x00;

/// Closed set of message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Fob asks for a nonce; car answers with one.
    Handshake = TAG_HANDSHAKE,
    /// Fob echoes the nonce.
    Unlock = TAG_UNLOCK,
    /// Fob presents its feature set.
    Start = TAG_START,
    /// Car reports the unlock outcome.
    Ack = TAG_ACK,
    /// Paired fob hands its pairing record to an unpaired fob. Never sealed.
    Pair = TAG_PAIR,
}

impl MessageType {
    /// Convert to wire format.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from wire format.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            TAG_HANDSHAKE => Some(Self::Handshake),
            TAG_UNLOCK => Some(Self::Unlock),
            TAG_START => Some(Self::Start),
            TAG_ACK => Some(Self::Ack),
            TAG_PAIR => Some(Self::Pair),
            _ => None,
        }
    }

    /// Whether the payload travels sealed.
    pub fn is_sealed(self) -> bool {
        self != Self::Pair
    }

    /// Associated data for this message type: `"boardmsg" || tag`.
    pub fn aad(self) -> [u8; 9] {
        aad_for_tag(self.to_u8())
    }
}

pub(crate) fn aad_for_tag(tag: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(AAD_CONTEXT);
    aad[8] = tag;
    aad
}

/// A decoded (plaintext) message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Message role.
    pub kind: MessageType,
    /// Plaintext payload, at most [`MAX_PAYLOAD`] bytes.
    pub payload: Zeroizing<Vec<u8>>,
}

impl Message {
    /// Builds a message, rejecting payloads longer than [`MAX_PAYLOAD`].
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Malformed(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        Ok(Self {
            kind,
            payload: Zeroizing::new(payload),
        })
    }

    /// Empty HANDSHAKE request.
    pub fn handshake_request() -> Self {
        Self {
            kind: MessageType::Handshake,
            payload: Zeroizing::new(Vec::new()),
        }
    }

    /// HANDSHAKE reply carrying `nonce`.
    pub fn handshake_reply(nonce: u32) -> Self {
        Self {
            kind: MessageType::Handshake,
            payload: Zeroizing::new(nonce.to_le_bytes().to_vec()),
        }
    }

    /// UNLOCK echoing `nonce`.
    pub fn unlock(nonce: u32) -> Self {
        Self {
            kind: MessageType::Unlock,
            payload: Zeroizing::new(nonce.to_le_bytes().to_vec()),
        }
    }

    /// ACK with the given outcome.
    pub fn ack(success: bool) -> Self {
        let byte = if success { ACK_SUCCESS } else { ACK_FAILURE };
        Self {
            kind: MessageType::Ack,
            payload: Zeroizing::new(vec![byte]),
        }
    }

    /// PAIR carrying a full pairing record.
    pub fn pair(record: &PairingRecord) -> Self {
        let mut payload = Vec::with_capacity(PAIR_PAYLOAD_BYTES);
        payload.extend_from_slice(&record.car_id.to_le_bytes());
        payload.extend_from_slice(record.pin.as_bytes());
        payload.extend_from_slice(record.secret.as_bytes());
        Self {
            kind: MessageType::Pair,
            payload: Zeroizing::new(payload),
        }
    }

    /// START presenting `features`.
    pub fn start(features: &FeatureSet) -> Self {
        let grants = features.grants();
        let mut payload = Vec::with_capacity(5 + grants.len() * (1 + SIGNATURE_BYTES));
        payload.extend_from_slice(&features.car_id.to_le_bytes());
        payload.push(features.count());
        for grant in grants {
            payload.push(grant.feature_id);
            payload.extend_from_slice(&grant.signature);
        }
        Self {
            kind: MessageType::Start,
            payload: Zeroizing::new(payload),
        }
    }

    /// Reads the nonce of a HANDSHAKE reply or UNLOCK.
    pub fn nonce(&self) -> Result<u32> {
        check_exact(&self.payload, NONCE_BYTES, "nonce")?;
        Ok(read_u32_le(&self.payload))
    }

    /// Reads an ACK outcome. Any byte other than [`ACK_SUCCESS`] is failure.
    pub fn ack_success(&self) -> Result<bool> {
        check_exact(&self.payload, 1, "ack")?;
        Ok(self.payload[0] == ACK_SUCCESS)
    }

    /// Reads a PAIR payload.
    pub fn pairing_record(&self) -> Result<PairingRecord> {
        let data = &self.payload[..];
        check_exact(data, PAIR_PAYLOAD_BYTES, "pair")?;

        let car_id = read_u32_le(&data[0..4]);
        let pin = Pin::from_slice(&data[4..4 + PIN_BYTES])?;
        let secret = SharedSecret::from_slice(&data[4 + PIN_BYTES..])?;
        Ok(PairingRecord {
            car_id,
            pin,
            secret,
        })
    }

    /// Reads a START payload. The length must match the declared count exactly.
    pub fn feature_set(&self) -> Result<FeatureSet> {
        let data = &self.payload[..];
        check_len(data, 5, "start header")?;

        let car_id = read_u32_le(&data[0..4]);
        let count = data[4] as usize;
        if count > MAX_FEATURES {
            return Err(Error::Malformed(format!(
                "start declares {} features, limit {}",
                count, MAX_FEATURES
            )));
        }
        check_exact(data, 5 + count * (1 + SIGNATURE_BYTES), "start")?;

        let mut grants = Vec::with_capacity(count);
        for chunk in data[5..].chunks_exact(1 + SIGNATURE_BYTES) {
            let mut signature = [0u8; SIGNATURE_BYTES];
            signature.copy_from_slice(&chunk[1..]);
            grants.push(FeatureGrant {
                feature_id: chunk[0],
                signature,
            });
        }
        FeatureSet::from_grants(car_id, grants)
            .map_err(|e| Error::Malformed(format!("start feature list: {}", e)))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .finish()
    }
}

fn check_len(data: &[u8], needed: usize, what: &str) -> Result<()> {
    if data.len() < needed {
        Err(Error::Malformed(format!(
            "{} needs {} bytes, got {}",
            what,
            needed,
            data.len()
        )))
    } else {
        Ok(())
    }
}

fn check_exact(data: &[u8], expected: usize, what: &str) -> Result<()> {
    if data.len() != expected {
        Err(Error::Malformed(format!(
            "{} must be {} bytes, got {}",
            what,
            expected,
            data.len()
        )))
    } else {
        Ok(())
    }
}

#[inline]
pub(crate) fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(feature_id: u8) -> FeatureGrant {
        FeatureGrant {
            feature_id,
            signature: [feature_id; SIGNATURE_BYTES],
        }
    }

    #[test]
    fn test_tags_are_distinct_and_nonzero() {
        let tags = [TAG_HANDSHAKE, TAG_UNLOCK, TAG_START, TAG_ACK, TAG_PAIR];
        for (i, a) in tags.iter().enumerate() {
            assert_ne!(*a, TAG_NONE);
            assert_eq!(MessageType::from_u8(*a).map(MessageType::to_u8), Some(*a));
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(MessageType::from_u8(TAG_NONE), None);
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[test]
    fn test_only_pair_is_unsealed() {
        assert!(!MessageType::Pair.is_sealed());
        assert!(MessageType::Handshake.is_sealed());
        assert!(MessageType::Unlock.is_sealed());
        assert!(MessageType::Start.is_sealed());
        assert!(MessageType::Ack.is_sealed());
    }

    #[test]
    fn test_aad_binds_tag() {
        assert_eq!(&MessageType::Unlock.aad(), b"boardmsgU");
        assert_ne!(MessageType::Handshake.aad(), MessageType::Unlock.aad());
    }

    #[test]
    fn test_payload_limit() {
        assert!(Message::new(MessageType::Start, vec![0; MAX_PAYLOAD]).is_ok());
        assert!(matches!(
            Message::new(MessageType::Start, vec![0; MAX_PAYLOAD + 1]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_nonce_layout() {
        let msg = Message::unlock(0x0403_0201);
        assert_eq!(&msg.payload[..], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(msg.nonce().unwrap(), 0x0403_0201);

        assert!(Message::handshake_request().nonce().is_err());
    }

    #[test]
    fn test_ack_values() {
        assert!(Message::ack(true).ack_success().unwrap());
        assert!(!Message::ack(false).ack_success().unwrap());
        let odd = Message::new(MessageType::Ack, vec![0x7F]).unwrap();
        assert!(!odd.ack_success().unwrap());
        let long = Message::new(MessageType::Ack, vec![1, 1]).unwrap();
        assert!(long.ack_success().is_err());
    }

    #[test]
    fn test_pair_layout() {
        let record = PairingRecord {
            car_id: 0x0000_0102,
            pin: Pin::from_slice(b"123456").unwrap(),
            secret: SharedSecret::from_bytes([0x5A; KEY_BYTES]),
        };
        let msg = Message::pair(&record);
        assert_eq!(msg.payload.len(), PAIR_PAYLOAD_BYTES);
        assert_eq!(&msg.payload[..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(&msg.payload[4..10], b"123456");
        assert_eq!(msg.pairing_record().unwrap(), record);

        let short = Message::new(MessageType::Pair, msg.payload[..41].to_vec()).unwrap();
        assert!(matches!(short.pairing_record(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_start_layout() {
        let mut features = FeatureSet::new(7);
        features.try_push(grant(1)).unwrap();
        features.try_push(grant(3)).unwrap();

        let msg = Message::start(&features);
        assert_eq!(msg.payload.len(), 5 + 2 * 65);
        assert_eq!(msg.payload[4], 2);
        assert_eq!(msg.payload[5], 1);
        assert_eq!(msg.payload[5 + 65], 3);
        assert_eq!(msg.feature_set().unwrap(), features);
    }

    #[test]
    fn test_start_rejects_bad_lengths() {
        let mut features = FeatureSet::new(7);
        features.try_push(grant(2)).unwrap();
        let mut payload = Message::start(&features).payload.to_vec();

        payload.push(0);
        let long = Message::new(MessageType::Start, payload.clone()).unwrap();
        assert!(long.feature_set().is_err());

        payload.truncate(payload.len() - 2);
        let short = Message::new(MessageType::Start, payload).unwrap();
        assert!(short.feature_set().is_err());

        let mut too_many = vec![7, 0, 0, 0, 4];
        too_many.extend(std::iter::repeat(0).take(4 * 65));
        let too_many = Message::new(MessageType::Start, too_many[..MAX_PAYLOAD].to_vec()).unwrap();
        assert!(too_many.feature_set().is_err());
    }

    #[test]
    fn test_start_rejects_duplicate_ids() {
        let mut payload = vec![7, 0, 0, 0, 2];
        payload.push(1);
        payload.extend_from_slice(&[0; SIGNATURE_BYTES]);
        payload.push(1);
        payload.extend_from_slice(&[0; SIGNATURE_BYTES]);
        let msg = Message::new(MessageType::Start, payload).unwrap();
        assert!(matches!(msg.feature_set(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_debug_hides_payload() {
        let msg = Message::unlock(0xDEAD_BEEF);
        let text = format!("{:?}", msg);
        assert!(text.contains("Unlock"));
        assert!(!text.contains("222"));
    }
}
