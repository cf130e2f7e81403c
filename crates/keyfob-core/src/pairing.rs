//! PIN-gated pairing.
//!
//! A paired fob hands its pairing record, in the clear, to whatever is on
//! the board link once the operator proves they know the PIN. Physical
//! access plus the PIN is the authentication; there is no cryptography.

use crate::link::MessageLink;
use crate::message::{Message, MessageType};
use crate::state::PairingRecord;
use crate::{Policy, Result};
use keyfob_platform::ByteChannel;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Initiator side: sends `record` if `candidate_pin` matches its PIN.
///
/// No acknowledgment is expected.
///
/// # Errors
///
/// `Policy::PinMismatch` if the PIN is wrong; nothing is sent.
pub fn offer<C: ByteChannel>(
    link: &mut MessageLink<C>,
    record: &PairingRecord,
    candidate_pin: &[u8],
) -> Result<()> {
    if !record.pin.matches(candidate_pin) {
        debug!("pairing refused");
        return Err(Policy::PinMismatch.into());
    }
    link.send(&Message::pair(record))?;
    debug!(car_id = record.car_id, "pairing record sent");
    Ok(())
}

/// Responder side: waits for a well-formed PAIR message.
///
/// Malformed PAIR payloads are dropped like any other bad traffic. With a
/// `timeout`, gives up with `Error::Timeout`.
pub fn accept<C: ByteChannel>(
    link: &mut MessageLink<C>,
    timeout: Option<Duration>,
) -> Result<PairingRecord> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let message = link.receive_until(MessageType::Pair, remaining)?;
        match message.pairing_record() {
            Ok(record) => return Ok(record),
            Err(e) => warn!(error = %e, "dropping malformed pairing record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Pin;
    use crate::Error;
    use keyfob_crypto::SharedSecret;
    use keyfob_platform::mock::MockChannel;
    use keyfob_platform::ByteChannel;

    fn record() -> PairingRecord {
        PairingRecord {
            car_id: 31337,
            pin: Pin::from_slice(b"271828").unwrap(),
            secret: SharedSecret::from_bytes([0x0F; 32]),
        }
    }

    #[test]
    fn test_offer_then_accept() {
        let (a, b) = MockChannel::pair();
        let mut initiator = MessageLink::new(a, Some(record().secret));
        let mut responder = MessageLink::new(b, None);

        offer(&mut initiator, &record(), b"271828").unwrap();
        assert_eq!(accept(&mut responder, None).unwrap(), record());
    }

    #[test]
    fn test_wrong_pin_sends_nothing() {
        let (a, mut b) = MockChannel::pair();
        let mut initiator = MessageLink::new(a, None);
        for pin in [&b"271829"[..], b"27182", b"2718288", b""] {
            assert!(matches!(
                offer(&mut initiator, &record(), pin),
                Err(Error::Policy(Policy::PinMismatch))
            ));
        }
        b.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        assert!(b.recv_byte().is_err());
    }

    #[test]
    fn test_accept_skips_malformed_pair() {
        let (a, b) = MockChannel::pair();
        let mut initiator = MessageLink::new(a, None);
        let mut responder = MessageLink::new(b, None);

        initiator
            .send(&Message::new(MessageType::Pair, vec![1; 10]).unwrap())
            .unwrap();
        offer(&mut initiator, &record(), b"271828").unwrap();
        assert_eq!(accept(&mut responder, None).unwrap(), record());
    }

    #[test]
    fn test_accept_times_out() {
        let (_a, b) = MockChannel::pair();
        let mut responder = MessageLink::new(b, None);
        assert!(matches!(
            accept(&mut responder, Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
    }
}
