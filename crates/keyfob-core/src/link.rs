//! Framed, sealed messaging over a raw byte channel.

use crate::message::{aad_for_tag, Message, MessageType, MAX_PAYLOAD, TAG_NONE};
use crate::{Error, Policy, Result};
use keyfob_crypto::secretbox::{self, HEADER_BYTES};
use keyfob_crypto::SharedSecret;
use keyfob_platform::ByteChannel;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Sends and receives [`Message`]s over a [`ByteChannel`].
///
/// Every message except PAIR is sealed with the current shared secret and
/// `"boardmsg" || tag` as associated data.
pub struct MessageLink<C> {
    channel: C,
    key: Option<SharedSecret>,
    timeout_armed: bool,
}

impl<C: ByteChannel> MessageLink<C> {
    /// Wraps `channel`. `key` is `None` until the device is paired.
    pub fn new(channel: C, key: Option<SharedSecret>) -> Self {
        Self {
            channel,
            key,
            timeout_armed: false,
        }
    }

    /// Replaces the shared secret (pairing).
    pub fn set_key(&mut self, key: SharedSecret) {
        self.key = Some(key);
    }

    /// Current shared secret.
    pub fn key(&self) -> Option<&SharedSecret> {
        self.key.as_ref()
    }

    /// Underlying channel.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Writes one framed message.
    ///
    /// # Returns
    /// The number of bytes written to the channel.
    ///
    /// # Errors
    ///
    /// - `Error::Malformed` if the payload exceeds [`MAX_PAYLOAD`]
    /// - `Policy::NotPaired` for a sealed message with no shared secret
    pub fn send(&mut self, message: &Message) -> Result<usize> {
        let len = message.payload.len();
        if len > MAX_PAYLOAD {
            return Err(Error::Malformed(format!(
                "payload of {} bytes exceeds {}",
                len, MAX_PAYLOAD
            )));
        }

        let tag = message.kind.to_u8();
        let mut frame = Zeroizing::new(Vec::with_capacity(2 + HEADER_BYTES + len));
        frame.push(tag);
        frame.push(len as u8);
        if message.kind.is_sealed() {
            let key = self.key.as_ref().ok_or(Error::Policy(Policy::NotPaired))?;
            frame.extend_from_slice(&secretbox::seal(key, &message.payload, &aad_for_tag(tag))?);
        } else {
            frame.extend_from_slice(&message.payload);
        }

        self.channel.send(&frame)?;
        debug!(kind = ?message.kind, len, "message sent");
        Ok(frame.len())
    }

    /// Blocks until one framed message has been read.
    ///
    /// # Returns
    /// `None` for the "nothing received" sentinel tag.
    ///
    /// # Errors
    ///
    /// - `Error::Malformed` for an unknown tag or an oversized length; the
    ///   frame's bytes are consumed first so the next read starts on a frame
    /// - `Error::CorruptMessage` if a sealed payload fails authentication
    pub fn receive(&mut self) -> Result<Option<Message>> {
        self.receive_before(None)
    }

    /// Like [`MessageLink::receive`], but gives up with `Error::Timeout`
    /// once `deadline` passes.
    pub fn receive_before(&mut self, deadline: Option<Instant>) -> Result<Option<Message>> {
        let tag = self.read_byte(deadline)?;
        if tag == TAG_NONE {
            return Ok(None);
        }
        let len = self.read_byte(deadline)? as usize;

        let kind = MessageType::from_u8(tag);
        let body_len = match kind {
            Some(MessageType::Pair) => len,
            _ => len + HEADER_BYTES,
        };
        let mut body = Zeroizing::new(vec![0u8; body_len]);
        self.read_exact(&mut body, deadline)?;

        let kind = kind.ok_or_else(|| Error::Malformed(format!("unknown tag {:#04x}", tag)))?;
        if len > MAX_PAYLOAD {
            return Err(Error::Malformed(format!(
                "length {} exceeds {}",
                len, MAX_PAYLOAD
            )));
        }

        if !kind.is_sealed() {
            return Message::new(kind, body.to_vec()).map(Some);
        }

        let key = self.key.as_ref().ok_or(Error::CorruptMessage)?;
        let plaintext =
            secretbox::open(key, &body, &kind.aad()).map_err(|_| Error::CorruptMessage)?;
        Message::new(kind, plaintext.to_vec()).map(Some)
    }

    /// Reads messages until one of type `kind` arrives.
    ///
    /// Messages of other types, malformed frames, sentinels and messages that
    /// fail authentication are dropped. With a `timeout`, the whole wait is
    /// bounded and ends with `Error::Timeout`.
    pub fn receive_until(&mut self, kind: MessageType, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.receive_before(deadline) {
                Ok(Some(message)) if message.kind == kind => return Ok(message),
                Ok(Some(message)) => {
                    debug!(expected = ?kind, got = ?message.kind, "dropping unexpected message");
                }
                Ok(None) => {}
                Err(e) if e.is_droppable() => {
                    warn!(expected = ?kind, error = %e, "dropping bad message");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies `deadline` to the channel's read timeout.
    fn arm(&mut self, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                self.channel.set_read_timeout(Some(remaining))?;
                self.timeout_armed = true;
            }
            None if self.timeout_armed => {
                self.channel.set_read_timeout(None)?;
                self.timeout_armed = false;
            }
            None => {}
        }
        Ok(())
    }

    fn read_byte(&mut self, deadline: Option<Instant>) -> Result<u8> {
        self.arm(deadline)?;
        Ok(self.channel.recv_byte()?)
    }

    /// Without a deadline the channel fills the buffer in one call; with one,
    /// the remaining time is re-armed before every byte.
    fn read_exact(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
        if deadline.is_some() {
            for slot in buf.iter_mut() {
                *slot = self.read_byte(deadline)?;
            }
            return Ok(());
        }
        self.arm(None)?;
        Ok(self.channel.recv_exact(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyfob_crypto::secretbox::KEY_BYTES;
    use keyfob_platform::mock::MockChannel;

    /// Counts bulk reads so tests can see which read path a frame took.
    struct CountingChannel {
        inner: MockChannel,
        exact_reads: usize,
    }

    impl ByteChannel for CountingChannel {
        fn send(&mut self, bytes: &[u8]) -> keyfob_platform::Result<()> {
            self.inner.send(bytes)
        }

        fn recv_byte(&mut self) -> keyfob_platform::Result<u8> {
            self.inner.recv_byte()
        }

        fn recv_exact(&mut self, buf: &mut [u8]) -> keyfob_platform::Result<()> {
            self.exact_reads += 1;
            self.inner.recv_exact(buf)
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> keyfob_platform::Result<()> {
            self.inner.set_read_timeout(timeout)
        }
    }

    fn linked() -> (MessageLink<MockChannel>, MessageLink<MockChannel>) {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let (a, b) = MockChannel::pair();
        (
            MessageLink::new(a, Some(key.clone())),
            MessageLink::new(b, Some(key)),
        )
    }

    #[test]
    fn test_send_receive_sealed() {
        let (mut a, mut b) = linked();
        let written = a.send(&Message::unlock(77)).unwrap();
        assert_eq!(written, 2 + HEADER_BYTES + 4);

        let msg = b.receive().unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Unlock);
        assert_eq!(msg.nonce().unwrap(), 77);
    }

    #[test]
    fn test_body_read_in_bulk_without_deadline() {
        let key = SharedSecret::from_bytes([0x42; KEY_BYTES]);
        let (a, b) = MockChannel::pair();
        let mut sender = MessageLink::new(a, Some(key.clone()));
        let mut receiver = MessageLink::new(
            CountingChannel {
                inner: b,
                exact_reads: 0,
            },
            Some(key),
        );

        sender.send(&Message::unlock(9)).unwrap();
        assert_eq!(receiver.receive().unwrap().unwrap().nonce().unwrap(), 9);
        assert_eq!(receiver.channel_mut().exact_reads, 1);

        sender.send(&Message::unlock(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let msg = receiver.receive_before(Some(deadline)).unwrap().unwrap();
        assert_eq!(msg.nonce().unwrap(), 10);
        assert_eq!(receiver.channel_mut().exact_reads, 1);
    }

    #[test]
    fn test_sealed_frame_layout() {
        let (mut a, mut b) = linked();
        a.send(&Message::ack(true)).unwrap();
        let raw = b.channel_mut().drain();
        assert_eq!(raw[0], MessageType::Ack.to_u8());
        assert_eq!(raw[1], 1);
        assert_eq!(raw.len(), 2 + HEADER_BYTES + 1);
    }

    #[test]
    fn test_pair_travels_in_clear() {
        let (mut a, _b) = MockChannel::pair();
        let mut sender = MessageLink::new(&mut a, None);
        let payload = vec![0xAB; 42];
        let msg = Message::new(MessageType::Pair, payload.clone()).unwrap();
        assert_eq!(sender.send(&msg).unwrap(), 44);
    }

    #[test]
    fn test_pair_received_without_key() {
        let (a, b) = MockChannel::pair();
        let mut sender = MessageLink::new(a, None);
        let mut receiver = MessageLink::new(b, None);
        let msg = Message::new(MessageType::Pair, vec![7; 42]).unwrap();
        sender.send(&msg).unwrap();
        assert_eq!(receiver.receive().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_sealed_send_without_key_fails() {
        let (a, _b) = MockChannel::pair();
        let mut link = MessageLink::new(a, None);
        assert!(matches!(
            link.send(&Message::handshake_request()),
            Err(Error::Policy(Policy::NotPaired))
        ));
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let (a, b) = MockChannel::pair();
        let mut sender = MessageLink::new(a, Some(SharedSecret::from_bytes([1; KEY_BYTES])));
        let mut receiver = MessageLink::new(b, Some(SharedSecret::from_bytes([2; KEY_BYTES])));
        sender.send(&Message::unlock(5)).unwrap();
        assert!(matches!(receiver.receive(), Err(Error::CorruptMessage)));
    }

    #[test]
    fn test_relabelled_message_is_corrupt() {
        let (mut a, mut b) = linked();
        a.send(&Message::handshake_reply(1234)).unwrap();
        let mut raw = b.channel_mut().drain();
        raw[0] = MessageType::Unlock.to_u8();
        a.channel_mut().send(&raw).unwrap();
        assert!(matches!(b.receive(), Err(Error::CorruptMessage)));
    }

    #[test]
    fn test_sentinel_is_nothing() {
        let (mut a, mut b) = linked();
        a.channel_mut().send(&[TAG_NONE]).unwrap();
        assert!(b.receive().unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_is_drained() {
        let (mut a, mut b) = linked();
        let mut junk = vec![0x7E, 3];
        junk.extend_from_slice(&[0u8; 3 + HEADER_BYTES]);
        a.channel_mut().send(&junk).unwrap();
        a.send(&Message::ack(true)).unwrap();

        assert!(matches!(b.receive(), Err(Error::Malformed(_))));
        assert!(b.receive().unwrap().unwrap().ack_success().unwrap());
    }

    #[test]
    fn test_oversized_length_is_drained() {
        let (mut a, mut b) = linked();
        let mut junk = vec![MessageType::Start.to_u8(), 250];
        junk.extend_from_slice(&[0u8; 250 + HEADER_BYTES]);
        a.channel_mut().send(&junk).unwrap();
        a.send(&Message::ack(false)).unwrap();

        assert!(matches!(b.receive(), Err(Error::Malformed(_))));
        assert!(!b.receive().unwrap().unwrap().ack_success().unwrap());
    }

    #[test]
    fn test_oversized_send_rejected_before_write() {
        let (mut a, mut b) = linked();
        let msg = Message {
            kind: MessageType::Start,
            payload: Zeroizing::new(vec![0; MAX_PAYLOAD + 1]),
        };
        assert!(matches!(a.send(&msg), Err(Error::Malformed(_))));
        assert!(b.channel_mut().drain().is_empty());
    }

    #[test]
    fn test_receive_until_skips_noise() {
        let (mut a, mut b) = linked();
        a.channel_mut().send(&[TAG_NONE]).unwrap();
        a.send(&Message::handshake_request()).unwrap();
        let mut forged = vec![MessageType::Ack.to_u8(), 1];
        forged.extend_from_slice(&[0xEE; 1 + HEADER_BYTES]);
        a.channel_mut().send(&forged).unwrap();
        a.send(&Message::ack(true)).unwrap();

        let msg = b.receive_until(MessageType::Ack, None).unwrap();
        assert!(msg.ack_success().unwrap());
    }

    #[test]
    fn test_receive_until_times_out() {
        let (_a, mut b) = linked();
        let started = Instant::now();
        let result = b.receive_until(MessageType::Ack, Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_timeout_bounds_stray_traffic() {
        let (mut a, mut b) = linked();
        for _ in 0..5 {
            a.send(&Message::handshake_request()).unwrap();
        }
        let result = b.receive_until(MessageType::Ack, Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn test_disconnect_propagates() {
        let (a, mut b) = linked();
        drop(a);
        let result = b.receive_until(MessageType::Ack, None);
        assert!(matches!(result, Err(Error::Platform(_))));
    }
}
