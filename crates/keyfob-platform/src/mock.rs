//! Mock implementations for testing.
//!
//! Provides deterministic, reproducible behavior for automated CI testing.

use crate::error::{Error, Result};
use crate::traits::{ByteChannel, RecordStore};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One end of an in-memory board link.
///
/// # Example
///
/// ```
/// use keyfob_platform::mock::MockChannel;
/// use keyfob_platform::traits::ByteChannel;
///
/// let (mut car, mut fob) = MockChannel::pair();
/// fob.send(&[0x48, 0x00]).unwrap();
/// assert_eq!(car.recv_byte().unwrap(), 0x48);
/// assert_eq!(car.recv_byte().unwrap(), 0x00);
/// ```
pub struct MockChannel {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    timeout: Option<Duration>,
}

impl MockChannel {
    /// Creates two connected ends. Bytes sent on one arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                timeout: None,
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                timeout: None,
            },
        )
    }

    /// Returns every byte that has already arrived, without blocking.
    pub fn drain(&mut self) -> Vec<u8> {
        self.rx.try_iter().collect()
    }
}

impl ByteChannel for MockChannel {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.tx.send(b).map_err(|_| Error::Disconnected)?;
        }
        Ok(())
    }

    fn recv_byte(&mut self) -> Result<u8> {
        match self.timeout {
            None => self.rx.recv().map_err(|_| Error::Disconnected),
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::Disconnected,
            }),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// In-memory record store.
///
/// Clones share the same backing record, so a test can keep a handle and
/// inspect or damage what the device persisted.
///
/// # Example
///
/// ```
/// use keyfob_platform::mock::MemoryStore;
/// use keyfob_platform::traits::RecordStore;
///
/// let mut store = MemoryStore::new();
/// let probe = store.clone();
/// store.persist(b"record").unwrap();
/// assert_eq!(probe.load().unwrap().as_deref(), Some(&b"record"[..]));
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    record: Arc<RwLock<Option<Vec<u8>>>>,
    fail_persist: Arc<RwLock<bool>>,
    persist_count: Arc<RwLock<usize>>,
}

impl MemoryStore {
    /// Creates an erased store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `record`.
    pub fn with_record(record: Vec<u8>) -> Self {
        let store = Self::new();
        store.replace(Some(record));
        store
    }

    /// Replaces the backing record directly, bypassing `persist`.
    pub fn replace(&self, record: Option<Vec<u8>>) {
        if let Ok(mut slot) = self.record.write() {
            *slot = record;
        }
    }

    /// Current record, if any.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.record.read().ok().and_then(|r| r.clone())
    }

    /// Flips every bit of the byte at `index`. No-op if out of range.
    pub fn corrupt_byte(&self, index: usize) {
        if let Ok(mut slot) = self.record.write() {
            if let Some(byte) = slot.as_mut().and_then(|r| r.get_mut(index)) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Simulates a write interrupted after `len` bytes.
    pub fn tear(&self, len: usize) {
        if let Ok(mut slot) = self.record.write() {
            if let Some(record) = slot.as_mut() {
                record.truncate(len);
            }
        }
    }

    /// Makes every following `persist` fail until cleared.
    pub fn set_fail_persist(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_persist.write() {
            *flag = fail;
        }
    }

    /// Number of successful persists so far.
    pub fn persist_count(&self) -> usize {
        self.persist_count.read().map(|c| *c).unwrap_or(0)
    }
}

impl RecordStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        self.record
            .read()
            .map(|r| r.clone())
            .map_err(|_| Error::Storage("record lock poisoned".into()))
    }

    fn persist(&mut self, record: &[u8]) -> Result<()> {
        if self.fail_persist.read().map(|f| *f).unwrap_or(false) {
            return Err(Error::Storage("simulated write failure".into()));
        }
        let mut slot = self
            .record
            .write()
            .map_err(|_| Error::Storage("record lock poisoned".into()))?;
        *slot = Some(record.to_vec());
        if let Ok(mut count) = self.persist_count.write() {
            *count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_channel_is_bidirectional() {
        let (mut a, mut b) = MockChannel::pair();
        a.send(b"ping").unwrap();
        b.send(b"pong").unwrap();

        let mut buf = [0u8; 4];
        b.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_channel_timeout() {
        let (mut a, _b) = MockChannel::pair();
        a.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        assert!(matches!(a.recv_byte(), Err(Error::Timeout)));
    }

    #[test]
    fn test_channel_disconnect() {
        let (mut a, b) = MockChannel::pair();
        drop(b);
        assert!(matches!(a.recv_byte(), Err(Error::Disconnected)));
        assert!(matches!(a.send(&[1]), Err(Error::Disconnected)));
    }

    #[test]
    fn test_channel_across_threads() {
        let (mut a, mut b) = MockChannel::pair();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 3];
            b.recv_exact(&mut buf).unwrap();
            b.send(&buf).unwrap();
        });
        a.send(&[1, 2, 3]).unwrap();
        let mut echo = [0u8; 3];
        a.recv_exact(&mut echo).unwrap();
        assert_eq!(echo, [1, 2, 3]);
        handle.join().unwrap();
    }

    #[test]
    fn test_drain() {
        let (mut a, mut b) = MockChannel::pair();
        a.send(&[9, 8, 7]).unwrap();
        assert_eq!(b.drain(), vec![9, 8, 7]);
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_store_damage_helpers() {
        let store = MemoryStore::with_record(vec![0x00, 0x11, 0x22]);
        store.corrupt_byte(1);
        assert_eq!(store.snapshot(), Some(vec![0x00, 0xEE, 0x22]));
        store.corrupt_byte(99);
        store.tear(2);
        assert_eq!(store.snapshot(), Some(vec![0x00, 0xEE]));
    }

    #[test]
    fn test_store_failed_persist_keeps_old_record() {
        let mut store = MemoryStore::with_record(b"old".to_vec());
        store.set_fail_persist(true);
        assert!(store.persist(b"new").is_err());
        assert_eq!(store.load().unwrap().as_deref(), Some(&b"old"[..]));
        assert_eq!(store.persist_count(), 0);

        store.set_fail_persist(false);
        store.persist(b"new").unwrap();
        assert_eq!(store.persist_count(), 1);
    }
}
