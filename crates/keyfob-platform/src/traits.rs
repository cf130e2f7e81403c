//! Platform abstraction traits for the board link and non-volatile storage.
//!
//! These traits keep the protocol engine independent of the UART and flash
//! drivers while staying testable through mocks.

use crate::error::Result;
use std::time::Duration;

/// Reliable, in-order byte channel between two boards.
///
/// Implementations:
/// - TCP socket (`keyfob_transport::TcpChannel`) for the host simulators
/// - In-memory pair (`MockChannel`) for tests
///
/// # Blocking
///
/// Reads block until a byte arrives, or until the read timeout set with
/// [`ByteChannel::set_read_timeout`] expires, in which case they return
/// `Error::Timeout`.
pub trait ByteChannel {
    /// Writes every byte of `bytes` to the peer.
    ///
    /// # Errors
    ///
    /// - `Error::Disconnected` if the peer has gone away
    /// - `Error::Io` on a transport failure
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if the read timeout expired first
    /// - `Error::Disconnected` if the peer has gone away
    fn recv_byte(&mut self) -> Result<u8>;

    /// Fills `buf` completely.
    ///
    /// The timeout applies to each byte, not to the whole buffer.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        for slot in buf.iter_mut() {
            *slot = self.recv_byte()?;
        }
        Ok(())
    }

    /// Sets the read timeout. `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl<T: ByteChannel + ?Sized> ByteChannel for &mut T {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn recv_byte(&mut self) -> Result<u8> {
        (**self).recv_byte()
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).recv_exact(buf)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        (**self).set_read_timeout(timeout)
    }
}

impl<T: ByteChannel + ?Sized> ByteChannel for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn recv_byte(&mut self) -> Result<u8> {
        (**self).recv_byte()
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).recv_exact(buf)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        (**self).set_read_timeout(timeout)
    }
}

/// A single fixed-size record in non-volatile storage.
///
/// The store knows nothing about the record's contents; integrity checking
/// is the caller's job. A persist must leave either the previous record or
/// the new one readable after a crash.
pub trait RecordStore {
    /// Returns the last persisted record, or `None` if the region is erased.
    ///
    /// # Errors
    ///
    /// - `Error::Io` / `Error::Storage` if the region cannot be read
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Overwrites the record wholesale.
    ///
    /// # Errors
    ///
    /// - `Error::Io` / `Error::Storage` if the write did not complete
    fn persist(&mut self, record: &[u8]) -> Result<()>;
}
