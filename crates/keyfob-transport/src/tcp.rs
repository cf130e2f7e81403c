//! TCP stand-in for the board-to-board UART.
//!
//! The socket carries the raw frame bytes with no extra framing, exactly as
//! the UART would. Nagle is disabled so one-byte sentinels and short frames
//! go out immediately.

use crate::{Error, Result};
use keyfob_platform::ByteChannel;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Smallest read timeout the socket accepts. A zero duration means
/// "block forever" to the OS, so shorter deadlines are rounded up.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Listening side of a board link (the car, on a host).
pub struct TcpEndpoint {
    listener: TcpListener,
}

impl TcpEndpoint {
    /// Binds a listener. Use port 0 to let the OS choose.
    pub fn server(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, "board link listening");
        Ok(Self { listener })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until a peer connects.
    pub fn accept(&self) -> Result<TcpChannel> {
        let (stream, peer) = self.listener.accept()?;
        debug!(%peer, "board link accepted");
        TcpChannel::from_stream(stream)
    }
}

/// One end of a board link over TCP.
pub struct TcpChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Connects to a listening peer.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        Self::from_stream(stream)
    }

    /// Connects, retrying while the peer is not yet listening.
    ///
    /// # Errors
    ///
    /// `Error::ConnectionFailed` with the last failure once `attempts`
    /// connects have been refused.
    pub fn connect_with_retry(
        addr: impl ToSocketAddrs + Copy,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let mut last = None;
        for attempt in 1..=attempts.max(1) {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    debug!(attempt, error = %e, "board link connect failed");
                    last = Some(e);
                    thread::sleep(delay);
                }
            }
        }
        Err(Error::ConnectionFailed(
            last.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            peer,
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl ByteChannel for TcpChannel {
    fn send(&mut self, bytes: &[u8]) -> keyfob_platform::Result<()> {
        self.writer.write_all(bytes).map_err(map_io)?;
        self.writer.flush().map_err(map_io)
    }

    fn recv_byte(&mut self) -> keyfob_platform::Result<u8> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Err(keyfob_platform::Error::Disconnected),
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> keyfob_platform::Result<()> {
        let timeout = timeout.map(|t| t.max(MIN_READ_TIMEOUT));
        self.reader.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel").field("peer", &self.peer).finish()
    }
}

fn map_io(e: io::Error) -> keyfob_platform::Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => keyfob_platform::Error::Timeout,
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => keyfob_platform::Error::Disconnected,
        _ => keyfob_platform::Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_io_kinds() {
        assert!(matches!(
            map_io(io::Error::from(ErrorKind::WouldBlock)),
            keyfob_platform::Error::Timeout
        ));
        assert!(matches!(
            map_io(io::Error::from(ErrorKind::ConnectionReset)),
            keyfob_platform::Error::Disconnected
        ));
        assert!(matches!(
            map_io(io::Error::from(ErrorKind::PermissionDenied)),
            keyfob_platform::Error::Io(_)
        ));
    }

    #[test]
    fn test_connect_refused() {
        let endpoint = TcpEndpoint::server("127.0.0.1:0").unwrap();
        let addr = endpoint.local_addr().unwrap();
        drop(endpoint);
        let result = TcpChannel::connect_with_retry(addr, 2, Duration::from_millis(1));
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }
}
