//! Board-link transports for running the car and fob as separate processes.
//!
//! On hardware the boards talk over a UART. On a host the same byte stream
//! runs over a TCP socket ([`tcp`]), so the protocol engine sees the
//! identical `ByteChannel` seam either way.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use error::{Error, Result};

#[cfg(feature = "tcp")]
pub use tcp::{TcpChannel, TcpEndpoint};
