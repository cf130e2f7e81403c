//! Platform seams for the car/fob access protocol.
//!
//! The protocol engine never touches hardware directly. It needs two
//! collaborators, expressed here as traits:
//! - [`ByteChannel`]: a reliable, in-order byte link between the two boards
//! - [`RecordStore`]: one fixed-size non-volatile record per device
//!
//! [`mock`] provides deterministic in-memory versions for tests, and
//! [`file`] a crash-safe file-backed store for the host simulators.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod file;
pub mod mock;
pub mod traits;

pub use error::{Error, Result};
pub use traits::{ByteChannel, RecordStore};
