//! Host-side support for the car/fob access protocol.
//!
//! - [`provisioning`]: JSON provisioning files read by the `car` and `fob`
//!   simulators and written by `keyfob-tool`
//! - [`authority`]: offline key generation and feature-grant signing
//! - [`logging`]: subscriber setup shared by the binaries

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod logging;
pub mod provisioning;

pub use provisioning::{CarProvisioning, FobPairing, FobProvisioning};
