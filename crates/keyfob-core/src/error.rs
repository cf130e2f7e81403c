//! Error types for protocol operations.

use std::fmt;
use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol operation errors.
///
/// Use [`Error::kind`] to decide how to react. The reason inside a
/// [`Error::Policy`] is for logs and tests only and is never sent to the
/// peer or shown to the operator.
#[derive(Debug, Error)]
pub enum Error {
    /// Framing or payload layout is inconsistent.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A sealed message failed authentication (tampered, wrong key, truncated).
    #[error("Message failed authentication")]
    CorruptMessage,

    /// The car answered with ACK failure.
    #[error("Unlock denied by car")]
    Denied,

    /// A protocol rule refused the request.
    #[error("Policy violation: {0}")]
    Policy(Policy),

    /// A persisted record failed its integrity checks.
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    /// No message arrived before the protocol deadline.
    #[error("Protocol timeout")]
    Timeout,

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] keyfob_crypto::Error),

    /// Board link or storage driver error.
    #[error("Platform error: {0}")]
    Platform(keyfob_platform::Error),

    /// Operator channel I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<keyfob_platform::Error> for Error {
    fn from(e: keyfob_platform::Error) -> Self {
        match e {
            keyfob_platform::Error::Timeout => Error::Timeout,
            other => Error::Platform(other),
        }
    }
}

impl From<Policy> for Error {
    fn from(p: Policy) -> Self {
        Error::Policy(p)
    }
}

impl Error {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        use keyfob_crypto::Error as CryptoError;

        match self {
            Error::Malformed(_) => ErrorKind::MalformedMessage,
            Error::CorruptMessage => ErrorKind::AuthenticationFailure,
            Error::Policy(_) | Error::Denied => ErrorKind::PolicyViolation,
            Error::StorageCorruption(_) => ErrorKind::StorageCorruption,
            Error::Timeout => ErrorKind::ProtocolTimeout,
            Error::Crypto(CryptoError::Decryption(_) | CryptoError::InvalidSignature) => {
                ErrorKind::AuthenticationFailure
            }
            Error::Crypto(CryptoError::Hex(_) | CryptoError::InvalidLength { .. }) => {
                ErrorKind::MalformedMessage
            }
            Error::Crypto(_) | Error::Platform(_) | Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True when the peer end of the board link is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Platform(keyfob_platform::Error::Disconnected))
    }

    /// True for errors a listener drops before waiting for the next message.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedMessage | ErrorKind::AuthenticationFailure
        )
    }
}

/// Error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Framing or length inconsistency. Drop and keep listening.
    MalformedMessage,
    /// Decryption or signature check failed. Drop with no state change.
    AuthenticationFailure,
    /// Wrong car, unknown, duplicate or surplus feature, bad PIN, not paired, unlock refused.
    PolicyViolation,
    /// Persisted record failed its checksum. Fall back to the default.
    StorageCorruption,
    /// Hardened mode only: abort the protocol run and return to idle.
    ProtocolTimeout,
    /// Local failure outside the protocol: link, storage driver, operator channel, key material.
    Io,
}

/// Why a policy check refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The fob has no pairing record.
    NotPaired,
    /// The fob is already paired and cannot adopt another record.
    AlreadyPaired,
    /// Candidate PIN did not match the stored PIN.
    PinMismatch,
    /// The grant or start request names another car.
    WrongCarId,
    /// The fob already holds the maximum number of features.
    FeatureListFull,
    /// The feature is already enabled.
    DuplicateFeature,
    /// The car has no message slot for this feature id.
    UnknownFeature,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Policy::NotPaired => "not paired",
            Policy::AlreadyPaired => "already paired",
            Policy::PinMismatch => "PIN mismatch",
            Policy::WrongCarId => "wrong car id",
            Policy::FeatureListFull => "feature list full",
            Policy::DuplicateFeature => "duplicate feature",
            Policy::UnknownFeature => "unknown feature",
        };
        f.write_str(reason)
    }
}
