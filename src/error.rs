//! Unified error types for the FleetNode core.
//!
//! One `Error` enum that every subsystem converts into, split along the
//! recovery policy each class of failure gets:
//!
//! | Variant             | Recovery                                         |
//! |---------------------|--------------------------------------------------|
//! | `Malformed`         | reject the job, report status, back to `Ready`   |
//! | `Exhausted`         | log; retry or drop depending on the event        |
//! | `Protocol`          | reconnect with backoff, restart when exhausted   |
//! | `Integrity`         | fail the current job, discard its context        |
//! | `Storage`           | surfaced to the caller                           |
//! | `IdentityAmbiguity` | halt the device                                  |
//!
//! All variants are `Copy` so they pass through state machine actions
//! without allocation.

use core::fmt;

use crate::app::ports::StorageError;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unparseable or incomplete input from the cloud.
    Malformed(MalformedError),
    /// A bounded resource had no room left.
    Exhausted(ResourceError),
    /// The pub/sub session or the transport under it failed.
    Protocol(ProtocolError),
    /// A write or patch step would corrupt the image being built.
    Integrity(IntegrityError),
    /// Durable key-value storage failed.
    Storage(StorageError),
    /// Neither the staged nor the stored credential authenticates.
    IdentityAmbiguity,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed input: {e}"),
            Self::Exhausted(e) => write!(f, "resource exhausted: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Integrity(e) => write!(f, "integrity: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::IdentityAmbiguity => write!(f, "no credential authenticates"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedError {
    /// Payload is not valid JSON.
    InvalidJson,
    /// A required field is absent or has the wrong type.
    MissingField(&'static str),
    /// A field does not fit its bounded buffer.
    FieldTooLong(&'static str),
    /// A field is present but its value is not acceptable.
    InvalidValue(&'static str),
    /// Job document is neither a firmware nor a rotation job.
    UnknownJob,
}

impl fmt::Display for MalformedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid JSON"),
            Self::MissingField(name) => write!(f, "missing field '{name}'"),
            Self::FieldTooLong(name) => write!(f, "field '{name}' too long"),
            Self::InvalidValue(name) => write!(f, "invalid value for '{name}'"),
            Self::UnknownJob => write!(f, "unrecognised job document"),
        }
    }
}

impl From<MalformedError> for Error {
    fn from(e: MalformedError) -> Self {
        Self::Malformed(e)
    }
}

// ---------------------------------------------------------------------------
// Resource exhaustion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// Event queue had no free slot.
    QueueFull,
    /// No block buffer became free before the deadline.
    PoolEmpty,
    /// Payload larger than the buffer that must hold it.
    BufferOverflow,
    /// Subscription table has no free slot.
    TableFull,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "event queue full"),
            Self::PoolEmpty => write!(f, "block pool empty"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
            Self::TableFull => write!(f, "subscription table full"),
        }
    }
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Self::Exhausted(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol / transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    PublishFailed,
    SubscribeFailed,
    UnsubscribeFailed,
    /// Broker did not acknowledge the packet in time.
    AckTimeout,
    ConnectFailed,
    NotConnected,
    /// Every reconnection attempt failed.
    ReconnectExhausted,
    /// A cloud service answered a request with its rejected topic.
    Rejected,
    /// A cloud service never answered a request.
    ResponseTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishFailed => write!(f, "publish failed"),
            Self::SubscribeFailed => write!(f, "subscribe failed"),
            Self::UnsubscribeFailed => write!(f, "unsubscribe failed"),
            Self::AckTimeout => write!(f, "acknowledgment timed out"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::NotConnected => write!(f, "not connected"),
            Self::ReconnectExhausted => write!(f, "reconnect attempts exhausted"),
            Self::Rejected => write!(f, "request rejected by service"),
            Self::ResponseTimeout => write!(f, "no response from service"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Integrity violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    /// Block would land outside the declared file.
    OffsetOutOfBounds,
    /// Block length disagrees with its position in the file.
    BlockLength,
    /// Declared file exceeds the maximum allowed image size.
    FileTooLarge,
    /// Flash region write or erase failed.
    FlashWrite,
    /// Image did not verify or could not be made bootable.
    FinalizeFailed,
    /// Patch engine aborted on an I/O error.
    PatchIo,
    /// Patch stream contains an invalid instruction.
    PatchFormat,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OffsetOutOfBounds => write!(f, "block offset out of bounds"),
            Self::BlockLength => write!(f, "unexpected block length"),
            Self::FileTooLarge => write!(f, "file exceeds maximum image size"),
            Self::FlashWrite => write!(f, "flash write failed"),
            Self::FinalizeFailed => write!(f, "image finalize failed"),
            Self::PatchIo => write!(f, "patch I/O failed"),
            Self::PatchFormat => write!(f, "invalid patch instruction"),
        }
    }
}

impl From<IntegrityError> for Error {
    fn from(e: IntegrityError) -> Self {
        Self::Integrity(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
