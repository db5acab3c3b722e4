//! Port traits — the hexagonal boundary between the agents and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ agents (domain)
//! ```
//!
//! The pub/sub client, the TLS transport, flash, NVS, key generation and the
//! reset line are all collaborators the core does not own.  Adapters in
//! [`crate::adapters`] implement these traits for ESP-IDF and for the host
//! simulation; integration tests implement them with recording mocks.
//!
//! ## Security notes
//!
//! - **StoragePort** implementations SHOULD encrypt the credentials namespace.
//! - **ImageStore** implementations MUST NOT mark an image bootable outside
//!   [`ImageStore::finalize`].
//! - All port errors are typed — callers must handle every variant explicitly.

use core::fmt;
use core::time::Duration;

use crate::config::AgentConfig;
use crate::error::ProtocolError;

// ───────────────────────────────────────────────────────────────
// Pub/sub protocol port
// ───────────────────────────────────────────────────────────────

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Packet identifier handed back by the client for ack tracking.
pub type PacketId = u16;

/// Outbound half of the pub/sub session.
///
/// Inbound publishes do not come through this trait: the client adapter
/// hands them to [`Router::dispatch`](crate::mqtt::router::Router::dispatch)
/// from its own callback context.
pub trait MqttPort: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<PacketId, ProtocolError>;

    fn subscribe(&self, filters: &[&str], qos: QoS) -> Result<PacketId, ProtocolError>;

    fn unsubscribe(&self, filters: &[&str]) -> Result<PacketId, ProtocolError>;

    /// Block until the broker acknowledges `packet_id` or `timeout` elapses.
    fn wait_for_ack(&self, packet_id: PacketId, timeout: Duration) -> Result<(), ProtocolError>;
}

// ───────────────────────────────────────────────────────────────
// Transport port
// ───────────────────────────────────────────────────────────────

/// Credential material presented during the TLS handshake.
#[derive(Debug, Clone, Copy)]
pub struct TlsIdentity<'a> {
    pub client_id: &'a str,
    pub certificate: &'a str,
    pub private_key: &'a str,
    pub root_ca: &'a str,
}

/// Byte-stream transport under the pub/sub session.
pub trait TransportPort: Send {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        identity: &TlsIdentity<'_>,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Returns the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Returns the number of bytes read; `Ok(0)` means the peer closed.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Lets an agent ask the connection owner to rebuild the session.
///
/// The credential agent calls this after staging a new identity; the
/// owner answers asynchronously by posting an event to the agent's queue.
pub trait SessionControl: Send + Sync {
    fn request_reconnect(&self) -> Result<(), ProtocolError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ NVS)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage for credentials, Wi-Fi settings and config.
///
/// # Security
///
/// - Keys are namespaced to prevent collisions between subsystems.
/// - Write operations MUST be atomic — no partial writes on power loss.
///   The ESP-IDF NVS API guarantees this natively; in-memory simulation
///   achieves it trivially.
/// - Callers treat every call as a scoped, non-reentrant unit.
pub trait StoragePort: Send {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Configuration port
// ───────────────────────────────────────────────────────────────

/// Loads and persists the agent configuration.
///
/// Implementations MUST validate before persisting; out-of-range values are
/// rejected with [`ConfigError::ValidationFailed`], never clamped.
pub trait ConfigPort {
    /// Returns [`AgentConfig::default()`] if nothing is stored.
    fn load(&self) -> Result<AgentConfig, ConfigError>;

    fn save(&mut self, config: &AgentConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Crypto port
// ───────────────────────────────────────────────────────────────

/// Freshly generated key pair plus the signing request for it.
pub struct KeyMaterial {
    pub private_key_pem: String,
    pub csr_pem: String,
}

pub trait CsrPort: Send {
    fn generate_keypair_and_csr(&mut self, subject: &str) -> Result<KeyMaterial, CryptoError>;
}

// ───────────────────────────────────────────────────────────────
// Image storage port
// ───────────────────────────────────────────────────────────────

/// Flash regions the update agent works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// The image currently executing.  Read only.
    Running,
    /// Inactive OTA slot that becomes the next boot image.
    Update,
    /// Side region holding a received delta patch.
    PatchStaging,
}

pub trait ImageStore: Send {
    /// Open `region` for writing.  Erases the patch staging region;
    /// begins an update session on the update region.
    fn prepare(&mut self, region: Region) -> Result<(), FlashError>;

    /// Capacity of `region` in bytes.
    fn capacity(&self, region: Region) -> u32;

    fn write_at(&mut self, region: Region, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Returns the number of bytes read; short at the end of the region.
    fn read_at(&self, region: Region, offset: u32, buf: &mut [u8]) -> Result<usize, FlashError>;

    /// Verify `image_len` bytes of the update region and make it the boot image.
    fn finalize(&mut self, image_len: u32) -> Result<(), FlashError>;

    /// Drop any open update session without touching the boot selection.
    fn abort(&mut self);
}

// ───────────────────────────────────────────────────────────────
// System control port
// ───────────────────────────────────────────────────────────────

pub trait SystemPort: Send + Sync {
    /// Reboot into whatever image is selected for boot.
    fn restart(&self);

    /// Stop all agent work permanently.  Used only when the device has no
    /// credential that authenticates.
    fn halt(&self, reason: &str);
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored config failed deserialization.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
    /// Stored value does not fit the caller's buffer or type.
    Corrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    ConnectFailed,
    /// Peer refused the presented certificate.
    AuthRejected,
    Io,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    KeyGeneration,
    CsrEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    NoPartition,
    OutOfRange,
    EraseFailed,
    WriteFailed,
    ReadFailed,
    /// No update session is open.
    NotPrepared,
    VerifyFailed,
    BootSetFailed,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
            Self::Corrupted => write!(f, "stored value corrupted"),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::AuthRejected => write!(f, "peer rejected credentials"),
            Self::Io => write!(f, "I/O error"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyGeneration => write!(f, "key generation failed"),
            Self::CsrEncoding => write!(f, "CSR encoding failed"),
        }
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPartition => write!(f, "partition not found"),
            Self::OutOfRange => write!(f, "access outside region"),
            Self::EraseFailed => write!(f, "erase failed"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::NotPrepared => write!(f, "region not prepared"),
            Self::VerifyFailed => write!(f, "image verification failed"),
            Self::BootSetFailed => write!(f, "set boot partition failed"),
        }
    }
}
