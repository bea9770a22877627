//! Error types for SPIFFE mTLS operations

use crate::spiffe_id::SpiffeId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for identity acquisition, staging, TLS setup and peer verification
#[derive(Error, Debug)]
pub enum Error {
    /// The Workload API endpoint could not be reached or did not answer in time
    #[error("Workload API unreachable: {0}")]
    Unreachable(String),

    /// The workload is not entitled to any identity
    #[error("Workload API refused to issue an identity: {0}")]
    Unauthenticated(String),

    /// Identity material failed its invariant checks
    #[error("Malformed identity material: {0}")]
    Malformed(String),

    /// Staged certificate and private key are unusable or do not belong together
    #[error("Invalid identity material for TLS: {0}")]
    InvalidMaterial(String),

    /// The trust bundle is empty or contains unusable roots
    #[error("Invalid trust bundle: {0}")]
    InvalidTrustBundle(String),

    /// The peer certificate carries no parseable SPIFFE ID
    #[error("Peer presented no SPIFFE ID")]
    NoSpiffeIdPresented,

    /// None of the presented SPIFFE IDs is acceptable
    #[error("Peer identity mismatch: expected {expected}, presented [{}]", format_ids(.presented))]
    PeerIdentityMismatch {
        /// Human readable description of the expected identity
        expected: String,
        /// Every SPIFFE ID found in the peer leaf certificate
        presented: Vec<SpiffeId>,
    },

    /// Writing, reading or wiping staged credentials failed
    #[error("Credential staging failed: {0}")]
    StagingFailure(String),

    /// SPIFFE ID validation failed
    #[error("Invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The TLS handshake did not finish in time
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The identity source has been closed
    #[error("Identity source is closed")]
    SourceClosed,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

fn format_ids(ids: &[SpiffeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create an InvalidSpiffeId error with detailed message
    pub fn invalid_spiffe_id(msg: impl Into<String>) -> Self {
        Self::InvalidSpiffeId(msg.into())
    }

    /// Create a Tls error with detailed message
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a Malformed error with detailed message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a StagingFailure error with detailed message
    pub fn staging(msg: impl Into<String>) -> Self {
        Self::StagingFailure(msg.into())
    }

    /// Whether the caller may retry the operation with backoff.
    ///
    /// Only a provider that could not be reached is transient; malformed
    /// identities, refused entitlements and rejected peers are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Rebuild a provider-facing error so a stored failure can be handed to
    /// every waiting caller.
    pub(crate) fn replay(&self) -> Self {
        match self {
            Self::Unreachable(msg) => Self::Unreachable(msg.clone()),
            Self::Unauthenticated(msg) => Self::Unauthenticated(msg.clone()),
            Self::Malformed(msg) => Self::Malformed(msg.clone()),
            Self::SourceClosed => Self::SourceClosed,
            other => Self::Unreachable(other.to_string()),
        }
    }
}
