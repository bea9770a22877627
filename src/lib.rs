//! SPIFFE mTLS for Rust
//!
//! Obtains a workload's X.509 identity from the SPIFFE Workload API, keeps it
//! current across rotations, builds mutually authenticated rustls contexts
//! from it and verifies the SPIFFE ID a peer presents.
//!
//! The usual flow is an [`IdentitySource`] shared by the process, and a
//! [`SecureClient`] or [`SecureServer`] per expected peer identity.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cert;
pub mod config;
pub mod error;
pub mod mtls;
pub mod proto;
pub mod session;
pub mod source;
pub mod spiffe_id;
pub mod staging;
pub mod svid;
pub mod trust_bundle;
pub mod verifier;
pub mod workload;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use mtls::{ClientTlsConfig, ServerTlsConfig, TlsContextBuilder};
pub use session::{AuthenticatedStream, PreparedClient, PreparedServer, SecureClient, SecureServer};
pub use source::{IdentityProvider, IdentitySource, SourceStatus, StaticIdentityProvider, WatchId};
pub use spiffe_id::{SpiffeId, TrustDomain};
pub use staging::{CredentialStager, MemoryStager, StagedCredential, TempFileStager};
pub use svid::{IdentityMaterial, PrivateKey};
pub use trust_bundle::{BundleScope, TrustBundle, TrustBundleSet};
pub use verifier::{ExpectedPeerIdentity, PeerCheck, PeerIdentityVerifier, VerificationState};
pub use workload::WorkloadApiClient;
