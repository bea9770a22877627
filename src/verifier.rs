//! Peer identity verification
//!
//! Chain validation during the handshake only proves that a peer holds a
//! certificate signed by a trusted root. Whether it is the peer we meant to
//! talk to is decided here, from the URI SANs of its leaf certificate.

use crate::cert;
use crate::error::{Error, Result};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::trust_bundle::BundleScope;
use rustls::pki_types::CertificateDer;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

type TrustDomainPredicate = Arc<dyn Fn(&TrustDomain) -> bool + Send + Sync>;

/// The identity a peer must present for a session to be accepted
#[derive(Clone)]
pub enum ExpectedPeerIdentity {
    /// Exactly this SPIFFE ID
    Exact(SpiffeId),
    /// Any SPIFFE ID from the set
    AnyOf(BTreeSet<SpiffeId>),
    /// Any SPIFFE ID in one of the trust domains
    MemberOf(BTreeSet<TrustDomain>),
    /// Any SPIFFE ID whose trust domain satisfies the predicate
    Predicate {
        /// Shown in mismatch diagnostics
        description: String,
        /// Acceptance test
        predicate: TrustDomainPredicate,
    },
}

impl ExpectedPeerIdentity {
    /// Expect exactly `id`
    pub fn exact(id: SpiffeId) -> Self {
        ExpectedPeerIdentity::Exact(id)
    }

    /// Expect any of `ids`
    pub fn any_of(ids: impl IntoIterator<Item = SpiffeId>) -> Self {
        ExpectedPeerIdentity::AnyOf(ids.into_iter().collect())
    }

    /// Expect any member of `trust_domain`
    pub fn member_of(trust_domain: TrustDomain) -> Self {
        ExpectedPeerIdentity::MemberOf(BTreeSet::from([trust_domain]))
    }

    /// Expect any member of one of `trust_domains`
    pub fn member_of_any(trust_domains: impl IntoIterator<Item = TrustDomain>) -> Self {
        ExpectedPeerIdentity::MemberOf(trust_domains.into_iter().collect())
    }

    /// Expect a trust domain accepted by `predicate`
    pub fn predicate<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&TrustDomain) -> bool + Send + Sync + 'static,
    {
        ExpectedPeerIdentity::Predicate {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Whether a single SPIFFE ID satisfies the expectation
    pub fn matches(&self, id: &SpiffeId) -> bool {
        match self {
            ExpectedPeerIdentity::Exact(expected) => expected == id,
            ExpectedPeerIdentity::AnyOf(expected) => expected.contains(id),
            ExpectedPeerIdentity::MemberOf(domains) => domains.contains(id.trust_domain()),
            ExpectedPeerIdentity::Predicate { predicate, .. } => predicate(id.trust_domain()),
        }
    }

    /// Trust domains whose roots a session with this peer needs
    ///
    /// A predicate cannot be enumerated, so it needs every bundle.
    pub fn bundle_scope(&self) -> BundleScope {
        match self {
            ExpectedPeerIdentity::Exact(id) => BundleScope::single(id.trust_domain().clone()),
            ExpectedPeerIdentity::AnyOf(ids) => BundleScope::Domains(
                ids.iter().map(|id| id.trust_domain().clone()).collect(),
            ),
            ExpectedPeerIdentity::MemberOf(domains) => BundleScope::Domains(domains.clone()),
            ExpectedPeerIdentity::Predicate { .. } => BundleScope::All,
        }
    }
}

impl From<SpiffeId> for ExpectedPeerIdentity {
    fn from(id: SpiffeId) -> Self {
        ExpectedPeerIdentity::Exact(id)
    }
}

impl fmt::Display for ExpectedPeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedPeerIdentity::Exact(id) => write!(f, "{}", id),
            ExpectedPeerIdentity::AnyOf(ids) => {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "one of [{}]", ids.join(", "))
            }
            ExpectedPeerIdentity::MemberOf(domains) => {
                let domains: Vec<&str> = domains.iter().map(TrustDomain::as_str).collect();
                write!(f, "a member of [{}]", domains.join(", "))
            }
            ExpectedPeerIdentity::Predicate { description, .. } => f.write_str(description),
        }
    }
}

impl fmt::Debug for ExpectedPeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExpectedPeerIdentity({})", self)
    }
}

/// Decides whether a peer's leaf certificate carries an acceptable SPIFFE ID
#[derive(Clone, Debug)]
pub struct PeerIdentityVerifier {
    expected: ExpectedPeerIdentity,
}

impl PeerIdentityVerifier {
    /// Create a verifier for `expected`
    pub fn new(expected: ExpectedPeerIdentity) -> Self {
        PeerIdentityVerifier { expected }
    }

    /// The expected identity
    pub fn expected(&self) -> &ExpectedPeerIdentity {
        &self.expected
    }

    /// Verify the peer's certificate chain, leaf first
    ///
    /// URI SANs that are not SPIFFE IDs are skipped. The peer is accepted if
    /// any of its SPIFFE IDs matches; SAN order does not matter. Returns the
    /// matching ID.
    pub fn verify(&self, peer_chain: &[CertificateDer<'_>]) -> Result<SpiffeId> {
        let leaf = peer_chain.first().ok_or(Error::NoSpiffeIdPresented)?;
        let uris = cert::uri_sans(leaf.as_ref())?;
        self.verify_uris(&uris)
    }

    /// Verify a list of URI SAN values directly
    pub fn verify_uris<S: AsRef<str>>(&self, uris: &[S]) -> Result<SpiffeId> {
        let presented = cert::spiffe_ids_from_uris(uris);
        if presented.is_empty() {
            warn!(expected = %self.expected, "Peer presented no SPIFFE ID");
            return Err(Error::NoSpiffeIdPresented);
        }

        match presented.iter().find(|id| self.expected.matches(id)) {
            Some(id) => {
                debug!(peer = %id, "Peer identity accepted");
                Ok(id.clone())
            }
            None => {
                let err = Error::PeerIdentityMismatch {
                    expected: self.expected.to_string(),
                    presented,
                };
                warn!(error = %err, "Peer identity rejected");
                Err(err)
            }
        }
    }
}

/// Progress of peer verification for one connection attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationState {
    /// Handshake not finished yet
    NotVerified,
    /// Peer certificate under inspection
    Verifying,
    /// Peer accepted as this SPIFFE ID
    Accepted(SpiffeId),
    /// Peer rejected
    Rejected,
}

impl VerificationState {
    /// Whether the state is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::Accepted(_) | VerificationState::Rejected
        )
    }
}

/// Drives [`VerificationState`] for one connection attempt
///
/// Terminal states are final: a second verification of the same attempt is
/// refused.
#[derive(Debug)]
pub struct PeerCheck {
    verifier: PeerIdentityVerifier,
    state: VerificationState,
}

impl PeerCheck {
    /// Start tracking a connection attempt
    pub fn new(verifier: PeerIdentityVerifier) -> Self {
        PeerCheck {
            verifier,
            state: VerificationState::NotVerified,
        }
    }

    /// Current state
    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    /// Verify the peer once, moving to `Accepted` or `Rejected`
    pub fn run(&mut self, peer_chain: Option<&[CertificateDer<'_>]>) -> Result<SpiffeId> {
        if self.state != VerificationState::NotVerified {
            return Err(Error::tls_error(format!(
                "Peer verification already ran for this connection ({:?})",
                self.state
            )));
        }

        self.state = VerificationState::Verifying;
        let result = match peer_chain {
            Some(chain) => self.verifier.verify(chain),
            None => Err(Error::NoSpiffeIdPresented),
        };

        self.state = match &result {
            Ok(id) => VerificationState::Accepted(id.clone()),
            Err(_) => VerificationState::Rejected,
        };
        result
    }
}
