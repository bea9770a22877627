//! Trust bundle management for SPIFFE

use crate::error::{Error, Result};
use crate::spiffe_id::TrustDomain;
use rustls::pki_types::CertificateDer;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Trust bundle containing root certificates for a trust domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustBundle {
    /// Trust domain this bundle belongs to
    trust_domain: TrustDomain,
    /// Root CA certificates (DER encoded)
    certificates: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Create a new trust bundle
    pub fn new(trust_domain: TrustDomain, certificates: Vec<CertificateDer<'static>>) -> Self {
        TrustBundle {
            trust_domain,
            certificates,
        }
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Get the root certificates
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Check whether the bundle holds no roots
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Validate the trust bundle
    pub fn validate(&self) -> Result<()> {
        if self.certificates.is_empty() {
            return Err(Error::InvalidTrustBundle(format!(
                "Trust bundle for {} must contain at least one certificate",
                self.trust_domain
            )));
        }

        for (i, cert) in self.certificates.iter().enumerate() {
            if cert.as_ref().is_empty() {
                return Err(Error::InvalidTrustBundle(format!(
                    "Certificate {} of {} is empty",
                    i, self.trust_domain
                )));
            }
        }

        Ok(())
    }
}

/// Which trust domains' roots a session needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleScope {
    /// Roots of every trust domain in the set
    All,
    /// Roots of the listed trust domains only
    Domains(BTreeSet<TrustDomain>),
}

impl BundleScope {
    /// Scope limited to a single trust domain
    pub fn single(trust_domain: TrustDomain) -> Self {
        BundleScope::Domains(BTreeSet::from([trust_domain]))
    }

    /// Check whether a trust domain falls inside the scope
    pub fn includes(&self, trust_domain: &TrustDomain) -> bool {
        match self {
            BundleScope::All => true,
            BundleScope::Domains(domains) => domains.contains(trust_domain),
        }
    }
}

/// Trust bundles keyed by trust domain, the local one plus any federated ones
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustBundleSet {
    bundles: BTreeMap<TrustDomain, TrustBundle>,
}

impl TrustBundleSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the bundle for its trust domain
    pub fn insert(&mut self, bundle: TrustBundle) {
        debug!(
            trust_domain = %bundle.trust_domain(),
            roots = bundle.certificates().len(),
            "Set trust bundle"
        );
        self.bundles.insert(bundle.trust_domain().clone(), bundle);
    }

    /// Get a trust bundle for a domain
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<&TrustBundle> {
        self.bundles.get(trust_domain)
    }

    /// Get all trust domains
    pub fn domains(&self) -> impl Iterator<Item = &TrustDomain> {
        self.bundles.keys()
    }

    /// Get all trust bundles
    pub fn iter(&self) -> impl Iterator<Item = &TrustBundle> {
        self.bundles.values()
    }

    /// Number of trust domains in the set
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Check whether the set has no bundles
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Concatenate the roots of every bundle inside the scope
    pub fn roots_for(&self, scope: &BundleScope) -> Vec<CertificateDer<'static>> {
        self.bundles
            .values()
            .filter(|bundle| scope.includes(bundle.trust_domain()))
            .flat_map(|bundle| bundle.certificates().iter().cloned())
            .collect()
    }
}

impl FromIterator<TrustBundle> for TrustBundleSet {
    fn from_iter<I: IntoIterator<Item = TrustBundle>>(iter: I) -> Self {
        let mut set = TrustBundleSet::new();
        for bundle in iter {
            set.insert(bundle);
        }
        set
    }
}
