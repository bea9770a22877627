//! X.509 SVID identity material
//!
//! An [`IdentityMaterial`] is an immutable snapshot of everything a workload
//! needs for mutual TLS: its SPIFFE ID, leaf certificate and chain, private
//! key, and the trust bundles it accepts peers from. Rotation produces a new
//! snapshot; nothing here is ever mutated in place.

use crate::cert::{self, LeafInfo};
use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::trust_bundle::{TrustBundle, TrustBundleSet};
use chrono::{DateTime, Utc};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use std::fmt;
use zeroize::Zeroizing;

/// Encoding of a DER private key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFormat {
    /// PKCS#8 `PrivateKeyInfo`, what the Workload API hands out
    Pkcs8,
    /// PKCS#1 RSA private key
    Pkcs1,
    /// SEC1 EC private key
    Sec1,
}

impl KeyFormat {
    /// PEM label for this encoding
    pub fn pem_label(self) -> &'static str {
        match self {
            KeyFormat::Pkcs8 => "PRIVATE KEY",
            KeyFormat::Pkcs1 => "RSA PRIVATE KEY",
            KeyFormat::Sec1 => "EC PRIVATE KEY",
        }
    }
}

/// A DER private key whose bytes are wiped when dropped
#[derive(Clone)]
pub struct PrivateKey {
    der: Zeroizing<Vec<u8>>,
    format: KeyFormat,
}

impl PrivateKey {
    /// Wrap DER bytes of the given format
    pub fn new(der: Vec<u8>, format: KeyFormat) -> Result<Self> {
        if der.is_empty() {
            return Err(Error::malformed("Private key cannot be empty"));
        }

        Ok(PrivateKey {
            der: Zeroizing::new(der),
            format,
        })
    }

    /// Wrap a PKCS#8 DER key
    pub fn pkcs8(der: Vec<u8>) -> Result<Self> {
        Self::new(der, KeyFormat::Pkcs8)
    }

    /// Raw DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Key encoding
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// Copy into the type rustls consumes
    pub fn to_rustls(&self) -> PrivateKeyDer<'static> {
        let der = self.der.to_vec();
        match self.format {
            KeyFormat::Pkcs8 => PrivatePkcs8KeyDer::from(der).into(),
            KeyFormat::Pkcs1 => PrivatePkcs1KeyDer::from(der).into(),
            KeyFormat::Sec1 => PrivateSec1KeyDer::from(der).into(),
        }
    }

    /// Encode as a PEM block; the returned buffer is wiped on drop
    pub fn to_pem(&self) -> Zeroizing<String> {
        let block = pem::Pem::new(self.format.pem_label(), self.der.to_vec());
        Zeroizing::new(pem::encode(&block))
    }
}

impl From<PrivateKeyDer<'_>> for PrivateKey {
    fn from(key: PrivateKeyDer<'_>) -> Self {
        let format = match &key {
            PrivateKeyDer::Pkcs1(_) => KeyFormat::Pkcs1,
            PrivateKeyDer::Sec1(_) => KeyFormat::Sec1,
            _ => KeyFormat::Pkcs8,
        };
        PrivateKey {
            der: Zeroizing::new(key.secret_der().to_vec()),
            format,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("format", &self.format)
            .field("der", &"<redacted>")
            .finish()
    }
}

/// X.509 SVID bundle: identity, credentials and trust bundles at one point in time
#[derive(Clone)]
pub struct IdentityMaterial {
    /// The SPIFFE ID for this SVID
    spiffe_id: SpiffeId,
    /// Leaf certificate followed by intermediates (DER encoded)
    cert_chain: Vec<CertificateDer<'static>>,
    /// Private key for the leaf
    private_key: PrivateKey,
    /// Trusted roots per trust domain
    trust_bundles: TrustBundleSet,
    /// Leaf validity start
    not_before: DateTime<Utc>,
    /// Leaf validity end
    not_after: DateTime<Utc>,
    /// Leaf serial number
    serial_number: String,
}

impl IdentityMaterial {
    /// Create identity material, checking that the leaf certificate names `spiffe_id`
    ///
    /// Fails with [`Error::Malformed`] if the chain is empty, the leaf cannot be
    /// parsed, the leaf's SPIFFE URI SAN is not exactly `spiffe_id`, or a trust
    /// bundle fails [`TrustBundle::validate`].
    pub fn new(
        spiffe_id: SpiffeId,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKey,
        trust_bundles: TrustBundleSet,
    ) -> Result<Self> {
        let leaf = cert_chain
            .first()
            .ok_or_else(|| Error::malformed("Certificate chain cannot be empty"))?;

        let info = LeafInfo::from_der(leaf.as_ref())?;
        let presented = info.spiffe_ids();
        match presented.as_slice() {
            [only] if *only == spiffe_id => {}
            [] => {
                return Err(Error::malformed(format!(
                    "Leaf certificate has no SPIFFE URI SAN, expected {}",
                    spiffe_id
                )))
            }
            _ => {
                return Err(Error::malformed(format!(
                    "Leaf certificate SAN {:?} does not match declared SPIFFE ID {}",
                    presented.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    spiffe_id
                )))
            }
        }

        for bundle in trust_bundles.iter() {
            bundle.validate().map_err(|e| Error::malformed(e.to_string()))?;
        }

        Ok(IdentityMaterial {
            spiffe_id,
            cert_chain,
            private_key,
            trust_bundles,
            not_before: info.not_before,
            not_after: info.not_after,
            serial_number: info.serial_number,
        })
    }

    /// Load identity material from PEM documents
    ///
    /// The SPIFFE ID is read from the leaf certificate and the bundle is filed
    /// under that ID's trust domain.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8], bundle_pem: &[u8]) -> Result<Self> {
        let cert_chain = cert::certificates_from_pem(chain_pem)?;
        let leaf = cert_chain
            .first()
            .ok_or_else(|| Error::malformed("No certificate found in SVID PEM"))?;

        let spiffe_id = match LeafInfo::from_der(leaf.as_ref())?.spiffe_ids().as_slice() {
            [id] => id.clone(),
            [] => return Err(Error::malformed("Leaf certificate has no SPIFFE URI SAN")),
            _ => return Err(Error::malformed("Leaf certificate has several SPIFFE IDs")),
        };

        let private_key = PrivateKey::from(cert::private_key_from_pem(key_pem)?);
        let roots = cert::certificates_from_pem(bundle_pem)?;

        let mut bundles = TrustBundleSet::new();
        bundles.insert(TrustBundle::new(spiffe_id.trust_domain().clone(), roots));

        Self::new(spiffe_id, cert_chain, private_key, bundles)
    }

    /// Get the SPIFFE ID
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Get the certificate chain, leaf first
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Get the leaf certificate
    pub fn leaf_cert(&self) -> &CertificateDer<'static> {
        // Non-empty by construction.
        &self.cert_chain[0]
    }

    /// Get the intermediates that follow the leaf
    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain[1..]
    }

    /// Get the private key
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Get the trust bundles
    pub fn trust_bundles(&self) -> &TrustBundleSet {
        &self.trust_bundles
    }

    /// Get the validity start
    pub fn not_before(&self) -> &DateTime<Utc> {
        &self.not_before
    }

    /// Get the expiration time
    pub fn not_after(&self) -> &DateTime<Utc> {
        &self.not_after
    }

    /// Get the serial number
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Check if the SVID has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    /// Get time until expiration
    pub fn time_until_expiry(&self) -> chrono::Duration {
        self.not_after - Utc::now()
    }

    /// Check if rotation is due: less than half of the lifetime remains
    pub fn needs_rotation(&self) -> bool {
        let lifetime = self.not_after - self.not_before;
        self.time_until_expiry() < lifetime / 2
    }
}

impl fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("spiffe_id", &self.spiffe_id)
            .field("chain_len", &self.cert_chain.len())
            .field("private_key", &self.private_key)
            .field(
                "trust_domains",
                &self.trust_bundles.domains().collect::<Vec<_>>(),
            )
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("serial_number", &self.serial_number)
            .finish()
    }
}
