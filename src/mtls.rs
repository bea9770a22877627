//! mTLS context construction for SPIFFE identities
//!
//! Contexts are built from a [`StagedCredential`]. Both sides require a peer
//! certificate and validate its chain against the staged trust bundle. Neither
//! side checks DNS names; who the peer *is* gets decided afterwards by
//! [`PeerIdentityVerifier`](crate::verifier::PeerIdentityVerifier).

use crate::config::{MinTlsVersion, TlsSettings};
use crate::error::{Error, Result};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::staging::{LoadedCredential, StagedCredential};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme, SupportedProtocolVersion,
};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

const KEY_PROBE: &[u8] = b"spiffe-mtls key ownership probe";

static TLS12_AND_13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Builds rustls client and server configurations from staged credentials
#[derive(Clone, Debug)]
pub struct TlsContextBuilder {
    provider: Arc<CryptoProvider>,
    versions: &'static [&'static SupportedProtocolVersion],
}

impl Default for TlsContextBuilder {
    fn default() -> Self {
        Self::new(&TlsSettings::default())
    }
}

impl TlsContextBuilder {
    /// Create a builder honoring the minimum protocol version in `settings`
    pub fn new(settings: &TlsSettings) -> Self {
        let versions = match settings.min_version {
            MinTlsVersion::Tls12 => TLS12_AND_13,
            MinTlsVersion::Tls13 => TLS13_ONLY,
        };

        TlsContextBuilder {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            versions,
        }
    }

    /// Build the configuration for outbound connections
    ///
    /// The client presents the staged chain and validates the server's chain
    /// against the staged bundle. Fails with [`Error::InvalidMaterial`] when the
    /// key does not belong to the leaf and [`Error::InvalidTrustBundle`] when
    /// the bundle holds no usable root.
    pub fn build_client_context(&self, staged: &StagedCredential) -> Result<ClientTlsConfig> {
        let loaded = staged.load()?;
        let roots = self.prepare(&loaded)?;

        let verifier = Arc::new(SpiffeServerCertVerifier {
            roots: Arc::new(roots),
            provider: self.provider.clone(),
        });

        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(self.versions)
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(loaded.cert_chain, loaded.private_key)
            .map_err(|e| Error::InvalidMaterial(format!("Client certificate rejected: {}", e)))?;

        debug!(
            staging_id = staged.staging_id(),
            spiffe_id = %staged.spiffe_id(),
            "Built client TLS context"
        );

        Ok(ClientTlsConfig {
            config: Arc::new(config),
            spiffe_id: staged.spiffe_id().clone(),
        })
    }

    /// Build the configuration for inbound connections
    ///
    /// A client certificate is mandatory; a client that presents none fails
    /// the handshake.
    pub fn build_server_context(&self, staged: &StagedCredential) -> Result<ServerTlsConfig> {
        let loaded = staged.load()?;
        let roots = self.prepare(&loaded)?;

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), self.provider.clone())
                .build()
                .map_err(|e| {
                    Error::InvalidTrustBundle(format!("Failed to create client verifier: {}", e))
                })?;

        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(self.versions)
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(loaded.cert_chain, loaded.private_key)
            .map_err(|e| Error::InvalidMaterial(format!("Server certificate rejected: {}", e)))?;

        debug!(
            staging_id = staged.staging_id(),
            spiffe_id = %staged.spiffe_id(),
            "Built server TLS context"
        );

        Ok(ServerTlsConfig {
            config: Arc::new(config),
            spiffe_id: staged.spiffe_id().clone(),
        })
    }

    fn prepare(&self, loaded: &LoadedCredential) -> Result<RootCertStore> {
        if loaded.roots.is_empty() {
            return Err(Error::InvalidTrustBundle(
                "Trust bundle must contain at least one root certificate".into(),
            ));
        }

        let mut roots = RootCertStore::empty();
        for (i, cert) in loaded.roots.iter().enumerate() {
            roots.add(cert.clone()).map_err(|e| {
                Error::InvalidTrustBundle(format!("Root certificate {} unusable: {}", i, e))
            })?;
        }

        let leaf = loaded
            .cert_chain
            .first()
            .ok_or_else(|| Error::InvalidMaterial("Certificate chain is empty".into()))?;
        check_key_matches(&self.provider, leaf, &loaded.private_key)?;

        Ok(roots)
    }
}

/// Prove the private key belongs to the leaf by signing a probe with the key
/// and verifying it with the certificate's public key
fn check_key_matches(
    provider: &CryptoProvider,
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'static>,
) -> Result<()> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::InvalidMaterial(format!("Unsupported private key: {}", e)))?;

    let schemes = provider.signature_verification_algorithms.supported_schemes();
    let signer = signing_key
        .choose_scheme(&schemes)
        .ok_or_else(|| Error::InvalidMaterial("No signature scheme for private key".into()))?;
    let signature = signer
        .sign(KEY_PROBE)
        .map_err(|e| Error::InvalidMaterial(format!("Private key cannot sign: {}", e)))?;

    let algorithms = provider
        .signature_verification_algorithms
        .mapping
        .iter()
        .find(|(scheme, _)| *scheme == signer.scheme())
        .map(|(_, algs)| *algs)
        .unwrap_or(&[]);

    let cert = webpki::EndEntityCert::try_from(leaf)
        .map_err(|e| Error::InvalidMaterial(format!("Leaf certificate unusable: {}", e)))?;

    if algorithms
        .iter()
        .any(|alg| cert.verify_signature(*alg, KEY_PROBE, &signature).is_ok())
    {
        Ok(())
    } else {
        Err(Error::InvalidMaterial(
            "Private key does not match the leaf certificate".into(),
        ))
    }
}

/// Client side TLS configuration bound to one identity snapshot
#[derive(Clone)]
pub struct ClientTlsConfig {
    config: Arc<ClientConfig>,
    spiffe_id: SpiffeId,
}

impl ClientTlsConfig {
    /// The rustls configuration
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    /// SPIFFE ID this configuration authenticates as
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Create a TLS connector for client connections
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

/// Server side TLS configuration bound to one identity snapshot
#[derive(Clone)]
pub struct ServerTlsConfig {
    config: Arc<ServerConfig>,
    spiffe_id: SpiffeId,
}

impl ServerTlsConfig {
    /// The rustls configuration
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// SPIFFE ID this configuration authenticates as
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Create a TLS acceptor for server connections
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

/// SNI value for a connection
///
/// SPIFFE IDs are not DNS names; the name only fills the SNI field and is
/// never verified.
pub fn server_name_for(trust_domain: &TrustDomain) -> Result<ServerName<'static>> {
    ServerName::try_from(trust_domain.as_str().to_string()).map_err(|e| {
        Error::tls_error(format!(
            "Trust domain {} is not usable as SNI: {}",
            trust_domain, e
        ))
    })
}

/// Server certificate verifier that validates the chain of trust only
#[derive(Debug)]
struct SpiffeServerCertVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        cert.verify_for_usage(
            self.provider.signature_verification_algorithms.all,
            &self.roots.roots,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            debug!(error = ?e, "Server certificate chain rejected");
            rustls::Error::InvalidCertificate(certificate_error(e))
        })?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn certificate_error(error: webpki::Error) -> CertificateError {
    match error {
        webpki::Error::CertExpired { .. } => CertificateError::Expired,
        webpki::Error::CertNotValidYet { .. } => CertificateError::NotValidYet,
        webpki::Error::UnknownIssuer => CertificateError::UnknownIssuer,
        webpki::Error::CertRevoked => CertificateError::Revoked,
        webpki::Error::InvalidSignatureForPublicKey
        | webpki::Error::UnsupportedSignatureAlgorithm
        | webpki::Error::UnsupportedSignatureAlgorithmForPublicKey => {
            CertificateError::BadSignature
        }
        _ => CertificateError::ApplicationVerificationFailure,
    }
}
