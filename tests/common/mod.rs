//! Shared fixtures for integration tests

#![allow(dead_code)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use spiffe_mtls::{
    ExpectedPeerIdentity, IdentityMaterial, IdentitySource, PrivateKey, SpiffeId,
    StaticIdentityProvider, TrustBundle, TrustBundleSet, TrustDomain,
};
use std::sync::Arc;
use std::time::Duration;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Certificate authority for one trust domain
pub struct Authority {
    pub trust_domain: TrustDomain,
    pub cert: CertificateDer<'static>,
    signer: Certificate,
}

/// A leaf certificate and its key
pub struct Leaf {
    pub cert: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl Authority {
    pub fn new(trust_domain: &str) -> Self {
        let mut params = CertificateParams::new(vec![]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} root", trust_domain));

        let signer = Certificate::from_params(params).unwrap();
        let cert = CertificateDer::from(signer.serialize_der().unwrap());

        Authority {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            cert,
            signer,
        }
    }

    pub fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.cert.as_ref().to_vec()))
    }

    pub fn bundles(&self) -> TrustBundleSet {
        [TrustBundle::new(
            self.trust_domain.clone(),
            vec![self.cert.clone()],
        )]
        .into_iter()
        .collect()
    }

    pub fn leaf(&self, uris: &[&str]) -> Leaf {
        self.sign(leaf_params(uris, 2024, 2099))
    }

    pub fn expired_leaf(&self, uri: &str) -> Leaf {
        self.sign(leaf_params(&[uri], 2000, 2001))
    }

    fn sign(&self, params: CertificateParams) -> Leaf {
        let cert = Certificate::from_params(params).unwrap();
        let der = cert.serialize_der_with_signer(&self.signer).unwrap();
        Leaf {
            cert_pem: pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())),
            cert: CertificateDer::from(der),
            key_der: cert.serialize_private_key_der(),
            key_pem: cert.serialize_private_key_pem(),
        }
    }

    /// Identity material for `id`, trusting this authority only
    pub fn material(&self, id: &str) -> IdentityMaterial {
        self.material_trusting(id, self.bundles())
    }

    /// Identity material for `id` issued by this authority with arbitrary trust
    pub fn material_trusting(&self, id: &str, bundles: TrustBundleSet) -> IdentityMaterial {
        let leaf = self.leaf(&[id]);
        IdentityMaterial::new(
            SpiffeId::parse(id).unwrap(),
            vec![leaf.cert],
            PrivateKey::pkcs8(leaf.key_der).unwrap(),
            bundles,
        )
        .unwrap()
    }
}

fn leaf_params(uris: &[&str], from: i32, until: i32) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    params.subject_alt_names = uris
        .iter()
        .map(|uri| SanType::URI(uri.to_string()))
        .collect();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "SVID");
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = rcgen::date_time_ymd(from, 1, 1);
    params.not_after = rcgen::date_time_ymd(until, 1, 1);
    params
}

/// Identity source fed by a static provider the test keeps a handle to
pub fn static_source(material: IdentityMaterial) -> (Arc<StaticIdentityProvider>, Arc<IdentitySource>) {
    let provider = Arc::new(StaticIdentityProvider::new(material));
    let source = Arc::new(IdentitySource::new(provider.clone(), FETCH_TIMEOUT));
    (provider, source)
}

pub fn exact(id: &str) -> ExpectedPeerIdentity {
    ExpectedPeerIdentity::exact(SpiffeId::parse(id).unwrap())
}

/// Server verifier that accepts anything, for building deliberately weak peers
#[derive(Debug)]
pub struct AcceptAnyServer(pub Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A client that presents no certificate at all
pub fn anonymous_client() -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServer(provider)))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}
