//! Certificate fixtures minted with rcgen for unit tests

use crate::cert;
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{IdentityMaterial, PrivateKey};
use crate::trust_bundle::{TrustBundle, TrustBundleSet};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;

pub(crate) struct TestCa {
    pub trust_domain: TrustDomain,
    pub cert: CertificateDer<'static>,
    signer: Certificate,
}

pub(crate) struct TestLeaf {
    pub cert: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub key_pem: String,
}

impl TestLeaf {
    pub fn cert_pem(&self) -> String {
        cert::certificates_to_pem(&[self.cert.clone()])
    }
}

impl TestCa {
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
            .push(DnType::OrganizationName, trust_domain);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} test CA", trust_domain));

        let signer = Certificate::from_params(params).unwrap();
        let cert = CertificateDer::from(signer.serialize_der().unwrap());

        TestCa {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            cert,
            signer,
        }
    }

    pub fn cert_pem(&self) -> String {
        cert::certificates_to_pem(&[self.cert.clone()])
    }

    pub fn bundle_set(&self) -> TrustBundleSet {
        let mut set = TrustBundleSet::new();
        set.insert(TrustBundle::new(
            self.trust_domain.clone(),
            vec![self.cert.clone()],
        ));
        set
    }

    pub fn issue(&self, spiffe_id: &str) -> TestLeaf {
        self.issue_with_uris(&[spiffe_id])
    }

    pub fn issue_with_uris(&self, uris: &[&str]) -> TestLeaf {
        self.sign(leaf_params(uris))
    }

    pub fn issue_expired(&self, spiffe_id: &str) -> TestLeaf {
        let mut params = leaf_params(&[spiffe_id]);
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        self.sign(params)
    }

    pub fn material(&self, spiffe_id: &str) -> IdentityMaterial {
        let leaf = self.issue(spiffe_id);
        IdentityMaterial::new(
            SpiffeId::parse(spiffe_id).unwrap(),
            vec![leaf.cert],
            PrivateKey::pkcs8(leaf.key_der).unwrap(),
            self.bundle_set(),
        )
        .unwrap()
    }

    fn sign(&self, params: CertificateParams) -> TestLeaf {
        let leaf = Certificate::from_params(params).unwrap();
        let der = leaf.serialize_der_with_signer(&self.signer).unwrap();

        TestLeaf {
            cert: CertificateDer::from(der),
            key_der: leaf.serialize_private_key_der(),
            key_pem: leaf.serialize_private_key_pem(),
        }
    }
}

fn leaf_params(uris: &[&str]) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    params.subject_alt_names = uris
        .iter()
        .map(|uri| SanType::URI(uri.to_string()))
        .collect();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "SVID");
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2099, 1, 1);
    params
}
