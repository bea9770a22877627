//! X.509 and PEM helpers
//!
//! Parsing is done with `x509-parser`; PEM decoding goes through
//! `rustls-pemfile` so the results are ready for rustls, and encoding uses the
//! `pem` crate.

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::trace;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Facts about a leaf certificate that identity handling depends on
#[derive(Clone, Debug)]
pub struct LeafInfo {
    /// Every URI SAN value, in certificate order
    pub uri_sans: Vec<String>,
    /// Validity start
    pub not_before: DateTime<Utc>,
    /// Validity end
    pub not_after: DateTime<Utc>,
    /// Serial number, colon separated hex
    pub serial_number: String,
}

impl LeafInfo {
    /// Parse the facts out of a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::malformed(format!("Failed to parse certificate: {}", e)))?;

        let uri_sans = uri_sans_of(&cert)?;
        let validity = cert.validity();

        Ok(LeafInfo {
            uri_sans,
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
            serial_number: cert.raw_serial_as_string(),
        })
    }

    /// The URI SANs that parse as SPIFFE IDs; other URIs are skipped
    pub fn spiffe_ids(&self) -> Vec<SpiffeId> {
        spiffe_ids_from_uris(&self.uri_sans)
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::malformed(format!("Certificate time {} out of range", secs)))
}

fn uri_sans_of(cert: &X509Certificate<'_>) -> Result<Vec<String>> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::malformed(format!("Failed to parse SAN extension: {}", e)))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(uri.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Collect the URI SAN values of a DER certificate
pub fn uri_sans(der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::malformed(format!("Failed to parse certificate: {}", e)))?;
    uri_sans_of(&cert)
}

/// Keep the values that are valid SPIFFE IDs, discarding every other URI
pub fn spiffe_ids_from_uris<S: AsRef<str>>(uris: &[S]) -> Vec<SpiffeId> {
    uris.iter()
        .filter_map(|uri| match SpiffeId::parse(uri.as_ref()) {
            Ok(id) => Some(id),
            Err(e) => {
                trace!(uri = uri.as_ref(), error = %e, "ignoring non-SPIFFE URI SAN");
                None
            }
        })
        .collect()
}

/// Split a blob of concatenated DER certificates, as the Workload API sends them
pub fn split_der_certificates(data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let (remaining, _) = X509Certificate::from_der(rest).map_err(|e| {
            Error::malformed(format!(
                "Failed to parse certificate {} in DER sequence: {}",
                certs.len(),
                e
            ))
        })?;
        let consumed = rest.len() - remaining.len();
        certs.push(CertificateDer::from(rest[..consumed].to_vec()));
        rest = remaining;
    }

    Ok(certs)
}

/// Decode every CERTIFICATE block of a PEM document
pub fn certificates_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::malformed(format!("Failed to decode PEM certificates: {}", e)))
}

/// Decode the first private key of a PEM document
pub fn private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| Error::malformed("Failed to decode PEM private key"))?
        .ok_or_else(|| Error::malformed("No private key found in PEM"))
}

/// Encode certificates as concatenated PEM CERTIFICATE blocks
pub fn certificates_to_pem(certs: &[CertificateDer<'_>]) -> String {
    let blocks: Vec<pem::Pem> = certs
        .iter()
        .map(|cert| pem::Pem::new("CERTIFICATE", cert.as_ref().to_vec()))
        .collect();
    pem::encode_many(&blocks)
}
