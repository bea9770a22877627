//! Messages of the SPIFFE Workload API used by the X.509 SVID stream
//!
//! Declared by hand with `prost` derives; field numbers follow
//! `workload.proto` from the SPIFFE project.

use std::collections::HashMap;

/// Fully qualified path of the X.509 SVID streaming RPC
pub const FETCH_X509_SVID_PATH: &str = "/SpiffeWorkloadAPI/FetchX509SVID";

/// Metadata key every Workload API request must carry
pub const SECURITY_HEADER: &str = "workload.spiffe.io";

/// Request for the X.509 SVID stream; carries no fields
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509SvidRequest {}

/// One update of the X.509 SVID stream
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509SvidResponse {
    /// SVIDs the workload is entitled to; the first is the default
    #[prost(message, repeated, tag = "1")]
    pub svids: Vec<X509Svid>,

    /// ASN.1 DER encoded certificate revocation lists
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub crl: Vec<Vec<u8>>,

    /// Federated trust domain to concatenated DER root certificates
    #[prost(map = "string, bytes", tag = "3")]
    pub federated_bundles: HashMap<String, Vec<u8>>,
}

/// A single X.509 SVID with its key and local bundle
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct X509Svid {
    /// SPIFFE ID of the SVID
    #[prost(string, tag = "1")]
    pub spiffe_id: String,

    /// Leaf certificate followed by intermediates, concatenated DER
    #[prost(bytes = "vec", tag = "2")]
    pub x509_svid: Vec<u8>,

    /// PKCS#8 private key, DER
    #[prost(bytes = "vec", tag = "3")]
    pub x509_svid_key: Vec<u8>,

    /// Roots of the SVID's own trust domain, concatenated DER
    #[prost(bytes = "vec", tag = "4")]
    pub bundle: Vec<u8>,

    /// Operator supplied hint to tell SVIDs apart
    #[prost(string, tag = "5")]
    pub hint: String,
}
