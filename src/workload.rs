//! Workload API client for SPIRE
//!
//! Speaks the SPIFFE Workload API over the agent's Unix domain socket and
//! turns the `FetchX509SVID` stream into [`IdentityMaterial`] snapshots.

use crate::cert;
use crate::config::WorkloadApiConfig;
use crate::error::{Error, Result};
use crate::proto::{self, X509SvidRequest, X509SvidResponse};
use crate::source::{IdentityProvider, IdentityUpdates};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{IdentityMaterial, PrivateKey};
use crate::trust_bundle::{TrustBundle, TrustBundleSet};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status, Streaming};
use tower::service_fn;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Workload API client for fetching X.509 SVIDs and bundles
#[derive(Clone, Debug)]
pub struct WorkloadApiClient {
    config: WorkloadApiConfig,
}

impl WorkloadApiClient {
    /// Create a client for the endpoint in `config`
    pub fn new(config: WorkloadApiConfig) -> Self {
        WorkloadApiClient { config }
    }

    /// Create a client for the endpoint named by `SPIFFE_ENDPOINT_SOCKET`,
    /// falling back to the default agent socket
    pub fn from_env() -> Self {
        let mut config = crate::config::Config::default();
        config.apply_env();
        Self::new(config.workload_api)
    }

    /// Endpoint configuration
    pub fn config(&self) -> &WorkloadApiConfig {
        &self.config
    }

    /// Connect to the SPIRE agent via Unix socket
    async fn connect(&self) -> Result<Channel> {
        let socket_path = self.config.socket_path()?;

        if !socket_path.exists() {
            return Err(Error::Unreachable(format!(
                "socket {} does not exist",
                socket_path.display()
            )));
        }

        info!(socket_path = %socket_path.display(), "Connecting to SPIRE agent");

        // The URI is ignored by the connector but tonic requires one.
        let path = socket_path.clone();
        Endpoint::from_static("http://[::]:50051")
            .connect_timeout(self.config.connect_timeout())
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    UnixStream::connect(path)
                        .await
                        .map(hyper_util::rt::TokioIo::new)
                }
            }))
            .await
            .map_err(|e| {
                Error::Unreachable(format!(
                    "failed to connect to {}: {}",
                    socket_path.display(),
                    e
                ))
            })
    }

    /// Open the raw `FetchX509SVID` response stream
    pub async fn fetch_x509_stream(&self) -> Result<Streaming<X509SvidResponse>> {
        let channel = self.connect().await?;
        let mut grpc = tonic::client::Grpc::new(channel);

        grpc.ready()
            .await
            .map_err(|e| Error::Unreachable(format!("Workload API not ready: {}", e)))?;

        let mut request = tonic::Request::new(X509SvidRequest {});
        request
            .metadata_mut()
            .insert(proto::SECURITY_HEADER, MetadataValue::from_static("true"));

        let codec: ProstCodec<X509SvidRequest, X509SvidResponse> = ProstCodec::default();
        let response = grpc
            .server_streaming(
                request,
                PathAndQuery::from_static(proto::FETCH_X509_SVID_PATH),
                codec,
            )
            .await
            .map_err(status_to_error)?;

        debug!("X.509 SVID stream opened");
        Ok(response.into_inner())
    }

    /// Fetch the current X.509 SVID once
    pub async fn fetch_x509_material(&self) -> Result<IdentityMaterial> {
        let mut stream = self.fetch_x509_stream().await?;
        match stream.message().await {
            Ok(Some(response)) => material_from_response(response),
            Ok(None) => Err(Error::Unreachable(
                "Workload API closed the stream without an SVID".into(),
            )),
            Err(status) => Err(status_to_error(status)),
        }
    }
}

impl IdentityProvider for WorkloadApiClient {
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityUpdates>> {
        Box::pin(async move {
            let stream = self.fetch_x509_stream().await?;
            Ok(stream
                .map(|item| match item {
                    Ok(response) => material_from_response(response),
                    Err(status) => Err(status_to_error(status)),
                })
                .boxed())
        })
    }
}

/// Map a gRPC status onto the provider error taxonomy
pub fn status_to_error(status: Status) -> Error {
    let message = status.message().to_string();
    match status.code() {
        Code::PermissionDenied | Code::Unauthenticated => Error::Unauthenticated(message),
        Code::InvalidArgument | Code::DataLoss | Code::Internal => Error::Malformed(message),
        code => Error::Unreachable(format!("{:?}: {}", code, message)),
    }
}

/// Convert one stream update into identity material
///
/// The first SVID is the default identity. Its `bundle` becomes the bundle of
/// its own trust domain and `federated_bundles` add the others.
pub fn material_from_response(response: X509SvidResponse) -> Result<IdentityMaterial> {
    let X509SvidResponse {
        svids,
        federated_bundles,
        ..
    } = response;

    let mut svids = svids.into_iter();
    let svid = svids
        .next()
        .ok_or_else(|| Error::malformed("Workload API response contains no SVID"))?;
    for mut unused in svids {
        unused.x509_svid_key.zeroize();
    }

    let spiffe_id = SpiffeId::parse(&svid.spiffe_id)
        .map_err(|e| Error::malformed(format!("Workload API returned {}", e)))?;
    let cert_chain = cert::split_der_certificates(&svid.x509_svid)?;
    let private_key = PrivateKey::pkcs8(svid.x509_svid_key)?;

    let mut bundles = TrustBundleSet::new();
    bundles.insert(TrustBundle::new(
        spiffe_id.trust_domain().clone(),
        cert::split_der_certificates(&svid.bundle)?,
    ));

    for (name, roots) in federated_bundles {
        let trust_domain = TrustDomain::new(&name)
            .map_err(|e| Error::malformed(format!("Federated bundle key: {}", e)))?;
        if &trust_domain == spiffe_id.trust_domain() {
            warn!(trust_domain = %trust_domain, "Ignoring federated bundle for own trust domain");
            continue;
        }
        bundles.insert(TrustBundle::new(
            trust_domain,
            cert::split_der_certificates(&roots)?,
        ));
    }

    IdentityMaterial::new(spiffe_id, cert_chain, private_key, bundles)
}
