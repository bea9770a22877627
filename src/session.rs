//! Mutually authenticated sessions
//!
//! A session takes one snapshot from the [`IdentitySource`], stages it,
//! builds a TLS context from the staged copy and releases the staging right
//! away. The handshake then runs against that context and the peer's SPIFFE ID
//! is checked before the stream is handed to the caller. A rotation that lands
//! in between only affects sessions prepared afterwards.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mtls::{self, ClientTlsConfig, ServerTlsConfig, TlsContextBuilder};
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;
use crate::staging::{CredentialStager, StagedCredential};
use crate::svid::IdentityMaterial;
use crate::verifier::{ExpectedPeerIdentity, PeerCheck, PeerIdentityVerifier};
use rustls::pki_types::{CertificateDer, ServerName};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

/// Stream whose peer passed SPIFFE ID verification
#[derive(Debug)]
pub struct AuthenticatedStream<S> {
    inner: S,
    peer_id: SpiffeId,
    local: Arc<IdentityMaterial>,
}

impl<S> AuthenticatedStream<S> {
    /// SPIFFE ID the peer was accepted as
    pub fn peer_id(&self) -> &SpiffeId {
        &self.peer_id
    }

    /// Identity snapshot this side authenticated with
    pub fn local_identity(&self) -> &Arc<IdentityMaterial> {
        &self.local
    }

    /// Underlying TLS stream
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Underlying TLS stream, mutably
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the TLS stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AuthenticatedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AuthenticatedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Client stream type
pub type ClientStream<S> = AuthenticatedStream<tokio_rustls::client::TlsStream<S>>;

/// Server stream type
pub type ServerStream<S> = AuthenticatedStream<tokio_rustls::server::TlsStream<S>>;

#[derive(Clone)]
struct SessionContext {
    source: Arc<IdentitySource>,
    stager: Arc<dyn CredentialStager>,
    builder: TlsContextBuilder,
    verifier: PeerIdentityVerifier,
    handshake_timeout: Duration,
}

impl SessionContext {
    fn new(source: Arc<IdentitySource>, expected: ExpectedPeerIdentity, config: &Config) -> Self {
        SessionContext {
            source,
            stager: crate::staging::stager_for(&config.staging),
            builder: TlsContextBuilder::new(&config.tls),
            verifier: PeerIdentityVerifier::new(expected),
            handshake_timeout: config.tls.handshake_timeout(),
        }
    }

    /// Take a snapshot, stage it, build with `build` and release the staging
    ///
    /// Release failures are logged; the build result wins.
    async fn build<T>(
        &self,
        build: impl FnOnce(&TlsContextBuilder, &StagedCredential) -> Result<T>,
    ) -> Result<(Arc<IdentityMaterial>, T)> {
        let material = self.source.fetch().await?;
        let scope = self.verifier.expected().bundle_scope();

        let mut staged = self.stager.stage(&material, &scope)?;
        let built = build(&self.builder, &staged);

        if let Err(e) = staged.release() {
            warn!(staging_id = staged.staging_id(), error = %e, "Failed to release staged credential");
        }

        Ok((material, built?))
    }

    /// Check the peer; a rejected stream is shut down before the error is returned
    async fn authenticate<S>(
        &self,
        mut stream: S,
        peer_chain: Option<Vec<CertificateDer<'static>>>,
        local: Arc<IdentityMaterial>,
    ) -> Result<AuthenticatedStream<S>>
    where
        S: AsyncWrite + Unpin,
    {
        let mut check = PeerCheck::new(self.verifier.clone());
        match check.run(peer_chain.as_deref()) {
            Ok(peer_id) => {
                info!(peer = %peer_id, local = %local.spiffe_id(), "Authenticated session established");
                Ok(AuthenticatedStream {
                    inner: stream,
                    peer_id,
                    local,
                })
            }
            Err(err) => {
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Shutdown of rejected session failed");
                }
                Err(err)
            }
        }
    }
}

async fn with_timeout<F, T>(limit: Duration, handshake: F) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, handshake).await {
        Err(_) => Err(Error::HandshakeTimeout(limit)),
        Ok(Err(e)) => Err(Error::tls_error(format!("Handshake failed: {}", e))),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Opens mutually authenticated connections to peers with an expected identity
#[derive(Clone)]
pub struct SecureClient {
    ctx: SessionContext,
}

impl SecureClient {
    /// Create a client with default settings
    pub fn new(source: Arc<IdentitySource>, expected: ExpectedPeerIdentity) -> Self {
        Self::with_config(source, expected, &Config::default())
    }

    /// Create a client using the TLS and staging settings of `config`
    pub fn with_config(
        source: Arc<IdentitySource>,
        expected: ExpectedPeerIdentity,
        config: &Config,
    ) -> Self {
        SecureClient {
            ctx: SessionContext::new(source, expected, config),
        }
    }

    /// Replace the credential stager
    pub fn with_stager(mut self, stager: Arc<dyn CredentialStager>) -> Self {
        self.ctx.stager = stager;
        self
    }

    /// Build a client context from the current snapshot
    ///
    /// The returned [`PreparedClient`] keeps using that snapshot even if the
    /// source rotates before the handshake starts.
    pub async fn prepare(&self) -> Result<PreparedClient> {
        let (material, tls) = self
            .ctx
            .build(|builder, staged| builder.build_client_context(staged))
            .await?;
        let server_name = mtls::server_name_for(material.spiffe_id().trust_domain())?;

        Ok(PreparedClient {
            ctx: self.ctx.clone(),
            tls,
            server_name,
            material,
        })
    }

    /// Prepare and run the handshake over `io`
    ///
    /// See [`PreparedClient::handshake`] for when a server-side rejection of
    /// this client surfaces.
    pub async fn connect<S>(&self, io: S) -> Result<ClientStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.prepare().await?.handshake(io).await
    }
}

/// Client context bound to one identity snapshot, ready to handshake
pub struct PreparedClient {
    ctx: SessionContext,
    tls: ClientTlsConfig,
    server_name: ServerName<'static>,
    material: Arc<IdentityMaterial>,
}

impl PreparedClient {
    /// Snapshot this context was built from
    pub fn material(&self) -> &Arc<IdentityMaterial> {
        &self.material
    }

    /// Run the TLS handshake over `io` and verify the server's SPIFFE ID
    ///
    /// With TLS 1.3 the client finishes its handshake before the server has
    /// judged the client certificate. A server that rejects this client
    /// therefore shows up as an error on the first read of the returned
    /// stream, not here. With TLS 1.2 the rejection fails the handshake itself.
    pub async fn handshake<S>(&self, io: S) -> Result<ClientStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = self.tls.connector();
        let stream = with_timeout(
            self.ctx.handshake_timeout,
            connector.connect(self.server_name.clone(), io),
        )
        .await?;

        let peer_chain = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec());
        self.ctx
            .authenticate(stream, peer_chain, self.material.clone())
            .await
    }
}

/// Accepts mutually authenticated connections from peers with an expected identity
#[derive(Clone)]
pub struct SecureServer {
    ctx: SessionContext,
}

impl SecureServer {
    /// Create a server with default settings
    pub fn new(source: Arc<IdentitySource>, expected: ExpectedPeerIdentity) -> Self {
        Self::with_config(source, expected, &Config::default())
    }

    /// Create a server using the TLS and staging settings of `config`
    pub fn with_config(
        source: Arc<IdentitySource>,
        expected: ExpectedPeerIdentity,
        config: &Config,
    ) -> Self {
        SecureServer {
            ctx: SessionContext::new(source, expected, config),
        }
    }

    /// Replace the credential stager
    pub fn with_stager(mut self, stager: Arc<dyn CredentialStager>) -> Self {
        self.ctx.stager = stager;
        self
    }

    /// Build a server context from the current snapshot
    pub async fn prepare(&self) -> Result<PreparedServer> {
        let (material, tls) = self
            .ctx
            .build(|builder, staged| builder.build_server_context(staged))
            .await?;

        Ok(PreparedServer {
            ctx: self.ctx.clone(),
            tls,
            material,
        })
    }

    /// Build a fresh context for this connection and run the handshake
    pub async fn accept<S>(&self, io: S) -> Result<ServerStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.prepare().await?.accept(io).await
    }
}

/// Server context bound to one identity snapshot
pub struct PreparedServer {
    ctx: SessionContext,
    tls: ServerTlsConfig,
    material: Arc<IdentityMaterial>,
}

impl PreparedServer {
    /// Snapshot this context was built from
    pub fn material(&self) -> &Arc<IdentityMaterial> {
        &self.material
    }

    /// Run the TLS handshake over `io` and verify the client's SPIFFE ID
    pub async fn accept<S>(&self, io: S) -> Result<ServerStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = self.tls.acceptor();
        let stream = with_timeout(self.ctx.handshake_timeout, acceptor.accept(io)).await?;

        let peer_chain = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec());
        self.ctx
            .authenticate(stream, peer_chain, self.material.clone())
            .await
    }
}
