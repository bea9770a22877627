//! SPIFFE mTLS demo: a greeting server and a client that calls it

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spiffe_mtls::{
    Config, ExpectedPeerIdentity, IdentitySource, SecureClient, SecureServer, SpiffeId,
    StaticIdentityProvider, TrustDomain,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workload API address, overrides the configuration and SPIFFE_ENDPOINT_SOCKET
    #[arg(long, global = true, conflicts_with = "cert_dir")]
    socket: Option<String>,

    /// Directory with svid.pem, svid_key.pem and bundle.pem instead of the Workload API
    #[arg(long, global = true)]
    cert_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Greet every authenticated client
    Server(ServerArgs),
    /// Call the server and print its greeting
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: String,

    /// Trust domain clients must belong to; defaults to the server's own
    #[arg(long)]
    allow_trust_domain: Vec<String>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, default_value = "localhost:8443")]
    connect: String,

    /// SPIFFE ID the server must present
    #[arg(long, default_value = "spiffe://example.org/server")]
    server_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let source = Arc::new(open_source(&cli, &config)?);

    let result = match cli.command {
        Command::Server(args) => run_server(source.clone(), &config, args).await,
        Command::Client(args) => run_client(source.clone(), &config, args).await,
    };

    source.close();
    result
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(socket) = &cli.socket {
        config.workload_api.socket = socket.clone();
    }
    Ok(config)
}

fn open_source(cli: &Cli, config: &Config) -> Result<IdentitySource> {
    match &cli.cert_dir {
        Some(dir) => {
            let provider = StaticIdentityProvider::from_pem_files(
                dir.join("svid.pem"),
                dir.join("svid_key.pem"),
                dir.join("bundle.pem"),
            )
            .with_context(|| format!("loading credentials from {}", dir.display()))?;
            info!(dir = %dir.display(), "Using credentials from disk");
            Ok(IdentitySource::new(
                Arc::new(provider),
                config.workload_api.fetch_timeout(),
            ))
        }
        None => {
            info!(socket = %config.workload_api.socket, "Using the Workload API");
            Ok(IdentitySource::workload_api(&config.workload_api))
        }
    }
}

async fn run_server(source: Arc<IdentitySource>, config: &Config, args: ServerArgs) -> Result<()> {
    let identity = source.fetch().await.context("fetching server identity")?;
    info!(spiffe_id = %identity.spiffe_id(), "Server identity");

    let allowed = if args.allow_trust_domain.is_empty() {
        vec![identity.spiffe_id().trust_domain().clone()]
    } else {
        args.allow_trust_domain
            .iter()
            .map(TrustDomain::new)
            .collect::<spiffe_mtls::Result<Vec<_>>>()
            .context("parsing --allow-trust-domain")?
    };

    source.watch(|material| {
        info!(spiffe_id = %material.spiffe_id(), not_after = %material.not_after(), "Identity rotated");
    });

    let server = SecureServer::with_config(
        source.clone(),
        ExpectedPeerIdentity::member_of_any(allowed),
        config,
    );

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("Server listening on {}", args.listen);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let server = server.clone();

        tokio::spawn(async move {
            if let Err(e) = greet(server, stream).await {
                warn!(%peer_addr, error = %e, "Connection failed");
            }
        });
    }
}

async fn greet(server: SecureServer, stream: TcpStream) -> Result<()> {
    let mut session = server.accept(stream).await?;
    let client_id = session.peer_id().clone();
    info!(client = %client_id, "Received request");

    let greeting = format!(
        "Hello, {}! The current time is {}.\n",
        client_id,
        chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
    );
    session.write_all(greeting.as_bytes()).await?;
    session.shutdown().await?;
    Ok(())
}

async fn run_client(source: Arc<IdentitySource>, config: &Config, args: ClientArgs) -> Result<()> {
    let server_id = SpiffeId::parse(&args.server_id).context("parsing --server-id")?;
    let client = SecureClient::with_config(source, ExpectedPeerIdentity::exact(server_id), config);

    let stream = TcpStream::connect(&args.connect)
        .await
        .with_context(|| format!("connecting to {}", args.connect))?;

    let mut session = match client.connect(stream).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Unable to establish an authenticated session");
            return Err(e.into());
        }
    };

    let mut response = String::new();
    session.read_to_string(&mut response).await?;
    print!("{}", response);
    Ok(())
}
