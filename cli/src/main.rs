//! Command line entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use piko::{AuthConfig, Config, Server, TokenVerifier};
use tracing::info;

/// Piko cluster server and client-side forwarder.
#[derive(Parser, Debug)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a cluster node: proxy, upstream session server, admin and gossip.
    Server(ServerArgs),
    /// Run the client-side forwarder: tunnel a local TCP port to an endpoint.
    Forwarder(ForwarderArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the YAML config file.
    #[clap(long, env = "PIKO_CONFIG", default_value = "piko.yaml")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct ForwarderArgs {
    /// Path to the YAML config file. `forwarder.{bind_addr,target_addr,endpoint_id}`
    /// are read from it unless overridden below.
    #[clap(long, env = "PIKO_CONFIG", default_value = "piko.yaml")]
    config: PathBuf,
    #[clap(long)]
    bind_addr: Option<SocketAddr>,
    #[clap(long)]
    target_addr: Option<SocketAddr>,
    #[clap(long)]
    endpoint_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    if let Ok(path) = dotenv::dotenv() {
        info!(path = %path.display(), "loaded environment variables");
    }

    let args = Args::parse();
    match args.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Forwarder(args) => run_forwarder(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = Config::from_file(args.config).await?;
    let token_verifier = build_token_verifier(&config.auth).await?;

    let server = Server::new(config, token_verifier).await?;
    let cancel = server.cancellation_token();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        cancel.cancel();
    });

    server.run().await
}

async fn run_forwarder(args: ForwarderArgs) -> anyhow::Result<()> {
    let config = Config::from_file(args.config).await.unwrap_or_default();
    let bind_addr = args
        .bind_addr
        .or(config.forwarder.bind_addr)
        .ok_or_else(|| anyhow::anyhow!("forwarder.bind_addr not set in config or --bind-addr"))?;
    let target_addr = args
        .target_addr
        .or(config.forwarder.target_addr)
        .ok_or_else(|| anyhow::anyhow!("forwarder.target_addr not set in config or --target-addr"))?;
    let endpoint_id = args
        .endpoint_id
        .or(config.forwarder.endpoint_id)
        .ok_or_else(|| anyhow::anyhow!("forwarder.endpoint_id not set in config or --endpoint-id"))?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        cancel_clone.cancel();
    });

    piko::forwarder::serve(bind_addr, target_addr, endpoint_id, cancel).await
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn build_token_verifier(auth: &AuthConfig) -> anyhow::Result<TokenVerifier> {
    let mut builder = TokenVerifier::builder();
    if let Some(audience) = &auth.audience {
        builder = builder.audience(audience.clone());
    }
    if let Some(issuer) = &auth.issuer {
        builder = builder.issuer(issuer.clone());
    }

    if let Some(secret) = &auth.hmac_secret_key {
        builder = builder.hmac_secret(secret.as_bytes());
    } else if let Some(path) = &auth.rsa_public_key {
        let pem = tokio::fs::read(path).await?;
        builder = builder.rsa_public_key_pem(&pem)?;
    } else if let Some(path) = &auth.ecdsa_public_key {
        let pem = tokio::fs::read(path).await?;
        builder = builder.ecdsa_public_key_pem(&pem)?;
    } else if let Some(jwks) = &auth.jwks {
        builder = builder.jwks(jwks.endpoint.clone(), jwks.cache_ttl, jwks.timeout);
    }

    Ok(builder.build())
}
