use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use retrieval_gateway::config::{DEFAULT_ADMIN_BIND_ADDR, DEFAULT_BIND_ADDR};
use retrieval_gateway::protocols::Registrar;
use retrieval_gateway::{Gateway, GatewayConfig, KeyVersion, Keypair, NodeId, NodeKind, StaticRegistrar};

#[derive(Parser, Debug)]
#[command(name = "retrieval-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_BIND_ADDR)]
    bind: SocketAddr,

    /// Listener for key installation, enrollment and reputation admin.
    #[arg(long, default_value = DEFAULT_ADMIN_BIND_ADDR)]
    admin_bind: SocketAddr,

    /// Gateway id as hex. Defaults to a hash of the signing key.
    #[arg(short, long)]
    gateway_id: Option<NodeId>,

    /// JSON file listing registered gateways and providers.
    #[arg(short, long, value_name = "FILE")]
    registrar_file: Option<PathBuf>,

    /// Seconds between closest-gateway refreshes.
    #[arg(long, default_value = "60")]
    refresh_interval: u64,

    /// Hex-encoded Ed25519 private key. Without it the gateway waits for an
    /// admin key-installation message.
    #[arg(long)]
    private_key: Option<String>,

    #[arg(long, default_value = "1")]
    key_version: u32,

    #[arg(long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = args
        .private_key
        .as_deref()
        .map(Keypair::from_secret_hex)
        .transpose()
        .context("invalid --private-key")?;

    let gateway_id = match (args.gateway_id, &keypair) {
        (Some(id), _) => id,
        (None, Some(keypair)) => NodeId::derive(keypair.public_key().to_hex().as_bytes()),
        (None, None) => anyhow::bail!("--gateway-id is required when no --private-key is given"),
    };

    let mut config = GatewayConfig::default()
        .with_gateway_id(gateway_id)
        .with_bind_addr(args.bind)
        .with_admin_bind_addr(args.admin_bind);
    config.refresh_interval = Duration::from_secs(args.refresh_interval.max(1));

    let gateway = Gateway::bind(config).await?;
    info!(
        gateway = %gateway.gateway_id(),
        addr = %gateway.local_addr(),
        admin_addr = %gateway.admin_addr(),
        "gateway ready"
    );

    if let Some(keypair) = keypair {
        gateway.install_key(keypair, KeyVersion(args.key_version)).await;
    }

    let registrar: Option<Arc<dyn Registrar>> = args
        .registrar_file
        .map(|path| Arc::new(StaticRegistrar::new(path)) as Arc<dyn Registrar>);

    if let Some(registrar) = &registrar {
        match gateway.bootstrap(registrar.as_ref()).await {
            Ok(()) => {
                gateway.refresh_offers().await;
            }
            Err(e) => {
                warn!(error = %e, "bootstrap failed");
            }
        }
    }

    gateway.start_background_tasks(registrar).await;

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let ctx = gateway.context();
                info!(
                    gateways = ctx.registry.len(NodeKind::Gateway).await,
                    providers = ctx.registry.len(NodeKind::Provider).await,
                    closest = ctx.closest.snapshot().await.len(),
                    cached_cids = ctx.offers.cid_count().await,
                    pooled = ctx.pool.len().await,
                    key_installed = ctx.keys.is_installed().await,
                    "status snapshot"
                );
            }
        }
    }

    gateway.shutdown().await;
    Ok(())
}
