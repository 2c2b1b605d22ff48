use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ringmesh::{
    serve_tcp, Dialer, Keypair, LocalIdentity, MemoryNetwork, Node, OverlayConfig, RendezvousConfig,
    RendezvousServer, TcpDialer,
};

#[derive(Parser, Debug)]
#[command(name = "ringmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a rendezvous server speaking newline-delimited JSON over TCP.
    Rendezvous {
        #[arg(short, long, default_value = "0.0.0.0:7600")]
        bind: SocketAddr,

        #[arg(long, default_value_t = ringmesh::config::DEFAULT_MAX_SOCKETS)]
        max_sockets: usize,

        #[arg(long, default_value = "30")]
        probation_secs: u64,
    },
    /// Run N in-process nodes over the in-memory transport.
    Simulate {
        #[arg(short, long, default_value = "10")]
        nodes: usize,

        /// Remote rendezvous address; an embedded server is used if omitted.
        #[arg(short, long)]
        rendezvous: Option<String>,

        #[arg(long, default_value_t = ringmesh::config::DEFAULT_FLOOD_SIZE)]
        flood_size: usize,

        /// Derive identities from this seed for a reproducible ring.
        #[arg(long)]
        seed: Option<String>,

        #[arg(short, long, default_value = "10")]
        status_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Rendezvous {
            bind,
            max_sockets,
            probation_secs,
        } => {
            let config = RendezvousConfig {
                max_sockets,
                probation_timeout: Duration::from_secs(probation_secs),
                ..RendezvousConfig::default()
            };
            let server = RendezvousServer::spawn(config);
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {}", bind))?;
            tokio::select! {
                result = serve_tcp(server.clone(), listener) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                }
            }
            server.shutdown().await;
        }
        Command::Simulate {
            nodes,
            rendezvous,
            flood_size,
            seed,
            status_interval,
        } => {
            simulate(nodes, rendezvous, flood_size, seed, status_interval).await?;
        }
    }

    Ok(())
}

async fn simulate(
    count: usize,
    rendezvous: Option<String>,
    flood_size: usize,
    seed: Option<String>,
    status_interval: u64,
) -> Result<()> {
    let dialer: Arc<dyn Dialer> = match rendezvous {
        Some(addr) => Arc::new(TcpDialer::new(addr)),
        None => Arc::new(RendezvousServer::spawn(RendezvousConfig::default())),
    };
    let network = MemoryNetwork::new();
    let config = OverlayConfig {
        flood_size,
        ..OverlayConfig::default()
    };

    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let identity = match &seed {
            Some(seed) => LocalIdentity::from_keypair(Keypair::from_seed(&format!("{}-{}", seed, i))),
            None => LocalIdentity::generate(),
        };
        let node = Node::spawn(identity.clone(), network.transport(identity.id), config.clone());
        if let Err(e) = node.connect(dialer.clone()).await {
            warn!(node = %identity.id.short_name(), error = %e, "Connect failed");
        }
        nodes.push(node);
        // Give the previous newcomer a moment before pairing the next one.
        time::sleep(Duration::from_millis(200)).await;
    }
    info!(nodes = nodes.len(), "Simulation started");

    let mut interval = time::interval(Duration::from_secs(status_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let mut full = 0;
                let mut golden = 0;
                let mut pending = 0;
                for node in &nodes {
                    if let Ok(status) = node.status().await {
                        if status.flood_is_full(flood_size) {
                            full += 1;
                        }
                        golden += status.golden;
                        pending += status.pending_envelopes;
                    }
                }
                info!(
                    nodes = nodes.len(),
                    full_floods = full,
                    golden_links = golden,
                    pending_envelopes = pending,
                    live_endpoints = network.live_endpoints(),
                    delivered = network.delivered(),
                    "simulation status"
                );
            }
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
