use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use swarmseed::config::{DhtConfig, SessionConfig, TrackerConfig};
use swarmseed::session::Session;

fn parse_info_hash(s: &str) -> Result<[u8; 20]> {
    let bytes = hex::decode(s).context("info-hash must be hex")?;
    if bytes.len() != 20 {
        bail!("info-hash must be 40 hex characters (20 bytes)");
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[derive(Parser, Debug)]
#[command(name = "swarmseed")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Info-hashes to announce, as hex.
    #[arg(required = true, value_parser = parse_info_hash)]
    info_hashes: Vec<[u8; 20]>,

    /// Port peers should connect to.
    #[arg(short, long, default_value = "6881")]
    port: u16,

    /// Tracker announce URL (http, https or udp). May be repeated.
    #[arg(short, long = "tracker", value_name = "URL")]
    trackers: Vec<String>,

    /// Local address of the DHT node.
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// DHT router as host:port. Replaces the built-in list when given.
    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Vec<String>,

    /// Run trackers only.
    #[arg(long)]
    no_dht: bool,

    /// Use the UDP tracker connect handshake.
    #[arg(long)]
    udp_connect: bool,

    /// Seconds between announce rounds.
    #[arg(short, long, default_value = "1800")]
    interval: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let dht = (!self.no_dht).then(|| {
            let mut dht = DhtConfig {
                bind_addr: self.bind,
                ..DhtConfig::default()
            };
            if !self.bootstrap.is_empty() {
                dht.bootstrap_nodes = self.bootstrap.clone();
            }
            dht
        });

        SessionConfig {
            dht,
            tracker: TrackerConfig {
                udp_connect: self.udp_connect,
                ..TrackerConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let session = Session::new(args.session_config())
        .await
        .context("failed to start session")?;

    if let Some(dht) = session.dht() {
        let addr = dht.node().local_addr().context("DHT socket has no address")?;
        info!("DHT node {} listening on {}", dht.node().local_id(), addr);
    }

    for info_hash in &args.info_hashes {
        session
            .start_discovery(*info_hash, args.port, &args.trackers)
            .await
            .with_context(|| format!("failed to start discovery for {}", hex::encode(info_hash)))?;
    }

    let mut interval = time::interval(Duration::from_secs(args.interval.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                for info_hash in &args.info_hashes {
                    match session.announce(*info_hash, 0, 0, 0).await {
                        Ok(true) => {}
                        Ok(false) => warn!(info_hash = %hex::encode(info_hash), "no tracker accepted the announce"),
                        Err(e) => warn!(error = %e, "announce failed"),
                    }

                    let stats = session.get_stats(info_hash).unwrap_or_default();
                    info!(
                        info_hash = %hex::encode(info_hash),
                        peers = session.get_peers(info_hash).len(),
                        seeders = stats.seeders,
                        leechers = stats.leechers,
                        interval = stats.interval,
                        "swarm snapshot"
                    );
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
