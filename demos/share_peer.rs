use clap::Parser;
use clap_derive::Parser;
use rdt_share::config::RdtConfig;
use rdt_share::files::index::{FileIndex, SharedFileIndex};
use rdt_share::files::storage::DirectoryStorage;
use rdt_share::peer::{Peer, PeerDiscovery, StaticPeerDiscovery};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::anyhow;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    listen_address: String,
    shared_dir: PathBuf,
    download_dir: PathBuf,

    /// other peers as name=host:port
    #[clap(long)]
    peer: Vec<String>,

    /// print the index of the named peer
    #[clap(long)]
    index: Option<String>,

    /// fetch a file from a peer: --fetch <peer name> <file id>
    #[clap(long, num_args = 2, value_names = ["PEER", "FILE_ID"])]
    fetch: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let listen_address: SocketAddr = args.listen_address.parse()?;
    let peers = StaticPeerDiscovery::parse(&args.peer)?
        .discover_peers().await?;

    let index = Arc::new(SharedFileIndex::scan_directory(&args.shared_dir).await?);
    for entry in index.entries() {
        info!("sharing {}: {}", entry.file_id, entry.file_name);
    }

    let config = Arc::new(RdtConfig::new());
    let peer = Peer::start(listen_address, config, index, Arc::new(DirectoryStorage::new(&args.download_dir))).await?;

    let lookup = |name: &str| peers.get(name)
        .copied()
        .ok_or_else(|| anyhow!("unknown peer {:?}", name));

    if let Some(name) = &args.index {
        for entry in peer.request_index(lookup(name)?).await? {
            println!("{}:{}", entry.file_id, entry.file_name);
        }
    }

    if let [name, file_id] = args.fetch.as_slice() {
        peer.request_exchange(lookup(name)?, file_id).await?;
        info!("requested file {} from {} - it will appear in {:?}", file_id, name, args.download_dir);
    }

    tokio::signal::ctrl_c().await?;
    peer.shutdown().await
}
