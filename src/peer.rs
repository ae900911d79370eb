use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::RdtConfig;
use crate::error::RdtError;
use crate::files::index::{parse_index, FileIndex, IndexEntry, INDEX_FILE_ID};
use crate::files::storage::FileStorage;
use crate::protocol::control::ControlMessage;
use crate::protocol::frame::Frame;
use crate::socket::{bind_ephemeral_for, SendSocket};
use crate::transfer::coordinator::ExchangeCoordinator;
use crate::transfer::receiver::{Receiver, ReceiverControl};

/// Source of the other peers' addresses, keyed by peer name
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover_peers(&self) -> anyhow::Result<BTreeMap<String, SocketAddr>>;
}

/// A fixed set of peers, e.g. from the command line
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDiscovery {
    peers: BTreeMap<String, SocketAddr>,
}

impl StaticPeerDiscovery {
    pub fn new(peers: impl IntoIterator<Item=(String, SocketAddr)>) -> StaticPeerDiscovery {
        StaticPeerDiscovery {
            peers: peers.into_iter().collect(),
        }
    }

    /// parse `name=host:port` entries, resolving host names
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> anyhow::Result<StaticPeerDiscovery> {
        let mut peers = BTreeMap::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (name, addr) = entry.split_once('=')
                .ok_or_else(|| anyhow!("peer {:?} is not of the form name=host:port", entry))?;
            let addr = addr.to_socket_addrs()
                .with_context(|| format!("resolving peer {:?}", entry))?
                .next()
                .ok_or_else(|| anyhow!("peer {:?} resolves to no address", entry))?;
            peers.insert(name.to_string(), addr);
        }
        Ok(StaticPeerDiscovery { peers })
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeerDiscovery {
    async fn discover_peers(&self) -> anyhow::Result<BTreeMap<String, SocketAddr>> {
        Ok(self.peers.clone())
    }
}

/// File ids this peer requested that did not arrive yet, with the peer each was requested from.
///
/// File ids are only unique per sharing peer, and inbound sessions are keyed by file id alone,
///  so two fetches of the same id from different peers would be merged into one file.
#[derive(Debug, Default)]
struct PendingFetches {
    fetches: Mutex<FxHashMap<String, (SocketAddr, Instant)>>,
}

impl PendingFetches {
    /// A fetch counts as pending until the file is stored, or until it was requested longer ago
    ///  than `stale_after`. Requesting the same file from the same peer again is a retry and
    ///  always allowed.
    fn begin(&self, file_id: &str, peer_addr: SocketAddr, now: Instant, stale_after: Option<Duration>) -> anyhow::Result<()> {
        let mut fetches = self.fetches.lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some((pending_addr, requested_at)) = fetches.get(file_id) {
            let is_stale = stale_after
                .map(|t| now.saturating_duration_since(*requested_at) >= t)
                .unwrap_or(false);
            if *pending_addr != peer_addr && !is_stale {
                bail!("file {} is already being fetched from {:?}", file_id, pending_addr);
            }
        }
        fetches.insert(file_id.to_string(), (peer_addr, now));
        Ok(())
    }

    fn complete(&self, file_id: &str) {
        self.fetches.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_id);
    }
}

/// Ends pending fetches when their file is stored
struct FetchTrackingStorage {
    inner: Arc<dyn FileStorage>,
    pending: Arc<PendingFetches>,
}

#[async_trait]
impl FileStorage for FetchTrackingStorage {
    async fn persist(&self, file_id: &str, chunks: Vec<String>) -> anyhow::Result<()> {
        self.pending.complete(file_id);
        self.inner.persist(file_id, chunks).await
    }
}

/// A running peer: a receiver listening on the peer's address, and an exchange coordinator
///  sending files that other peers ask for
pub struct Peer {
    config: Arc<RdtConfig>,
    receiver: Arc<Receiver>,
    control: ReceiverControl,
    listener: JoinHandle<anyhow::Result<()>>,
    coordinator: JoinHandle<()>,
    pending: Arc<PendingFetches>,
}

impl Peer {
    pub async fn start(addr: SocketAddr, config: Arc<RdtConfig>, index: Arc<dyn FileIndex>, storage: Arc<dyn FileStorage>) -> anyhow::Result<Peer> {
        let pending = Arc::new(PendingFetches::default());
        let storage = Arc::new(FetchTrackingStorage {
            inner: storage,
            pending: pending.clone(),
        });
        let receiver = Arc::new(Receiver::bind(addr, config.clone(), index.clone(), storage).await?);
        let control = receiver.control();

        let (exchange_send, exchange_recv) = mpsc::unbounded_channel();

        let listener = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.listen(exchange_send).await })
        };
        let coordinator = {
            let coordinator = ExchangeCoordinator::new(config.clone(), index);
            tokio::spawn(async move { coordinator.run(exchange_recv).await })
        };

        info!("peer started on {:?}", receiver.local_addr());
        Ok(Peer {
            config,
            receiver,
            control,
            listener,
            coordinator,
            pending,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receiver.local_addr()
    }

    /// Ask another peer for a file. This returns immediately, the file arrives asynchronously
    ///  and ends up in this peer's storage.
    ///
    /// Fails if the same file id is still being fetched from a different peer.
    pub async fn request_exchange(&self, peer_addr: SocketAddr, file_id: &str) -> anyhow::Result<()> {
        self.pending.begin(file_id, peer_addr, Instant::now(), self.config.session_idle_timeout)?;
        self.receiver.request_exchange(peer_addr, file_id).await;
        Ok(())
    }

    /// Ask another peer for the list of files it shares. This uses a socket of its own, so the
    ///  reply does not interfere with inbound transfers.
    pub async fn request_index(&self, peer_addr: SocketAddr) -> anyhow::Result<Vec<IndexEntry>> {
        let socket = Arc::new(bind_ephemeral_for(peer_addr).await?);
        socket.do_send_packet(peer_addr, &ControlMessage::IndexRequest.encode()).await;

        let deadline = Instant::now() + self.config.index_request_timeout;
        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let (len, from) = match time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(received) => received.map_err(RdtError::Transport)?,
                Err(_) => {
                    return Err(RdtError::ProtocolTimeout(format!("no index from {:?} within {:?}", peer_addr, self.config.index_request_timeout)).into());
                }
            };
            if from != peer_addr {
                debug!("datagram from {:?} while waiting for index from {:?} - ignoring", from, peer_addr);
                continue;
            }

            match Frame::decode(&buf[..len]) {
                Ok(frame) if frame.file_id == INDEX_FILE_ID => {
                    let entries = parse_index(&frame.payload)?;
                    debug!("{:?} shares {} files", peer_addr, entries.len());
                    return Ok(entries);
                }
                Ok(frame) => debug!("unexpected frame for file {} while waiting for index - ignoring", frame.file_id),
                Err(e) => warn!("dropping datagram while waiting for index: {}", e),
            }
        }
    }

    /// Stop receiving, then wait for outbound transfers that are still running
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down peer on {:?}", self.local_addr());
        self.control.stop();

        let listen_result = self.listener.await
            .context("receiver task failed")?;
        // the listener owned the exchange queue, so the coordinator finishes on its own now
        self.coordinator.await
            .context("coordinator task failed")?;
        listen_result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::net::UdpSocket;
    use crate::files::index::SharedFileIndex;
    use crate::test_util::{loopback_config, MemoryStorage};
    use super::*;

    const FIRST: ([u8; 4], u16) = ([10, 0, 0, 1], 4000);
    const SECOND: ([u8; 4], u16) = ([10, 0, 0, 2], 4000);

    async fn start_peer(index: SharedFileIndex, storage: Arc<MemoryStorage>) -> Peer {
        Peer::start("127.0.0.1:0".parse().unwrap(), Arc::new(loopback_config()), Arc::new(index), storage).await.unwrap()
    }

    #[tokio::test]
    async fn test_exchange_between_peers() {
        let dir = std::env::temp_dir().join(format!("rdt_share_peer_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let content = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam.";
        tokio::fs::write(dir.join("lorem.txt"), content).await.unwrap();

        let sharing = start_peer(SharedFileIndex::scan_directory(&dir).await.unwrap(), Arc::new(MemoryStorage::new())).await;
        let downloads = Arc::new(MemoryStorage::new());
        let requesting = start_peer(SharedFileIndex::new(), downloads.clone()).await;

        let index = requesting.request_index(sharing.local_addr()).await.unwrap();
        assert_eq!(index, vec![IndexEntry { file_id: "001".to_string(), file_name: "lorem.txt".to_string() }]);

        requesting.request_exchange(sharing.local_addr(), "001").await.unwrap();

        time::timeout(Duration::from_secs(10), async {
            while downloads.get("001").is_none() {
                time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
        assert_eq!(downloads.get("001").unwrap(), content);

        // the fetch is complete, so the same file id can be fetched from somewhere else
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        requesting.request_exchange(other.local_addr().unwrap(), "001").await.unwrap();

        sharing.shutdown().await.unwrap();
        requesting.shutdown().await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_index_request_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = start_peer(SharedFileIndex::new(), Arc::new(MemoryStorage::new())).await;

        let err = peer.request_index(silent.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RdtError>(), Some(RdtError::ProtocolTimeout(_))));

        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_file_id_from_second_peer_is_refused() {
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = start_peer(SharedFileIndex::new(), Arc::new(MemoryStorage::new())).await;

        peer.request_exchange(first.local_addr().unwrap(), "001").await.unwrap();
        peer.request_exchange(first.local_addr().unwrap(), "001").await.unwrap();
        assert!(peer.request_exchange(second.local_addr().unwrap(), "001").await.is_err());
        peer.request_exchange(second.local_addr().unwrap(), "002").await.unwrap();

        peer.shutdown().await.unwrap();
    }

    #[rstest]
    #[case::retry(FIRST, Some(10), 1, true)]
    #[case::other_peer(SECOND, Some(10), 1, false)]
    #[case::other_peer_after_stale(SECOND, Some(10), 10, true)]
    #[case::other_peer_never_stale(SECOND, None, 1_000_000, false)]
    fn test_pending_fetches(#[case] peer_addr: ([u8; 4], u16), #[case] stale_secs: Option<u64>, #[case] elapsed_secs: u64, #[case] expected_ok: bool) {
        let pending = PendingFetches::default();
        let start = Instant::now();
        let stale_after = stale_secs.map(Duration::from_secs);

        pending.begin("001", FIRST.into(), start, stale_after).unwrap();
        let result = pending.begin("001", peer_addr.into(), start + Duration::from_secs(elapsed_secs), stale_after);
        assert_eq!(result.is_ok(), expected_ok);
    }

    #[test]
    fn test_completed_fetch_is_no_longer_pending() {
        let pending = PendingFetches::default();
        let now = Instant::now();

        pending.begin("001", FIRST.into(), now, None).unwrap();
        pending.complete("001");
        pending.begin("001", SECOND.into(), now, None).unwrap();
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = StaticPeerDiscovery::parse(&["alice=127.0.0.1:9000", "bob=127.0.0.1:9001"]).unwrap();
        let peers = discovery.discover_peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers["bob"], "127.0.0.1:9001".parse::<SocketAddr>().unwrap());

        assert!(StaticPeerDiscovery::parse(&["no-separator"]).is_err());
    }
}
