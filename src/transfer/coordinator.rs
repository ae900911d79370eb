use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::RdtConfig;
use crate::files::index::FileIndex;
use crate::transfer::sender::{Sender, TransferOutcome};

/// A remote peer asked for a file. `peer_addr` is where the request actually came from, and
///  where the file goes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExchangeRequest {
    pub file_id: String,
    pub peer_addr: SocketAddr,
}

/// Turns exchange requests into outbound transfers, each with its own [Sender] in its own task
pub struct ExchangeCoordinator {
    config: Arc<RdtConfig>,
    index: Arc<dyn FileIndex>,
}

impl ExchangeCoordinator {
    pub fn new(config: Arc<RdtConfig>, index: Arc<dyn FileIndex>) -> ExchangeCoordinator {
        ExchangeCoordinator {
            config,
            index,
        }
    }

    /// Runs until all senders of the queue are dropped, and then until all transfers started
    ///  so far have finished
    pub async fn run(&self, mut queue: mpsc::UnboundedReceiver<ExchangeRequest>) {
        info!("exchange coordinator started");
        let mut transfers = JoinSet::new();

        loop {
            tokio::select! {
                request = queue.recv() => {
                    match request {
                        Some(request) => self.start_transfer(&mut transfers, request),
                        None => break,
                    }
                }
                Some(finished) = transfers.join_next() => {
                    Self::on_transfer_finished(finished);
                }
            }
        }

        debug!("exchange queue closed - waiting for {} transfers", transfers.len());
        while let Some(finished) = transfers.join_next().await {
            Self::on_transfer_finished(finished);
        }
        info!("exchange coordinator stopped");
    }

    fn start_transfer(&self, transfers: &mut JoinSet<anyhow::Result<TransferOutcome>>, request: ExchangeRequest) {
        let path = match self.index.lookup_path(&request.file_id) {
            Some(path) => path,
            None => {
                warn!("{:?} requested unknown file {} - ignoring", request.peer_addr, request.file_id);
                return;
            }
        };

        info!("sending file {} ({:?}) to {:?}", request.file_id, path, request.peer_addr);
        let config = self.config.clone();
        transfers.spawn(async move {
            let mut sender = Sender::bind(config, &request.file_id, request.peer_addr).await?;
            sender.send_file(&path).await
        });
    }

    fn on_transfer_finished(finished: Result<anyhow::Result<TransferOutcome>, tokio::task::JoinError>) {
        match finished {
            Ok(Ok(outcome)) => debug!("transfer finished: {:?}", outcome),
            Ok(Err(e)) => error!("transfer failed: {:#}", e),
            Err(e) => error!("transfer task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use crate::files::index::MockFileIndex;
    use crate::protocol::frame::Frame;
    use crate::test_util::loopback_config;
    use super::*;

    #[tokio::test]
    async fn test_unknown_file_is_skipped() {
        let mut index = MockFileIndex::new();
        index.expect_lookup_path()
            .once()
            .return_const(None);

        let coordinator = ExchangeCoordinator::new(Arc::new(loopback_config()), Arc::new(index));
        let (send, recv) = mpsc::unbounded_channel();
        send.send(ExchangeRequest { file_id: "404".to_string(), peer_addr: "127.0.0.1:9".parse().unwrap() }).unwrap();
        drop(send);

        tokio::time::timeout(Duration::from_secs(5), coordinator.run(recv)).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_starts_transfer() {
        let dir = std::env::temp_dir().join(format!("rdt_share_coordinator_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("greeting.txt");
        tokio::fs::write(&path, "hi").await.unwrap();

        let mut index = MockFileIndex::new();
        index.expect_lookup_path()
            .withf(|file_id| file_id == "001")
            .return_const(Some(path.clone()));

        let mut config = loopback_config();
        config.retransmit_timeout = Duration::from_secs(2);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let coordinator = ExchangeCoordinator::new(Arc::new(config), Arc::new(index));
        let (send, recv) = mpsc::unbounded_channel();
        send.send(ExchangeRequest { file_id: "001".to_string(), peer_addr: peer.local_addr().unwrap() }).unwrap();

        let coordinator_task = tokio::spawn(async move { coordinator.run(recv).await });

        let mut buf = [0u8; 1024];
        let mut frames = Vec::new();
        loop {
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            let frame = Frame::decode(&buf[..len]).unwrap();
            peer.send_to(&Frame::ack(&frame.file_id, frame.seq).encode(), from).await.unwrap();
            let done = frame.is_terminator();
            frames.push(frame);
            if done {
                break;
            }
        }
        assert_eq!(frames, vec![Frame::data("001", 1, "hi"), Frame::fin("001")]);

        drop(send);
        tokio::time::timeout(Duration::from_secs(5), coordinator_task).await.unwrap().unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
