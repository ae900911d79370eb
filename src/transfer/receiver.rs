use std::future::pending;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, trace_span, warn, Instrument};

use crate::config::RdtConfig;
use crate::error::RdtError;
use crate::files::index::{render_index, FileIndex, INDEX_FILE_ID};
use crate::files::storage::FileStorage;
use crate::protocol::control::ControlMessage;
use crate::protocol::frame::{decode_frame, split_datagram, verify, Frame};
use crate::socket::SendSocket;
use crate::transfer::coordinator::ExchangeRequest;
use crate::transfer::session::{Placement, SessionTable};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ListenMode {
    Unbounded,
    IdleTimeout(Duration),
    Stopped,
}

/// Handle for ending a [Receiver]'s listen loop from the outside
#[derive(Clone)]
pub struct ReceiverControl {
    mode: Arc<watch::Sender<ListenMode>>,
}

impl ReceiverControl {
    fn new() -> ReceiverControl {
        let (mode, _) = watch::channel(ListenMode::Unbounded);
        ReceiverControl {
            mode: Arc::new(mode),
        }
    }

    /// The listen loop returns as soon as it sees this. Sessions that are still in flight at
    ///  that point are discarded.
    pub fn stop(&self) {
        self.mode.send_replace(ListenMode::Stopped);
    }

    /// the listen loop returns when no datagram arrives for `timeout`
    pub fn arm_idle_timeout(&self, timeout: Duration) {
        self.mode.send_if_modified(|mode| {
            if *mode == ListenMode::Stopped {
                return false;
            }
            *mode = ListenMode::IdleTimeout(timeout);
            true
        });
    }
}

/// The inbound side of a peer. It owns the peer's one well-known socket, and every datagram
///  arriving there is one of
///  * an exchange request, which is handed on to the exchange coordinator
///  * an index request, which is answered directly
///  * a data frame of some inbound transfer, which is acknowledged and buffered in the session
///    for its file id - or, for the terminator, finalizes that session
pub struct Receiver {
    config: Arc<RdtConfig>,
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    index: Arc<dyn FileIndex>,
    storage: Arc<dyn FileStorage>,
    control: ReceiverControl,
}

impl Receiver {
    pub async fn bind(addr: SocketAddr, config: Arc<RdtConfig>, index: Arc<dyn FileIndex>, storage: Arc<dyn FileStorage>) -> anyhow::Result<Receiver> {
        config.validate()?;

        let socket = UdpSocket::bind(addr).await
            .with_context(|| format!("binding receiver socket to {:?}", addr))?;
        info!("bound receiver socket to {:?}", socket.local_addr()?);
        Ok(Receiver::from_socket(config, Arc::new(socket), index, storage))
    }

    pub fn from_socket(config: Arc<RdtConfig>, socket: Arc<UdpSocket>, index: Arc<dyn FileIndex>, storage: Arc<dyn FileStorage>) -> Receiver {
        let send_socket = Arc::new(socket.clone());
        Receiver::new(config, socket, send_socket, index, storage)
    }

    /// `send_socket` is where ACKs, index replies and exchange requests go out - normally the
    ///  same socket that is read
    pub fn new(config: Arc<RdtConfig>, socket: Arc<UdpSocket>, send_socket: Arc<dyn SendSocket>, index: Arc<dyn FileIndex>, storage: Arc<dyn FileStorage>) -> Receiver {
        Receiver {
            config,
            socket,
            send_socket,
            index,
            storage,
            control: ReceiverControl::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    pub fn control(&self) -> ReceiverControl {
        self.control.clone()
    }

    /// Ask a remote peer to send a file. The request goes out from this receiver's socket, so
    ///  the remote peer sends the file here.
    pub async fn request_exchange(&self, peer_addr: SocketAddr, file_id: &str) {
        info!("requesting file {} from {:?}", file_id, peer_addr);
        let msg = ControlMessage::exchange_request(file_id, self.local_addr());
        self.send_socket.do_send_packet(peer_addr, &msg.encode()).await;
    }

    /// Runs until the socket fails or the loop is ended via [ReceiverControl]. Only a socket
    ///  failure is returned as an error: anything wrong with an individual datagram is logged
    ///  and the datagram dropped.
    pub async fn listen(&self, exchange_queue: mpsc::UnboundedSender<ExchangeRequest>) -> anyhow::Result<()> {
        info!("listening on {:?}", self.local_addr());

        let mut sessions = SessionTable::new(&self.config);
        let mut mode = self.control.mode.subscribe();
        let mut buf = vec![0u8; self.config.max_datagram_size];

        loop {
            let idle_deadline = match *mode.borrow_and_update() {
                ListenMode::Stopped => {
                    info!("receiver stopped with {} incomplete transfers", sessions.len());
                    return Ok(());
                }
                ListenMode::IdleTimeout(timeout) => Some((Instant::now() + timeout, timeout)),
                ListenMode::Unbounded => None,
            };

            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            let span = trace_span!("datagram", %from);
                            self.handle_datagram(&mut sessions, &buf[..len], from, &exchange_queue)
                                .instrument(span)
                                .await;
                        }
                        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                            // an ICMP error for an ACK we sent earlier
                            debug!("peer unreachable: {}", e);
                        }
                        Err(e) => {
                            error!("socket error, terminating receiver: {}", e);
                            return Err(RdtError::Transport(e)).context("receiving on the shared socket");
                        }
                    }
                }
                Ok(()) = mode.changed() => {}
                _ = Self::sleep_until(idle_deadline) => {
                    info!("no datagram within {:?} - stopping receiver", idle_deadline.map(|(_, t)| t).unwrap_or_default());
                    return Ok(());
                }
            }
        }
    }

    async fn sleep_until(deadline: Option<(Instant, Duration)>) {
        match deadline {
            Some((deadline, _)) => time::sleep_until(deadline).await,
            None => pending().await,
        }
    }

    pub(crate) async fn handle_datagram(&self, sessions: &mut SessionTable, datagram: &[u8], from: SocketAddr, exchange_queue: &mpsc::UnboundedSender<ExchangeRequest>) {
        trace!("received {} bytes", datagram.len());

        let (checksum, body) = match split_datagram(datagram) {
            Ok(x) => x,
            Err(e) => {
                warn!("dropping datagram from {:?}: {}", from, e);
                return;
            }
        };
        if !verify(checksum, body) {
            warn!("dropping datagram from {:?}: {}", from, RdtError::Integrity);
            return;
        }

        match ControlMessage::classify(body) {
            Some(Ok(ControlMessage::ExchangeRequest { file_id, claimed_addr })) => {
                self.on_exchange_request(file_id, &claimed_addr, from, exchange_queue);
                return;
            }
            Some(Ok(ControlMessage::IndexRequest)) => {
                self.on_index_request(from).await;
                return;
            }
            Some(Err(e)) => {
                warn!("dropping control message from {:?}: {}", from, e);
                return;
            }
            None => {}
        }

        let frame = match decode_frame(body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping datagram from {:?}: {}", from, e);
                return;
            }
        };

        // the data passed the checksum, so it is acknowledged whatever happens to it next
        self.send_socket.do_send_packet(from, &Frame::ack(&frame.file_id, frame.seq).encode()).await;

        if frame.is_terminator() {
            self.finalize(sessions, &frame.file_id).await;
            return;
        }

        match sessions.on_chunk(&frame.file_id, frame.seq, frame.payload, Instant::now()) {
            Placement::Duplicate => debug!("duplicate of #{} for file {} - dropping", frame.seq, frame.file_id),
            placement => trace!("#{} for file {}: {:?}", frame.seq, frame.file_id, placement),
        }
    }

    fn on_exchange_request(&self, file_id: String, claimed_addr: &str, from: SocketAddr, exchange_queue: &mpsc::UnboundedSender<ExchangeRequest>) {
        if claimed_addr != from.to_string() {
            debug!("exchange request from {:?} claims to come from {:?} - replying to the actual sender", from, claimed_addr);
        }
        debug!("exchange request for file {} from {:?}", file_id, from);

        if exchange_queue.send(ExchangeRequest { file_id, peer_addr: from }).is_err() {
            warn!("exchange coordinator is gone - dropping exchange request from {:?}", from);
        }
    }

    async fn on_index_request(&self, from: SocketAddr) {
        let entries = self.index.entries();
        debug!("sending index with {} entries to {:?}", entries.len(), from);

        let reply = Frame::data(INDEX_FILE_ID, 0, &render_index(&entries)).encode();
        if reply.len() > self.config.max_datagram_size {
            warn!("index reply of {} bytes exceeds the datagram size of {} - the requester may not be able to read it", reply.len(), self.config.max_datagram_size);
        }
        self.send_socket.do_send_packet(from, &reply).await;
    }

    async fn finalize(&self, sessions: &mut SessionTable, file_id: &str) {
        let chunks = match sessions.finalize(file_id) {
            Some(chunks) => chunks,
            None => {
                debug!("terminator for file {} - nothing to store", file_id);
                return;
            }
        };

        if let Err(e) = self.storage.persist(file_id, chunks).await {
            error!("failed to store file {}: {:#}", file_id, e);
        }
    }
}
