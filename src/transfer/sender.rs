use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Context};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::RdtConfig;
use crate::error::RdtError;
use crate::protocol::frame::{Frame, TERMINATOR_SEQ};
use crate::socket::{bind_ephemeral_for, SendSocket};
use crate::transfer::send_window::{AckOutcome, SendWindow};

/// sequence number of a file's first chunk
pub const FIRST_SEQ: i32 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferOutcome {
    /// all chunks and the terminator were acknowledged
    Completed,
    /// All chunks were acknowledged, but the terminator's ACK never came. The receiver may
    ///  well have completed the file: a lost FIN and a lost FIN-ACK look the same from here.
    FinUnacknowledged,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SenderState {
    Chunking,
    WindowedSend,
    FinWait,
    Done,
}

/// Split text into chunks of `chunk_size` characters. Chunks never split a character, so each
///  of them is valid UTF-8 on its own.
pub fn chunk_text(content: &str, chunk_size: usize) -> Vec<String> {
    let chars = content.chars().collect::<Vec<_>>();
    chars.chunks(chunk_size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// The sending side of a single file transfer, talking to one receiver from its own socket.
///
/// Packets go out in a selective-repeat window covering a fixed fraction of the file: the window
///  starts at the lowest unacknowledged packet, every packet in it is sent once per pass, and
///  only packets whose individual timer expires are sent again. After all packets are
///  acknowledged, a terminator frame is sent until it is acknowledged or the retry budget is used
///  up.
pub struct Sender {
    config: Arc<RdtConfig>,
    socket: Arc<UdpSocket>,
    file_id: String,
    destination: SocketAddr,
    state: SenderState,
}

impl Sender {
    pub async fn bind(config: Arc<RdtConfig>, file_id: &str, destination: SocketAddr) -> anyhow::Result<Sender> {
        let socket = bind_ephemeral_for(destination).await
            .context("binding sender socket")?;
        Ok(Sender::from_socket(config, Arc::new(socket), file_id, destination))
    }

    pub fn from_socket(config: Arc<RdtConfig>, socket: Arc<UdpSocket>, file_id: &str, destination: SocketAddr) -> Sender {
        Sender {
            config,
            socket,
            file_id: file_id.to_string(),
            destination,
            state: SenderState::Chunking,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        SendSocket::local_addr(&self.socket)
    }

    pub async fn send_file(&mut self, path: &Path) -> anyhow::Result<TransferOutcome> {
        self.state = SenderState::Chunking;
        let content = tokio::fs::read_to_string(path).await
            .with_context(|| format!("reading {:?} for transfer of file {}", path, self.file_id))?;

        let chunks = chunk_text(&content, self.config.chunk_size);
        debug!("{:?}: {} characters in {} chunks", path, content.chars().count(), chunks.len());
        self.send_chunks(chunks).await
    }

    pub async fn send_chunks(&mut self, chunks: Vec<String>) -> anyhow::Result<TransferOutcome> {
        let span = info_span!("transfer", file_id = %self.file_id, destination = %self.destination);
        let result = self.do_send_chunks(chunks)
            .instrument(span)
            .await;
        self.state = SenderState::Done;
        result
    }

    async fn do_send_chunks(&mut self, chunks: Vec<String>) -> anyhow::Result<TransferOutcome> {
        if chunks.len() > (i32::MAX - FIRST_SEQ) as usize {
            bail!("{} chunks exceed the sequence number range", chunks.len());
        }

        info!("sending {} chunks", chunks.len());
        let start = Instant::now();

        self.state = SenderState::WindowedSend;
        let mut window = SendWindow::new(&self.file_id, FIRST_SEQ, &chunks);
        let window_size = self.config.window_size(window.len());
        let (retransmit_send, mut retransmit_recv) = mpsc::unbounded_channel();

        let mut buf = vec![0u8; self.config.max_datagram_size];

        while let Some(range) = window.current_window(window_size) {
            trace!("window #{}..#{}", window.seq_of(range.start), window.seq_of(range.end));

            for idx in range.clone() {
                if window.is_sent(idx) || window.is_acknowledged(idx) {
                    continue;
                }
                trace!("sending #{}", window.seq_of(idx));
                self.socket.do_send_packet(self.destination, window.datagram(idx)).await;
                window.mark_sent(idx, self.config.retransmit_timeout, retransmit_send.clone());
                time::sleep(self.config.send_delay).await;
            }

            self.await_acks(&mut window, range, &mut retransmit_recv, &mut buf).await?;
        }
        drop(window);
        debug!("all {} chunks acknowledged after {:?}", chunks.len(), start.elapsed());

        self.state = SenderState::FinWait;
        let outcome = self.fin_handshake(&mut buf).await?;
        match outcome {
            TransferOutcome::Completed => info!("transfer completed in {:?}", start.elapsed()),
            TransferOutcome::FinUnacknowledged => warn!("{}", RdtError::ProtocolTimeout(format!("terminator not acknowledged after {} attempts", self.config.fin_retries))),
        }
        Ok(outcome)
    }

    /// Process ACKs and retransmission requests until the window can move (i.e. its first
    ///  packet is acknowledged) or no ACK arrived for `ack_wait`.
    async fn await_acks(&self, window: &mut SendWindow, range: Range<usize>, retransmit: &mut mpsc::UnboundedReceiver<usize>, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut deadline = Instant::now() + self.config.ack_wait;

        while !window.is_acknowledged(range.start) {
            select! {
                received = self.socket.recv_from(buf) => {
                    let Some(len) = self.check_received(received)? else { continue; };
                    deadline = Instant::now() + self.config.ack_wait;

                    if let Some(seq) = self.parse_ack(&buf[..len]) {
                        match window.on_ack(seq) {
                            AckOutcome::Acknowledged => trace!("#{} acknowledged", seq),
                            AckOutcome::Duplicate => trace!("duplicate ACK for #{}", seq),
                            AckOutcome::OutOfRange => debug!("ACK for #{} is outside the transfer - ignoring", seq),
                        }
                    }
                }
                Some(idx) = retransmit.recv() => {
                    // the timer may have fired just before the ACK arrived
                    if !window.is_acknowledged(idx) {
                        debug!("no ACK for #{} within {:?} - retransmitting", window.seq_of(idx), self.config.retransmit_timeout);
                        self.socket.do_send_packet(self.destination, window.datagram(idx)).await;
                    }
                }
                _ = time::sleep_until(deadline) => {
                    trace!("no ACK within {:?}", self.config.ack_wait);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn fin_handshake(&self, buf: &mut [u8]) -> anyhow::Result<TransferOutcome> {
        let fin = Frame::fin(&self.file_id).encode();

        for attempt in 1..=self.config.fin_retries {
            debug!("sending terminator (attempt {} of {})", attempt, self.config.fin_retries);
            self.socket.do_send_packet(self.destination, &fin).await;

            let deadline = Instant::now() + self.config.fin_timeout;
            loop {
                select! {
                    received = self.socket.recv_from(buf) => {
                        let Some(len) = self.check_received(received)? else { continue; };
                        if self.parse_ack(&buf[..len]) == Some(TERMINATOR_SEQ) {
                            return Ok(TransferOutcome::Completed);
                        }
                    }
                    _ = time::sleep_until(deadline) => {
                        break;
                    }
                }
            }
        }
        Ok(TransferOutcome::FinUnacknowledged)
    }

    /// `None` for datagrams that should be skipped, an error if the socket failed
    fn check_received(&self, received: std::io::Result<(usize, SocketAddr)>) -> anyhow::Result<Option<usize>> {
        match received {
            Ok((len, from)) => {
                if from != self.destination {
                    debug!("datagram from {:?} rather than {:?} - ignoring", from, self.destination);
                    return Ok(None);
                }
                Ok(Some(len))
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                // an ICMP error for an earlier datagram; retransmission deals with it
                debug!("destination unreachable: {}", e);
                Ok(None)
            }
            Err(e) => {
                error!("socket error: {}", e);
                Err(RdtError::Transport(e).into())
            }
        }
    }

    /// the acknowledged sequence number if the datagram is a valid ACK for this transfer
    fn parse_ack(&self, datagram: &[u8]) -> Option<i32> {
        match Frame::decode(datagram) {
            Ok(frame) if frame.file_id != self.file_id => {
                debug!("ACK for file {} rather than {} - ignoring", frame.file_id, self.file_id);
                None
            }
            Ok(frame) if !frame.is_ack() => {
                debug!("non-ACK payload for #{} - ignoring", frame.seq);
                None
            }
            Ok(frame) => Some(frame.seq),
            Err(e) => {
                warn!("dropping received datagram: {}", e);
                None
            }
        }
    }
}
