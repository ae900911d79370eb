use std::cmp::min;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

use crate::protocol::frame::Frame;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckOutcome {
    Acknowledged,
    /// the packet was acknowledged before - nothing changes
    Duplicate,
    /// the sequence number does not belong to this window
    OutOfRange,
}

struct Slot {
    datagram: Bytes,
    sent: bool,
    acknowledged: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

/// The outbound packets of a single transfer, `slots[i]` holding the packet with sequence
///  number `base_seq + i`.
///
/// Each sent but unacknowledged packet has exactly one retransmission timer. The timer does not
///  send anything itself: it reports the slot index on a channel, and the owner of the window
///  re-checks the acknowledged flag and does the actual resend. So there is a single place where
///  'retransmit' and 'acknowledge' meet, and once `on_ack` returned, no further retransmission
///  of that packet can happen.
pub struct SendWindow {
    base_seq: i32,
    slots: Vec<Slot>,
}

impl SendWindow {
    pub fn new(file_id: &str, base_seq: i32, chunks: &[String]) -> SendWindow {
        let slots = chunks.iter()
            .enumerate()
            .map(|(i, chunk)| Slot {
                datagram: Frame::data(file_id, base_seq + i as i32, chunk).encode(),
                sent: false,
                acknowledged: Default::default(),
                timer: None,
            })
            .collect();

        SendWindow {
            base_seq,
            slots,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn base_seq(&self) -> i32 {
        self.base_seq
    }

    pub fn seq_of(&self, idx: usize) -> i32 {
        self.base_seq + idx as i32
    }

    pub fn datagram(&self, idx: usize) -> &Bytes {
        &self.slots[idx].datagram
    }

    /// `[i, i+window_size)` where `i` is the lowest unacknowledged packet, clipped to the number
    ///  of packets. `None` if everything is acknowledged.
    pub fn current_window(&self, window_size: usize) -> Option<Range<usize>> {
        let first = self.slots.iter()
            .position(|s| !s.acknowledged.load(Ordering::Acquire))?;
        Some(first..min(first + window_size, self.slots.len()))
    }

    pub fn is_acknowledged(&self, idx: usize) -> bool {
        self.slots[idx].acknowledged.load(Ordering::Acquire)
    }

    pub fn is_sent(&self, idx: usize) -> bool {
        self.slots[idx].sent
    }

    pub fn all_acknowledged(&self) -> bool {
        self.slots.iter()
            .all(|s| s.acknowledged.load(Ordering::Acquire))
    }

    /// Record the first transmission of a packet and arm its retransmission timer. The timer
    ///  reports `idx` on `retransmit` every `retransmit_timeout` until the packet is
    ///  acknowledged.
    pub fn mark_sent(&mut self, idx: usize, retransmit_timeout: Duration, retransmit: mpsc::UnboundedSender<usize>) {
        let slot = &mut self.slots[idx];
        slot.sent = true;

        if slot.timer.is_some() {
            // never arm a second timer for the same packet
            return;
        }

        let acknowledged = slot.acknowledged.clone();
        slot.timer = Some(tokio::spawn(async move {
            loop {
                time::sleep(retransmit_timeout).await;
                if acknowledged.load(Ordering::Acquire) {
                    return;
                }
                if retransmit.send(idx).is_err() {
                    // the transfer is over
                    return;
                }
            }
        }));
    }

    pub fn on_ack(&mut self, seq: i32) -> AckOutcome {
        let idx = i64::from(seq) - i64::from(self.base_seq);
        if idx < 0 || idx >= self.slots.len() as i64 {
            return AckOutcome::OutOfRange;
        }
        let slot = &mut self.slots[idx as usize];

        if slot.acknowledged.swap(true, Ordering::AcqRel) {
            return AckOutcome::Duplicate;
        }
        if let Some(timer) = slot.timer.take() {
            trace!("cancelling retransmission timer for #{}", seq);
            timer.abort();
        }
        AckOutcome::Acknowledged
    }

    fn cancel_timers(&mut self) {
        for slot in &mut self.slots {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
        }
    }
}

impl Drop for SendWindow {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
