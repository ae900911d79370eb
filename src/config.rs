use std::cmp::max;
use std::time::Duration;
use anyhow::bail;

use crate::protocol::frame::{CHECKSUM_LEN, FIXED_HEADER_LEN};

#[derive(Debug, Clone)]
pub struct RdtConfig {
    /// Number of *characters* (not bytes) of file content per data frame
    pub chunk_size: usize,
    /// The send window covers `packet_count / window_divisor` packets, but at least one
    pub window_divisor: usize,

    /// pause between consecutive transmissions in a send pass, throttling local bursts
    pub send_delay: Duration,
    /// a packet is re-sent if it is not acknowledged within this interval, and again after
    ///  every further interval
    pub retransmit_timeout: Duration,
    /// the sender re-evaluates its window if no ACK arrives for this long
    pub ack_wait: Duration,
    pub fin_timeout: Duration,
    pub fin_retries: usize,

    /// receive buffer size - larger datagrams are truncated by the OS and fail their checksum
    pub max_datagram_size: usize,

    /// Upper bound for concurrent inbound transfers. When it is reached, the session that was
    ///  idle longest is discarded to make room.
    pub max_sessions: Option<usize>,
    /// sessions without traffic for this long are treated as abandoned and discarded
    pub session_idle_timeout: Option<Duration>,
    /// Upper bound for the distance between the lowest and highest sequence number of a
    ///  session. Chunks beyond it are dropped rather than growing the buffer without limit.
    pub max_session_span: usize,

    pub index_request_timeout: Duration,
}

impl RdtConfig {
    pub fn new() -> RdtConfig {
        RdtConfig {
            chunk_size: 24,
            window_divisor: 4,
            send_delay: Duration::from_millis(200),
            retransmit_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(4),
            fin_timeout: Duration::from_secs(10),
            fin_retries: 5,
            max_datagram_size: 4096,
            max_sessions: Some(1024),
            session_idle_timeout: Some(Duration::from_secs(120)),
            max_session_span: 1 << 20,
            index_request_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.window_divisor == 0 {
            bail!("window divisor must be positive");
        }
        if self.fin_retries == 0 {
            bail!("at least one FIN attempt is required");
        }
        if self.retransmit_timeout.is_zero() || self.ack_wait.is_zero() || self.fin_timeout.is_zero() {
            bail!("timeouts must be non-zero");
        }
        // a chunk is at most 4 bytes per char in UTF-8
        if self.max_datagram_size < CHECKSUM_LEN + FIXED_HEADER_LEN + 4 * self.chunk_size {
            bail!("datagram size {} is too small for chunks of {} characters", self.max_datagram_size, self.chunk_size);
        }
        if self.max_session_span == 0 {
            bail!("max session span must be positive");
        }
        if self.max_sessions == Some(0) {
            bail!("max sessions must be positive if it is set");
        }
        Ok(())
    }

    pub fn window_size(&self, packet_count: usize) -> usize {
        max(1, packet_count / self.window_divisor)
    }
}

impl Default for RdtConfig {
    fn default() -> Self {
        RdtConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_reference_values_are_valid() {
        RdtConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::zero_chunk(|c: &mut RdtConfig| c.chunk_size = 0)]
    #[case::zero_divisor(|c: &mut RdtConfig| c.window_divisor = 0)]
    #[case::no_fin_attempt(|c: &mut RdtConfig| c.fin_retries = 0)]
    #[case::zero_rto(|c: &mut RdtConfig| c.retransmit_timeout = Duration::ZERO)]
    #[case::tiny_datagram(|c: &mut RdtConfig| c.max_datagram_size = 50)]
    #[case::zero_span(|c: &mut RdtConfig| c.max_session_span = 0)]
    #[case::zero_sessions(|c: &mut RdtConfig| c.max_sessions = Some(0))]
    fn test_validate_rejects(#[case] tweak: fn(&mut RdtConfig)) {
        let mut config = RdtConfig::new();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::single(1, 1)]
    #[case::below_divisor(3, 1)]
    #[case::four(4, 1)]
    #[case::eight(8, 2)]
    #[case::rounding_down(11, 2)]
    #[case::large(100, 25)]
    fn test_window_size(#[case] packet_count: usize, #[case] expected: usize) {
        assert_eq!(RdtConfig::new().window_size(packet_count), expected);
    }
}
