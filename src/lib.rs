//! Peer-to-peer file sharing over UDP.
//!
//! Files travel as sequences of small text chunks in checksummed frames. Each peer runs one
//!  [transfer::receiver::Receiver] on a well-known socket, which reassembles inbound files
//!  regardless of arrival order, and one short-lived [transfer::sender::Sender] per outbound
//!  file, which retransmits unacknowledged chunks in a selective-repeat window.
//!
//! [peer::Peer] wires both together with an exchange coordinator.

pub mod config;
pub mod error;
pub mod files;
pub mod peer;
pub mod protocol;
pub mod socket;
pub mod test_util;
pub mod transfer;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
