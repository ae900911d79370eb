//! Utilities for testing code that transfers files. They are used by this crate's own tests,
//!  and exported for testing applications built on it.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;

use crate::config::RdtConfig;
use crate::files::storage::FileStorage;

/// Timing suitable for transfers over the loopback interface, finishing in milliseconds
pub fn loopback_config() -> RdtConfig {
    let mut config = RdtConfig::new();
    config.send_delay = Duration::from_millis(1);
    config.retransmit_timeout = Duration::from_millis(50);
    config.ack_wait = Duration::from_millis(40);
    config.fin_timeout = Duration::from_millis(50);
    config.index_request_timeout = Duration::from_millis(500);
    config
}

/// Keeps received files in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        Default::default()
    }

    pub fn get(&self, file_id: &str) -> Option<String> {
        self.files.lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .cloned()
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn persist(&self, file_id: &str, chunks: Vec<String>) -> anyhow::Result<()> {
        self.files.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id.to_string(), chunks.concat());
        Ok(())
    }
}
