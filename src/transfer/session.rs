use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::RdtConfig;

/// What happened to a chunk that was handed to a [Session]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Placement {
    /// the chunk started a new session
    Created,
    /// the chunk's sequence number was below the session's base, so the buffer was shifted
    Rebased,
    /// the chunk's sequence number was above the highest one seen so far, so the buffer grew
    Expanded,
    /// the chunk filled a hole inside the buffer
    Filled,
    /// the slot was already filled - first arrival wins, the chunk is dropped
    Duplicate,
    /// accepting the chunk would grow the buffer beyond its configured span
    OutOfRange,
    /// the file's session was evicted earlier, so the transfer cannot complete any more
    Discarded,
}

/// upper bound for the number of evicted file ids that are remembered
const MAX_EVICTED_IDS: usize = 4096;

/// Reassembly state for one inbound file.
///
/// `packets[i]` holds the chunk with sequence number `base_seq + i`, or `None` if that chunk
///  did not arrive yet. `base_seq` and `max_seq` are the lowest and highest sequence numbers
///  seen so far, so the first and last slots are always filled.
#[derive(Debug)]
pub struct Session {
    file_id: String,
    base_seq: i32,
    max_seq: i32,
    packets: Vec<Option<String>>,
    last_activity: Instant,
    /// an acknowledged chunk was dropped, so the file can not be reassembled completely
    truncated: bool,
}

impl Session {
    pub fn new(file_id: &str, seq: i32, chunk: String, now: Instant) -> Session {
        Session {
            file_id: file_id.to_string(),
            base_seq: seq,
            max_seq: seq,
            packets: vec![Some(chunk)],
            last_activity: now,
            truncated: false,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn base_seq(&self) -> i32 {
        self.base_seq
    }

    pub fn max_seq(&self) -> i32 {
        self.max_seq
    }

    pub fn slots(&self) -> &[Option<String>] {
        &self.packets
    }

    /// number of holes between base and max
    pub fn missing(&self) -> usize {
        self.packets.iter()
            .filter(|p| p.is_none())
            .count()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn insert(&mut self, seq: i32, chunk: String, max_span: usize) -> Placement {
        // i64 so that arbitrary i32 distances cannot overflow
        let seq_wide = i64::from(seq);
        let base = i64::from(self.base_seq);

        if seq_wide < base {
            let shift = (base - seq_wide) as u64;
            if shift + self.packets.len() as u64 > max_span as u64 {
                self.truncated = true;
                return Placement::OutOfRange;
            }
            let shift = shift as usize;
            trace!("rebasing session {} from #{} to #{}", self.file_id, self.base_seq, seq);
            self.packets.splice(0..0, std::iter::repeat(None).take(shift));
            self.packets[0] = Some(chunk);
            self.base_seq = seq;
            return Placement::Rebased;
        }

        let offset = (seq_wide - base) as u64;
        // NB: `seq == max_seq` is handled as an in-range slot rather than as an expansion, so a
        //      repeated last chunk does not overwrite the first copy. Retransmissions carry the
        //      same payload, so the result is the same either way.
        if seq > self.max_seq {
            if offset >= max_span as u64 {
                self.truncated = true;
                return Placement::OutOfRange;
            }
            let offset = offset as usize;
            trace!("expanding session {} from #{} to #{}", self.file_id, self.max_seq, seq);
            self.packets.resize(offset + 1, None);
            self.packets[offset] = Some(chunk);
            self.max_seq = seq;
            return Placement::Expanded;
        }

        let slot = &mut self.packets[offset as usize];
        if slot.is_some() {
            return Placement::Duplicate;
        }
        *slot = Some(chunk);
        Placement::Filled
    }

    /// the received chunks in ascending sequence order, skipping holes
    pub fn into_chunks(self) -> Vec<String> {
        self.packets.into_iter()
            .flatten()
            .collect()
    }
}

/// All in-flight inbound transfers of a receiver, keyed by file id.
///
/// The table is owned by the receiver's listen loop, so there is no locking here.
///
/// Evicted sessions leave their file id behind until the terminator arrives (or the id is idle
///  for another idle timeout): their earlier chunks were acknowledged and will not be sent
///  again, so later chunks must not start a new session that would persist a partial file.
pub struct SessionTable {
    sessions: FxHashMap<String, Session>,
    evicted: FxHashMap<String, Instant>,
    max_sessions: Option<usize>,
    idle_timeout: Option<Duration>,
    max_span: usize,
}

impl SessionTable {
    pub fn new(config: &RdtConfig) -> SessionTable {
        SessionTable {
            sessions: FxHashMap::default(),
            evicted: FxHashMap::default(),
            max_sessions: config.max_sessions,
            idle_timeout: config.session_idle_timeout,
            max_span: config.max_session_span,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, file_id: &str) -> Option<&Session> {
        self.sessions.get(file_id)
    }

    pub fn on_chunk(&mut self, file_id: &str, seq: i32, chunk: String, now: Instant) -> Placement {
        self.evict_idle(now);

        if let Some(last_activity) = self.evicted.get_mut(file_id) {
            *last_activity = now;
            debug!("chunk #{} for evicted file {} - dropping", seq, file_id);
            return Placement::Discarded;
        }

        if let Some(session) = self.sessions.get_mut(file_id) {
            session.last_activity = now;
            let placement = session.insert(seq, chunk, self.max_span);
            if placement == Placement::OutOfRange {
                warn!("chunk #{} for file {} is too far from #{}..#{} - dropping", seq, file_id, session.base_seq, session.max_seq);
            }
            return placement;
        }

        if let Some(max_sessions) = self.max_sessions {
            while !self.sessions.is_empty() && self.sessions.len() >= max_sessions {
                self.evict_least_recently_active(now);
            }
        }

        debug!("starting session for file {} at #{}", file_id, seq);
        self.sessions.insert(file_id.to_string(), Session::new(file_id, seq, chunk, now));
        Placement::Created
    }

    /// Remove the session, returning its chunks in ascending sequence order. Returns `None` if
    ///  there is nothing to persist: no session for the file id (e.g. for a repeated
    ///  terminator), or a session that lost acknowledged chunks.
    pub fn finalize(&mut self, file_id: &str) -> Option<Vec<String>> {
        if self.evicted.remove(file_id).is_some() {
            error!("transfer of file {} ended, but its session was evicted before - nothing is stored", file_id);
            return None;
        }

        let session = self.sessions.remove(file_id)?;
        if session.truncated {
            error!("file {} exceeds {} chunks and was truncated - nothing is stored", file_id, self.max_span);
            return None;
        }

        let missing = session.missing();
        if missing > 0 {
            warn!("finalizing file {} with {} missing chunks between #{} and #{}", file_id, missing, session.base_seq, session.max_seq);
        }
        else {
            debug!("finalizing file {} with chunks #{} to #{}", file_id, session.base_seq, session.max_seq);
        }
        Some(session.into_chunks())
    }

    /// discard sessions that saw no traffic for the configured idle timeout, returning their
    ///  file ids
    pub fn evict_idle(&mut self, now: Instant) -> Vec<String> {
        let idle_timeout = match self.idle_timeout {
            Some(t) => t,
            None => return Vec::new(),
        };

        self.evicted.retain(|_, last_activity| now.saturating_duration_since(*last_activity) < idle_timeout);

        let expired = self.sessions.values()
            .filter(|s| now.saturating_duration_since(s.last_activity) >= idle_timeout)
            .map(|s| s.file_id.clone())
            .collect::<Vec<_>>();

        for file_id in &expired {
            warn!("no data for file {} within {:?} - discarding incomplete transfer", file_id, idle_timeout);
            self.sessions.remove(file_id);
            self.remember_evicted(file_id.clone(), now);
        }
        expired
    }

    fn evict_least_recently_active(&mut self, now: Instant) {
        let oldest = self.sessions.values()
            .min_by_key(|s| s.last_activity)
            .map(|s| s.file_id.clone());

        if let Some(file_id) = oldest {
            warn!("session limit reached - discarding incomplete transfer of file {}", file_id);
            self.sessions.remove(&file_id);
            self.remember_evicted(file_id, now);
        }
    }

    fn remember_evicted(&mut self, file_id: String, now: Instant) {
        if self.evicted.len() >= MAX_EVICTED_IDS {
            let oldest = self.evicted.iter()
                .min_by_key(|(_, last_activity)| **last_activity)
                .map(|(file_id, _)| file_id.clone());
            if let Some(oldest) = oldest {
                self.evicted.remove(&oldest);
            }
        }
        self.evicted.insert(file_id, now);
    }
}
