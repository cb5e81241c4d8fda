//! Server-wide and per-session counters.
//!
//! `ServerStats` mirrors `fbtftp.base_server.ServerStats`: a single
//! mutex-guarded table of named integer counters, safe to share across
//! every session thread. `SessionStats` is the lightweight per-session
//! digest handed to the embedder's stats callback at the end of a
//! transfer, mirroring `fbtftp.base_handler.SessionStats`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::ErrorCode;

#[derive(Debug, Default)]
struct Counters(HashMap<String, i64>);

/// Thread-safe table of named counters, shared by every session thread
/// and the dispatcher.
#[derive(Clone, Default)]
pub struct ServerStats {
    inner: Arc<Mutex<Counters>>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> i64 {
        self.inner.lock().unwrap().0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&self, name: &str, value: i64) {
        self.inner.lock().unwrap().0.insert(name.to_string(), value);
    }

    /// Add `delta` to `name`, creating the counter at `delta` if absent.
    /// Returns the counter's new value.
    pub fn increment(&self, name: &str, delta: i64) -> i64 {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.0.entry(name.to_string()).or_insert(0);
        *entry += delta;
        *entry
    }

    pub fn reset(&self, name: &str) {
        self.inner.lock().unwrap().0.insert(name.to_string(), 0);
    }

    pub fn reset_all(&self) {
        self.inner.lock().unwrap().0.clear();
    }

    /// Atomically read and zero a single counter.
    pub fn get_and_reset(&self, name: &str) -> i64 {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.0.entry(name.to_string()).or_insert(0);
        std::mem::replace(entry, 0)
    }

    pub fn get_all(&self) -> HashMap<String, i64> {
        self.inner.lock().unwrap().0.clone()
    }

    /// Atomically snapshot and zero the whole table.
    pub fn get_and_reset_all(&self) -> HashMap<String, i64> {
        let mut guard = self.inner.lock().unwrap();
        std::mem::take(&mut guard.0)
    }
}

/// `{code, message}`, as spec.md §3 describes `SessionStats.error`: empty
/// on success, populated on any terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub code: u16,
    pub message: String,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u16,
            message: message.into(),
        }
    }
}

/// Outcome of a single session, handed to the embedder's per-session
/// callback when the transfer ends (successfully or not). Field set
/// mirrors `fbtftp.base_handler.SessionStats` (spec.md §3).
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub peer: SocketAddr,
    pub server_addr: SocketAddr,
    pub filename: String,
    pub start_time: Instant,
    /// Options as received in the RRQ, before negotiation.
    pub input_options: IndexMap<String, String>,
    /// The subset of `input_options` this session accepted and echoed
    /// back in its OACK.
    pub acknowledged_options: IndexMap<String, String>,
    pub block_size: usize,
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub bytes_sent: u64,
    /// Global count of retransmitted DATA/OACK packets for this session.
    pub retransmits: u64,
    pub error: Option<SessionError>,
}

impl SessionStats {
    pub fn new(
        peer: SocketAddr,
        server_addr: SocketAddr,
        filename: impl Into<String>,
        input_options: IndexMap<String, String>,
    ) -> Self {
        Self {
            peer,
            server_addr,
            filename: filename.into(),
            start_time: Instant::now(),
            input_options,
            acknowledged_options: IndexMap::new(),
            block_size: crate::DEFAULT_BLOCK_SIZE,
            packets_sent: 0,
            packets_acked: 0,
            bytes_sent: 0,
            retransmits: 0,
            error: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Whether any retransmit occurred during this session.
    pub fn had_retransmits(&self) -> bool {
        self.retransmits > 0
    }
}
