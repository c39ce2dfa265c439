//! Stream session identity and counters

use chrono::{DateTime, Utc};
use std::fmt;

/// Identifies one media session
///
/// Rendered as `{process_start}_{counter}`. Ids from one generator share the
/// start timestamp, so ordering follows the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    start: i64,
    counter: u64,
}

impl SessionId {
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.start, self.counter)
    }
}

/// Mints strictly increasing session ids
#[derive(Debug)]
pub struct SessionIdGenerator {
    start: i64,
    next: u64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::with_start(Utc::now().timestamp())
    }

    pub fn with_start(start: i64) -> Self {
        Self { start, next: 0 }
    }

    pub fn next_id(&mut self) -> SessionId {
        let id = SessionId {
            start: self.start,
            counter: self.next,
        };
        self.next += 1;
        id
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// One period of continuous streaming, from connect to termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub session_id: SessionId,
    pub attempt_number: u64,
    pub started_at: DateTime<Utc>,
    pub bytes_emitted: u64,
    pub packets_emitted: u64,
}

impl StreamSession {
    pub fn new(session_id: SessionId, attempt_number: u64) -> Self {
        Self {
            session_id,
            attempt_number,
            started_at: Utc::now(),
            bytes_emitted: 0,
            packets_emitted: 0,
        }
    }

    pub(crate) fn record_chunk(&mut self, len: usize) {
        self.bytes_emitted += len as u64;
        self.packets_emitted += 1;
    }
}
