//! Per-connection session records and their lifecycle.
//!
//! A record is created when a connection is admitted to a server's queue and
//! moves through a fixed set of states:
//!
//! ```text
//! Pending -> Active -> { Completed, ConnectionLost }
//! Pending -> TimeoutLost
//! ```
//!
//! Terminal records are handed by value to the metrics aggregator; nothing
//! mutates a record after it reaches a terminal state.

use std::time::{Duration, Instant};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Admitted and waiting in the queue.
    Pending,
    /// Handed to a protocol handler.
    Active,
    /// Client sent a valid rating and the session closed cleanly.
    Completed,
    /// Waited past the admission deadline; never served.
    TimeoutLost,
    /// Disconnected, stalled, or sent a malformed rating.
    ConnectionLost,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::TimeoutLost | SessionStatus::ConnectionLost
        )
    }

    /// Lost either way: evicted from the queue or dropped mid-protocol.
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            SessionStatus::TimeoutLost | SessionStatus::ConnectionLost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::TimeoutLost => "TIMEOUT_LOST",
            SessionStatus::ConnectionLost => "CONNECTION_LOST",
        }
    }
}

/// One admitted connection, from queue entry to terminal state.
///
/// The owning server is referenced by index, not by pointer, so records can
/// move freely between tasks (and across the process boundary in the forking
/// strategy, via [`crate::dispatch::ChildReport`]).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    client: String,
    server_index: usize,
    arrival: Instant,
    dispatched: Option<Instant>,
    completed: Option<Instant>,
    rating: Option<u8>,
    messages: u64,
    status: SessionStatus,
}

impl SessionRecord {
    pub fn new(client: impl Into<String>, server_index: usize, arrival: Instant) -> Self {
        SessionRecord {
            client: client.into(),
            server_index,
            arrival,
            dispatched: None,
            completed: None,
            rating: None,
            messages: 0,
            status: SessionStatus::Pending,
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn rating(&self) -> Option<u8> {
        self.rating
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// How long the connection has sat in the queue as of `now`.
    pub fn queued_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.arrival)
    }

    /// Time spent in the protocol handler, once terminal.
    pub fn service_time(&self) -> Option<Duration> {
        match (self.dispatched, self.completed) {
            (Some(d), Some(c)) => Some(c.saturating_duration_since(d)),
            _ => None,
        }
    }

    /// Count one echoed message.
    pub fn record_message(&mut self) {
        self.record_messages(1);
    }

    /// Absorb a message count reported from elsewhere (a forked child).
    pub fn record_messages(&mut self, n: u64) {
        self.messages += n;
    }

    /// Pending -> Active, stamped with the dispatch time.
    pub fn activate(&mut self, now: Instant) {
        debug_assert_eq!(self.status, SessionStatus::Pending);
        self.dispatched = Some(now);
        self.status = SessionStatus::Active;
    }

    /// Active -> Completed with a validated rating.
    pub fn complete(&mut self, rating: u8, now: Instant) {
        debug_assert_eq!(self.status, SessionStatus::Active);
        debug_assert!((1..=5).contains(&rating));
        self.rating = Some(rating);
        self.completed = Some(now);
        self.status = SessionStatus::Completed;
    }

    /// Active -> ConnectionLost. The rating stays absent.
    pub fn lose_connection(&mut self, now: Instant) {
        debug_assert_eq!(self.status, SessionStatus::Active);
        self.completed = Some(now);
        self.status = SessionStatus::ConnectionLost;
    }

    /// Pending -> TimeoutLost: evicted at dequeue without ever being served.
    pub fn lose_to_timeout(&mut self, now: Instant) {
        debug_assert_eq!(self.status, SessionStatus::Pending);
        self.completed = Some(now);
        self.status = SessionStatus::TimeoutLost;
    }
}
