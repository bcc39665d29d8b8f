//! Connection and traffic counters.
//!
//! Updated only from the reactor thread, so plain `Cell`s are enough.

use std::cell::Cell;

/// MetricsSnapshot is a point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub historic_connections: u64,
    pub current_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub credentials_captured: u64,
}

/// Metrics is the sink the proxy reports into
#[derive(Debug, Default)]
pub struct Metrics {
    historic_connections: Cell<u64>,
    current_connections: Cell<u64>,
    bytes_sent: Cell<u64>,
    bytes_received: Cell<u64>,
    credentials_captured: Cell<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_new_connection(&self) {
        bump(&self.historic_connections, 1);
        bump(&self.current_connections, 1);
    }

    pub fn record_disconnect(&self) {
        let current = self.current_connections.get();
        self.current_connections.set(current.saturating_sub(1));
    }

    /// record_bytes_transferred counts bytes sent to origins and received by
    /// clients
    pub fn record_bytes_transferred(&self, sent: u64, received: u64) {
        bump(&self.bytes_sent, sent);
        bump(&self.bytes_received, received);
    }

    pub fn record_credentials(&self) {
        bump(&self.credentials_captured, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            historic_connections: self.historic_connections.get(),
            current_connections: self.current_connections.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            credentials_captured: self.credentials_captured.get(),
        }
    }
}

fn bump(counter: &Cell<u64>, n: u64) {
    counter.set(counter.get().saturating_add(n));
}
