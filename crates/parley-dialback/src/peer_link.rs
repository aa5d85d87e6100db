//! Per-connection control packet queue.

use crate::error::TransportError;
use crate::ports::Transport;
use crate::session::ConnectionId;
use crate::sync::lock;
use parley_types::Element;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// The transport handle of one physical S2S connection together with the
/// control stanzas waiting to be written on it.
///
/// Control stanzas are protocol artifacts (dialback keys, verify requests)
/// produced before the pair is trusted. They are written in FIFO order, in a
/// single batch, so negotiation traffic is never interleaved mid-flush. On
/// connection loss the queue is discarded: every entry can be re-derived by
/// renegotiating.
pub struct PeerLink {
    conn: ConnectionId,
    ip: String,
    transport: Arc<dyn Transport>,
    waiting: Mutex<VecDeque<Element>>,
}

impl PeerLink {
    /// Wraps the transport handle of connection `conn`.
    pub fn new(conn: ConnectionId, ip: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            conn,
            ip: ip.into(),
            transport,
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// The connection this link writes to.
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Remote address descriptor, as reported by the transport.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Queues a control stanza for the next flush.
    pub fn add_control_packet(&self, packet: Element) {
        lock(&self.waiting).push_back(packet);
    }

    /// Number of control stanzas waiting to be written.
    pub fn waiting_control_count(&self) -> usize {
        lock(&self.waiting).len()
    }

    /// Drains the queue and writes its contents in one batch.
    ///
    /// Returns the number of stanzas written. An empty queue writes nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the batch could not be written; the
    /// drained stanzas are dropped in that case.
    pub fn send_all_control_packets(&self) -> Result<usize, TransportError> {
        let batch: Vec<Element> = lock(&self.waiting).drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        for packet in &batch {
            tracing::trace!(conn = %self.conn, %packet, "sending control packet");
        }
        self.transport.write_packets(self.conn, batch)?;
        Ok(count)
    }

    /// Writes a single stanza immediately, bypassing the queue.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write failed.
    pub fn send_packet(&self, packet: Element) -> Result<(), TransportError> {
        tracing::trace!(conn = %self.conn, %packet, "sending packet");
        self.transport.write_packets(self.conn, vec![packet])
    }

    /// Drops every queued stanza and returns how many were discarded.
    pub fn discard_control_packets(&self) -> usize {
        let mut waiting = lock(&self.waiting);
        let count = waiting.len();
        waiting.clear();
        count
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("conn", &self.conn)
            .field("ip", &self.ip)
            .field("waiting", &self.waiting_control_count())
            .finish()
    }
}
