//! Channel-backed [`Transport`].
//!
//! The trust core must not block on socket I/O or be re-entered from inside
//! its own calls, so every transport request is turned into a
//! [`TransportCommand`] and handed to the socket layer over an unbounded
//! channel.

use parley_dialback::{ConnectionId, Transport, TransportError};
use parley_types::{DomainPairId, Element};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Work for the socket layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Serialise and write these elements, in order.
    Write {
        conn: ConnectionId,
        packets: Vec<Element>,
    },
    /// Open an outbound connection for `pair` under id `conn`.
    Connect { conn: ConnectionId, pair: DomainPairId },
    /// Close the connection; `force` skips flushing pending output.
    Close { conn: ConnectionId, force: bool },
}

/// Transport that forwards requests to the socket layer.
#[derive(Debug)]
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
    open: RwLock<HashSet<ConnectionId>>,
    next_id: AtomicU64,
}

impl ChannelTransport {
    /// Creates the transport and the receiving end for the socket layer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            commands: tx,
            open: RwLock::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        };
        (transport, rx)
    }

    /// Allocates an id for a connection accepted by the socket layer.
    pub fn register_inbound(&self) -> ConnectionId {
        let conn = self.allocate();
        self.open_set().insert(conn);
        conn
    }

    /// Number of connections currently considered open.
    pub fn open_count(&self) -> usize {
        match self.open.read() {
            Ok(open) => open.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn open_set(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<ConnectionId>> {
        match self.open.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("transport connection set poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn close(&self, conn: ConnectionId, force: bool) {
        if !self.open_set().remove(&conn) {
            return;
        }
        if self.commands.send(TransportCommand::Close { conn, force }).is_err() {
            tracing::debug!(%conn, "socket layer gone, close not delivered");
        }
    }
}

impl Transport for ChannelTransport {
    fn write_packets(&self, conn: ConnectionId, packets: Vec<Element>) -> Result<(), TransportError> {
        if !self.is_open(conn) {
            return Err(TransportError::Closed(conn));
        }
        self.commands
            .send(TransportCommand::Write { conn, packets })
            .map_err(|_| TransportError::Closed(conn))
    }

    fn connect(&self, pair: &DomainPairId) -> Result<ConnectionId, TransportError> {
        let conn = self.allocate();
        // The socket layer may fail the connection as soon as it sees the
        // command, so the connection must already be open by then.
        self.open_set().insert(conn);
        let sent = self.commands.send(TransportCommand::Connect {
            conn,
            pair: pair.clone(),
        });
        if sent.is_err() {
            self.open_set().remove(&conn);
            return Err(TransportError::ConnectFailed {
                pair: pair.clone(),
                reason: "socket layer is not running".to_string(),
            });
        }
        Ok(conn)
    }

    fn stop(&self, conn: ConnectionId) {
        self.close(conn, false);
    }

    fn force_stop(&self, conn: ConnectionId) {
        self.close(conn, true);
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        match self.open.read() {
            Ok(open) => open.contains(&conn),
            Err(poisoned) => poisoned.into_inner().contains(&conn),
        }
    }
}
