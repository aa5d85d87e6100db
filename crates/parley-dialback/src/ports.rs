//! Collaborator interfaces consumed by the trust core.
//!
//! Socket I/O, the XML tokenizer, TLS handshakes and the secret store live
//! outside this crate. The manager reaches them only through these traits.

use crate::error::TransportError;
use crate::session::ConnectionId;
use parley_types::{DomainError, DomainPairId, Element};
use std::time::Duration;

/// Directory of locally served domains and their per-domain policy.
pub trait DomainDirectory: Send + Sync {
    /// True if `domain` is served by this node.
    fn is_local_domain(&self, domain: &str) -> bool;

    /// Dialback secret of a locally served domain.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotLocalDomain` if the domain is not served here.
    fn secret_for(&self, local_domain: &str) -> Result<String, DomainError>;

    /// True if connections for `local_domain` must negotiate TLS.
    fn is_tls_required(&self, local_domain: &str) -> bool;
}

/// Byte-stream side of a connection.
///
/// Implementations serialise elements and write them to the socket; they
/// must not call back into the manager synchronously.
pub trait Transport: Send + Sync {
    /// Writes a batch of elements to the connection, in order, as one unit.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the connection is gone.
    fn write_packets(&self, conn: ConnectionId, packets: Vec<Element>) -> Result<(), TransportError>;

    /// Requests a new outbound connection for `pair` and returns its id.
    ///
    /// The stream header exchange happens later; the transport reports it
    /// through `ConnectionManager::stream_opened`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectFailed` if no connection can be started.
    fn connect(&self, pair: &DomainPairId) -> Result<ConnectionId, TransportError>;

    /// Closes the connection after flushing pending output.
    fn stop(&self, conn: ConnectionId);

    /// Closes the connection immediately, discarding pending output.
    fn force_stop(&self, conn: ConnectionId);

    /// True while the connection is open.
    fn is_open(&self, conn: ConnectionId) -> bool;
}

/// One-shot task run by a [`TimerService`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Deferred execution of one-shot tasks.
pub trait TimerService: Send + Sync {
    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: TimerTask);
}

/// [`TimerService`] backed by the tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: tokio::runtime::Handle,
}

impl TokioTimer {
    /// Creates a timer bound to the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a timer bound to the runtime of the calling task.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}
