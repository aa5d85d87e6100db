//! Per-connection session context.
//!
//! Processors are stateless; everything they remember about a connection
//! lives here and is passed to them explicitly on every call.

use crate::peer_link::PeerLink;
use crate::sync::lock;
use parley_types::{CertTrust, ConnectionRole, DomainPairId};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Transport-assigned identifier of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection stands in trust negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialbackPhase {
    /// Transport is up; stream header not yet processed.
    #[default]
    StreamOpened,
    /// Initiator saw a versioned stream header and waits for features.
    AwaitingFeatures,
    /// Features offered STARTTLS; waiting for the TLS result.
    TlsDecision,
    /// Initiator sent its dialback key.
    DialbackKeySent,
    /// Acceptor waits for the peer's dialback key.
    AwaitingKey,
    /// A verify request is outstanding for this connection.
    AwaitingVerify,
    /// Terminal success.
    Authenticated,
    /// Terminal failure or teardown.
    Closed,
}

#[derive(Debug, Default)]
struct SessionData {
    cid: Option<DomainPairId>,
    remote_stream_id: Option<String>,
    cert_trust: CertTrust,
    tls_active: bool,
    auth_method: Option<String>,
    requested_results: HashSet<String>,
    requested_verifies: HashSet<(String, String)>,
    joined_pairs: HashSet<DomainPairId>,
    authenticated_pairs: HashSet<DomainPairId>,
    phase: DialbackPhase,
}

/// One physical S2S connection as seen by the trust core.
pub struct S2SSession {
    role: ConnectionRole,
    session_id: String,
    handshaking_domain: Option<String>,
    link: PeerLink,
    data: Mutex<SessionData>,
    authenticated: AtomicBool,
    closing: AtomicBool,
}

impl S2SSession {
    /// Creates the context for a connection.
    ///
    /// A fresh stream id is generated; for inbound connections it is the id
    /// announced in our stream header. `handshaking_domain` marks a
    /// connection opened only to relay one verify request to that domain.
    pub fn new(role: ConnectionRole, link: PeerLink, handshaking_domain: Option<String>) -> Self {
        Self {
            role,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            handshaking_domain,
            link,
            data: Mutex::new(SessionData::default()),
            authenticated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.conn()
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Stream id we generated for this connection.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    /// True if this connection exists only to relay a verify request.
    pub fn is_handshaking_only(&self) -> bool {
        self.handshaking_domain.is_some()
    }

    pub fn handshaking_domain(&self) -> Option<&str> {
        self.handshaking_domain.as_deref()
    }

    /// Domain pair the connection was opened or accepted for, if known.
    pub fn cid(&self) -> Option<DomainPairId> {
        lock(&self.data).cid.clone()
    }

    pub fn set_cid(&self, cid: DomainPairId) {
        lock(&self.data).cid = Some(cid);
    }

    /// Returns the recorded pair, adopting `cid` first if none was known.
    pub fn adopt_cid(&self, cid: &DomainPairId) -> DomainPairId {
        lock(&self.data).cid.get_or_insert_with(|| cid.clone()).clone()
    }

    /// Stream id announced by the peer (outbound connections).
    pub fn remote_stream_id(&self) -> Option<String> {
        lock(&self.data).remote_stream_id.clone()
    }

    pub fn set_remote_stream_id(&self, id: impl Into<String>) {
        lock(&self.data).remote_stream_id = Some(id.into());
    }

    /// Records a completed TLS handshake and its certificate verdict.
    pub fn record_tls(&self, trust: CertTrust) {
        let mut data = lock(&self.data);
        data.tls_active = true;
        data.cert_trust = trust;
    }

    pub fn tls_active(&self) -> bool {
        lock(&self.data).tls_active
    }

    pub fn cert_trust(&self) -> CertTrust {
        lock(&self.data).cert_trust
    }

    /// Authentication method chosen for this connection, if any.
    pub fn auth_method(&self) -> Option<String> {
        lock(&self.data).auth_method.clone()
    }

    pub fn set_auth_method(&self, method: impl Into<String>) {
        lock(&self.data).auth_method = Some(method.into());
    }

    /// Remembers that we sent a dialback key to `domain` on this connection.
    pub fn add_requested_result(&self, domain: &str) {
        lock(&self.data).requested_results.insert(domain.to_ascii_lowercase());
    }

    /// True if a key was sent to `domain` and no reply consumed it yet.
    pub fn was_result_requested(&self, domain: &str) -> bool {
        lock(&self.data)
            .requested_results
            .contains(&domain.to_ascii_lowercase())
    }

    /// Consumes the pending key request for `domain`.
    pub fn take_requested_result(&self, domain: &str) -> bool {
        lock(&self.data)
            .requested_results
            .remove(&domain.to_ascii_lowercase())
    }

    /// Remembers that we asked `domain` to verify the key of stream `stream_id`.
    pub fn add_requested_verify(&self, domain: &str, stream_id: &str) {
        lock(&self.data)
            .requested_verifies
            .insert((domain.to_ascii_lowercase(), stream_id.to_string()));
    }

    /// True if any verify request to `domain` is outstanding.
    pub fn was_verify_requested(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        lock(&self.data)
            .requested_verifies
            .iter()
            .any(|(d, _)| *d == domain)
    }

    /// Consumes the verify request for `(domain, stream_id)`.
    pub fn take_requested_verify(&self, domain: &str, stream_id: &str) -> bool {
        lock(&self.data)
            .requested_verifies
            .remove(&(domain.to_ascii_lowercase(), stream_id.to_string()))
    }

    pub(crate) fn note_joined(&self, pair: &DomainPairId) {
        lock(&self.data).joined_pairs.insert(pair.clone());
    }

    pub(crate) fn joined_pairs(&self) -> Vec<DomainPairId> {
        lock(&self.data).joined_pairs.iter().cloned().collect()
    }

    pub fn phase(&self) -> DialbackPhase {
        lock(&self.data).phase
    }

    /// Moves to `phase` unless the connection already reached a terminal one.
    pub fn set_phase(&self, phase: DialbackPhase) {
        let mut data = lock(&self.data);
        if !matches!(data.phase, DialbackPhase::Authenticated | DialbackPhase::Closed) {
            tracing::trace!(conn = %self.id(), from = ?data.phase, to = ?phase, "phase change");
            data.phase = phase;
        }
    }

    /// True once the connection was verified for at least one pair.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// True if the connection was verified for `pair` itself. Trust earned
    /// for one pair never carries over to another pair on the same socket.
    pub fn is_authenticated_for(&self, pair: &DomainPairId) -> bool {
        lock(&self.data).authenticated_pairs.contains(pair)
    }

    /// Records that the connection was verified for `pair`. Returns `true`
    /// the first time for that pair.
    pub(crate) fn mark_authenticated(&self, pair: &DomainPairId) -> bool {
        let mut data = lock(&self.data);
        let first = data.authenticated_pairs.insert(pair.clone());
        self.authenticated.store(true, Ordering::Release);
        if data.phase != DialbackPhase::Closed {
            data.phase = DialbackPhase::Authenticated;
        }
        first
    }

    /// True while the transport is open and no teardown was requested.
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && self.link.transport().is_open(self.id())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Closes the connection after pending output. Idempotent.
    pub fn stop(&self) {
        if self.begin_close() {
            self.link.transport().stop(self.id());
        }
    }

    /// Closes the connection immediately. Idempotent, and a no-op if a
    /// graceful stop already started.
    pub fn force_stop(&self) {
        if self.begin_close() {
            self.link.transport().force_stop(self.id());
        }
    }

    /// Records that the transport already closed the connection.
    pub(crate) fn mark_closed(&self) {
        self.begin_close();
    }

    fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        lock(&self.data).phase = DialbackPhase::Closed;
        tracing::debug!(conn = %self.id(), role = %self.role, "closing connection");
        true
    }
}

impl fmt::Debug for S2SSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S2SSession")
            .field("id", &self.id())
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("handshaking_domain", &self.handshaking_domain)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl fmt::Display for S2SSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id(), self.role)
    }
}
