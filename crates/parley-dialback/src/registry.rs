//! Trust state per domain pair.
//!
//! The registry is the only state shared between connection threads. The
//! authenticated flag of an entry is an atomic so the routing fast path never
//! takes a lock; link sets sit behind `RwLock`s that are held only for map
//! operations, never across transport writes.

use crate::ports::DomainDirectory;
use crate::session::{ConnectionId, S2SSession};
use crate::sync::{read, write};
use parley_types::{ConnectionRole, DomainError, DomainPairId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

type LinkSet = RwLock<BTreeMap<ConnectionId, Arc<S2SSession>>>;

/// Connections and trust state of one domain pair.
#[derive(Debug)]
pub struct TrustEntry {
    pair: DomainPairId,
    authenticated: AtomicBool,
    incoming: LinkSet,
    outgoing: LinkSet,
}

impl TrustEntry {
    fn new(pair: DomainPairId) -> Self {
        Self {
            pair,
            authenticated: AtomicBool::new(false),
            incoming: RwLock::new(BTreeMap::new()),
            outgoing: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn pair(&self) -> &DomainPairId {
        &self.pair
    }

    /// True once a key for this pair has been verified.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Registers an inbound connection. Idempotent.
    pub fn add_incoming(&self, session: &Arc<S2SSession>) {
        Self::insert(&self.incoming, session);
        session.note_joined(&self.pair);
    }

    /// Registers an outbound connection. Idempotent.
    pub fn add_outgoing(&self, session: &Arc<S2SSession>) {
        Self::insert(&self.outgoing, session);
        session.note_joined(&self.pair);
    }

    fn insert(set: &LinkSet, session: &Arc<S2SSession>) {
        write(set)
            .entry(session.id())
            .or_insert_with(|| Arc::clone(session));
    }

    fn add_by_role(&self, session: &Arc<S2SSession>) {
        match session.role() {
            ConnectionRole::Inbound => self.add_incoming(session),
            ConnectionRole::Outbound => self.add_outgoing(session),
        }
    }

    /// Marks the pair and `session` authenticated and flushes the control
    /// packets queued on every link of the pair.
    ///
    /// Safe to call repeatedly: flushing drains the queues, so a redundant
    /// call writes nothing.
    pub fn connection_authenticated(&self, session: &Arc<S2SSession>) {
        self.add_by_role(session);
        if session.mark_authenticated(&self.pair) {
            tracing::debug!(conn = %session.id(), pair = %self.pair, "connection authenticated");
        }
        if !self.authenticated.swap(true, Ordering::AcqRel) {
            tracing::info!(pair = %self.pair, "domain pair authenticated");
        }
        self.send_all_control_packets();
    }

    /// Same as [`TrustEntry::connection_authenticated`] for the incoming
    /// connection whose stream id is `session_id`.
    ///
    /// Returns the connection, or `None` if no incoming connection of this
    /// pair carries that stream id.
    pub fn connection_authenticated_by_session(&self, session_id: &str) -> Option<Arc<S2SSession>> {
        match self.incoming_by_session(session_id) {
            Some(session) => {
                self.connection_authenticated(&session);
                Some(session)
            }
            None => {
                tracing::debug!(pair = %self.pair, session_id, "no incoming connection with session id");
                None
            }
        }
    }

    /// The incoming connection whose stream id is `session_id`.
    pub fn incoming_by_session(&self, session_id: &str) -> Option<Arc<S2SSession>> {
        read(&self.incoming)
            .values()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }

    /// Flushes the control queue of every link, outgoing first.
    pub fn send_all_control_packets(&self) {
        for session in self.links() {
            if session.is_closing() {
                continue;
            }
            if let Err(e) = session.link().send_all_control_packets() {
                tracing::warn!(conn = %session.id(), pair = %self.pair, "control packet flush failed: {}", e);
            }
        }
    }

    /// Outgoing links, then incoming links, each in connection-id order.
    pub fn links(&self) -> Vec<Arc<S2SSession>> {
        let mut all: Vec<_> = read(&self.outgoing).values().cloned().collect();
        all.extend(read(&self.incoming).values().cloned());
        all
    }

    pub fn incoming(&self) -> Vec<Arc<S2SSession>> {
        read(&self.incoming).values().cloned().collect()
    }

    pub fn outgoing(&self) -> Vec<Arc<S2SSession>> {
        read(&self.outgoing).values().cloned().collect()
    }

    /// An open outgoing link that may carry verify requests, preferring
    /// links verified for this pair. Handshake-only relays are never
    /// reused; each carries a single request.
    pub fn usable_outgoing(&self) -> Option<Arc<S2SSession>> {
        let outgoing = read(&self.outgoing);
        let open = || {
            outgoing
                .values()
                .filter(|s| !s.is_handshaking_only() && s.is_open())
        };
        open()
            .find(|s| s.is_authenticated_for(&self.pair))
            .or_else(|| open().next())
            .cloned()
    }

    /// An open outgoing link verified for this pair, suitable for
    /// application traffic.
    pub fn authenticated_link(&self) -> Option<Arc<S2SSession>> {
        read(&self.outgoing)
            .values()
            .find(|s| s.is_authenticated_for(&self.pair) && s.is_open())
            .cloned()
    }

    /// Removes a connection. Returns `true` if the pair has no links left.
    fn remove(&self, conn: ConnectionId) -> bool {
        let mut outgoing = write(&self.outgoing);
        let mut incoming = write(&self.incoming);
        outgoing.remove(&conn);
        incoming.remove(&conn);
        if outgoing.is_empty() && incoming.is_empty() {
            self.authenticated.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// All trust entries, keyed by domain pair.
pub struct TrustRegistry {
    directory: Arc<dyn DomainDirectory>,
    entries: RwLock<HashMap<DomainPairId, Arc<TrustEntry>>>,
}

impl TrustRegistry {
    pub fn new(directory: Arc<dyn DomainDirectory>) -> Self {
        Self {
            directory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for `pair`, inserting it when `create` is set.
    ///
    /// # Errors
    ///
    /// - `NotLocalDomain` if the local side is not served here.
    /// - `NotRemoteDomain` if the remote side is one of our own domains.
    /// - `InvalidDomain` if either side is malformed.
    pub fn get_or_create(
        &self,
        pair: &DomainPairId,
        create: bool,
    ) -> Result<Option<Arc<TrustEntry>>, DomainError> {
        if let Some(entry) = read(&self.entries).get(pair) {
            return Ok(Some(Arc::clone(entry)));
        }
        let pair = DomainPairId::checked(pair.local(), pair.remote(), |d| {
            self.directory.is_local_domain(d)
        })?;
        if !create {
            return Ok(read(&self.entries).get(&pair).cloned());
        }
        let mut entries = write(&self.entries);
        let entry = entries
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(TrustEntry::new(pair)));
        Ok(Some(Arc::clone(entry)))
    }

    /// Returns the entry for `pair`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Same as [`TrustRegistry::get_or_create`].
    pub fn entry(&self, pair: &DomainPairId) -> Result<Arc<TrustEntry>, DomainError> {
        self.get_or_create(pair, true)?
            .ok_or_else(|| DomainError::NotLocalDomain(pair.local().to_string()))
    }

    pub fn get(&self, pair: &DomainPairId) -> Option<Arc<TrustEntry>> {
        read(&self.entries).get(pair).cloned()
    }

    /// Lock-light check used on the routing path.
    pub fn is_authenticated(&self, pair: &DomainPairId) -> bool {
        self.get(pair).is_some_and(|e| e.is_authenticated())
    }

    /// Pairs currently trusted, sorted.
    pub fn authenticated_pairs(&self) -> Vec<DomainPairId> {
        let mut pairs: Vec<_> = read(&self.entries)
            .values()
            .filter(|e| e.is_authenticated())
            .map(|e| e.pair().clone())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches a closed connection from every pair it joined. Pairs left
    /// without links are dropped and must renegotiate.
    pub fn remove_connection(&self, session: &S2SSession) {
        for pair in session.joined_pairs() {
            let Some(entry) = self.get(&pair) else {
                continue;
            };
            if entry.remove(session.id()) {
                let mut entries = write(&self.entries);
                // Re-check under the map lock; a link may have joined meanwhile.
                if entries.get(&pair).is_some_and(|e| Arc::ptr_eq(e, &entry) && e.links().is_empty()) {
                    entries.remove(&pair);
                    tracing::info!(%pair, "all links closed, domain pair trust dropped");
                }
            }
        }
    }
}

impl std::fmt::Debug for TrustRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
