//! Connection manager: entry point for the transport layer.
//!
//! The transport reports connection lifecycle events and parsed elements;
//! the manager keeps one [`S2SSession`] per connection, routes elements
//! through the processor chain and exposes the trust registry to routing.

use crate::dialback::Dialback;
use crate::error::DialbackError;
use crate::ports::{DomainDirectory, TimerService, Transport};
use crate::processor::{S2SProcessor, StreamAttributes};
use crate::registry::TrustRegistry;
use crate::session::{ConnectionId, S2SSession};
use crate::stanzas;
use crate::stream_error::StreamErrorProcessor;
use crate::sync::{read, write};
use crate::watchdog::{AuthenticationWatchdog, DEFAULT_AUTH_TIMEOUT};
use crate::PeerLink;
use parley_types::{domain_of, CertTrust, ConnectionRole, DomainError, DomainPairId, Element};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Runtime settings of the S2S trust layer.
#[derive(Debug, Clone)]
pub struct S2SConfig {
    /// How long a connection may stay unauthenticated.
    pub auth_timeout: Duration,
    /// Run dialback even after a trusted certificate when the peer did not
    /// advertise the dialback feature.
    pub dialback_workaround: bool,
    /// Remote domains for which TLS checks are skipped.
    pub skip_tls_hosts: HashSet<String>,
}

impl Default for S2SConfig {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            dialback_workaround: true,
            skip_tls_hosts: HashSet::new(),
        }
    }
}

/// Owns every S2S session and the trust registry.
pub struct ConnectionManager {
    config: S2SConfig,
    directory: Arc<dyn DomainDirectory>,
    transport: Arc<dyn Transport>,
    timer: Arc<dyn TimerService>,
    registry: TrustRegistry,
    sessions: RwLock<HashMap<ConnectionId, Arc<S2SSession>>>,
    processors: Vec<Box<dyn S2SProcessor>>,
}

impl ConnectionManager {
    /// Creates a manager with the standard processor chain.
    pub fn new(
        config: S2SConfig,
        directory: Arc<dyn DomainDirectory>,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn TimerService>,
    ) -> Self {
        let dialback = Dialback::new(
            AuthenticationWatchdog::new(config.auth_timeout),
            config.dialback_workaround,
        );
        let processors: Vec<Box<dyn S2SProcessor>> =
            vec![Box::new(dialback), Box::new(StreamErrorProcessor)];
        Self::with_processors(config, directory, transport, timer, processors)
    }

    /// Creates a manager with a custom processor chain. Processors are
    /// sorted by their order.
    pub fn with_processors(
        config: S2SConfig,
        directory: Arc<dyn DomainDirectory>,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn TimerService>,
        mut processors: Vec<Box<dyn S2SProcessor>>,
    ) -> Self {
        processors.sort_by_key(|p| p.order());
        tracing::debug!(
            processors = ?processors.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "s2s processor chain"
        );
        let config = S2SConfig {
            skip_tls_hosts: config
                .skip_tls_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            ..config
        };
        Self {
            registry: TrustRegistry::new(Arc::clone(&directory)),
            config,
            directory,
            transport,
            timer,
            sessions: RwLock::new(HashMap::new()),
            processors,
        }
    }

    pub fn config(&self) -> &S2SConfig {
        &self.config
    }

    pub fn registry(&self) -> &TrustRegistry {
        &self.registry
    }

    pub fn timer(&self) -> &dyn TimerService {
        self.timer.as_ref()
    }

    pub fn session(&self, conn: ConnectionId) -> Option<Arc<S2SSession>> {
        read(&self.sessions).get(&conn).cloned()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        read(&self.sessions).len()
    }

    /// True if TLS checks are skipped for `remote`.
    pub fn skip_tls_for(&self, remote: &str) -> bool {
        self.config
            .skip_tls_hosts
            .contains(&remote.to_ascii_lowercase())
    }

    pub fn is_tls_required(&self, local: &str) -> bool {
        self.directory.is_tls_required(local)
    }

    /// Dialback secret of a local domain.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotLocalDomain` if `local` is not served here.
    pub fn secret_for(&self, local: &str) -> Result<String, DomainError> {
        self.directory.secret_for(local)
    }

    pub fn is_authenticated(&self, pair: &DomainPairId) -> bool {
        self.registry.is_authenticated(pair)
    }

    fn register(&self, session: Arc<S2SSession>) -> Arc<S2SSession> {
        write(&self.sessions).insert(session.id(), Arc::clone(&session));
        session
    }

    /// Registers a connection accepted from a peer.
    pub fn connection_accepted(&self, conn: ConnectionId, ip: &str) -> Arc<S2SSession> {
        tracing::debug!(%conn, ip, "inbound s2s connection accepted");
        let link = PeerLink::new(conn, ip, Arc::clone(&self.transport));
        self.register(Arc::new(S2SSession::new(ConnectionRole::Inbound, link, None)))
    }

    /// Opens an outbound connection for `pair`.
    ///
    /// With `handshaking_domain` set the connection only relays verify
    /// requests to that domain and never presents a key of its own.
    ///
    /// # Errors
    ///
    /// - `Domain` if the pair is invalid.
    /// - `Transport` if the transport cannot start a connection.
    pub fn open_connection(
        &self,
        pair: &DomainPairId,
        handshaking_domain: Option<String>,
    ) -> Result<Arc<S2SSession>, DialbackError> {
        let entry = self.registry.entry(pair)?;
        let conn = self.transport.connect(entry.pair())?;
        tracing::debug!(
            %conn,
            %pair,
            handshaking = handshaking_domain.is_some(),
            "outbound s2s connection requested"
        );
        let link = PeerLink::new(conn, "", Arc::clone(&self.transport));
        let session = Arc::new(S2SSession::new(ConnectionRole::Outbound, link, handshaking_domain));
        session.set_cid(entry.pair().clone());
        entry.add_outgoing(&session);
        let session = self.register(session);
        // A connect that failed before registration delivered its close to
        // nobody.
        if !self.transport.is_open(conn) {
            self.connection_closed(conn);
        }
        Ok(session)
    }

    /// The transport started servicing `conn`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownConnection` if `conn` was never registered.
    pub fn service_started(&self, conn: ConnectionId) -> Result<(), DialbackError> {
        let session = self
            .session(conn)
            .ok_or(DialbackError::UnknownConnection(conn))?;
        for processor in &self.processors {
            processor.service_started(self, &session);
        }
        Ok(())
    }

    /// The peer's stream header was parsed.
    ///
    /// Returns the text to write back: for inbound connections our stream
    /// header (plus features when the peer announced a version, or a stream
    /// error when its addressing is unacceptable), followed by whatever the
    /// processors contribute.
    pub fn stream_opened(&self, conn: ConnectionId, attrs: &StreamAttributes) -> Option<String> {
        let Some(session) = self.session(conn) else {
            tracing::warn!(%conn, "stream opened on unknown connection");
            return None;
        };
        let mut reply = String::new();
        match session.role() {
            ConnectionRole::Inbound => {
                if let Some(err) = self.accept_stream_header(&session, attrs, &mut reply) {
                    tracing::debug!(%conn, "refusing inbound stream: {}", err);
                    reply.push_str(&stanzas::stream_error(err.stream_condition()).to_xml());
                    session.stop();
                    return Some(reply);
                }
            }
            ConnectionRole::Outbound => match attrs.get("id") {
                Some(id) => session.set_remote_stream_id(id.as_str()),
                None => tracing::debug!(%conn, "peer stream header without id"),
            },
        }
        for processor in &self.processors {
            if let Some(text) = processor.stream_opened(self, &session, attrs) {
                reply.push_str(&text);
            }
        }
        (!reply.is_empty()).then_some(reply)
    }

    /// Writes our header for an inbound stream into `reply`. Returns the
    /// error that should end the stream, if any.
    fn accept_stream_header(
        &self,
        session: &Arc<S2SSession>,
        attrs: &StreamAttributes,
        reply: &mut String,
    ) -> Option<DialbackError> {
        let to = attrs.get("to").map(|t| domain_of(t));
        let from = attrs.get("from").map(|f| domain_of(f));
        let version = attrs.get("version").map(String::as_str);

        let checked = match (to, from) {
            (Some(to), _) if !self.directory.is_local_domain(&to.to_ascii_lowercase()) => {
                Err(DomainError::NotLocalDomain(to.to_string()))
            }
            (Some(to), Some(from)) => {
                DomainPairId::checked(to, from, |d| self.directory.is_local_domain(d)).map(Some)
            }
            _ => Ok(None),
        };
        reply.push_str(&stanzas::stream_header(session.session_id(), to, from, version));
        match checked {
            Ok(Some(cid)) => session.set_cid(cid),
            Ok(None) => {}
            Err(e) => return Some(e.into()),
        }
        if version.is_some() {
            let features = self.stream_features_for(session);
            reply.push_str(&stanzas::stream_features(features).to_xml());
        }
        None
    }

    fn stream_features_for(&self, session: &Arc<S2SSession>) -> Vec<Element> {
        self.processors
            .iter()
            .flat_map(|p| p.stream_features(self, session))
            .collect()
    }

    /// Feature elements the processors advertise on `conn`.
    pub fn stream_features(&self, conn: ConnectionId) -> Vec<Element> {
        self.session(conn)
            .map(|s| self.stream_features_for(&s))
            .unwrap_or_default()
    }

    /// Offers an element received on `conn` to the processor chain.
    ///
    /// Returns `true` if a processor consumed it.
    pub fn process(&self, conn: ConnectionId, stanza: &Element) -> bool {
        let Some(session) = self.session(conn) else {
            tracing::warn!(%conn, "element on unknown connection dropped");
            return false;
        };
        tracing::trace!(%conn, %stanza, "processing s2s element");
        for processor in &self.processors {
            if processor.process(self, &session, stanza) {
                return true;
            }
        }
        false
    }

    /// The transport finished a TLS handshake on `conn`.
    pub fn tls_completed(&self, conn: ConnectionId, trust: CertTrust) {
        match self.session(conn) {
            Some(session) => {
                tracing::debug!(%conn, ?trust, "tls established");
                session.record_tls(trust);
            }
            None => tracing::warn!(%conn, "tls completed on unknown connection"),
        }
    }

    /// The transport closed `conn`. Pending control packets are discarded
    /// and the connection leaves every pair it joined.
    pub fn connection_closed(&self, conn: ConnectionId) {
        let Some(session) = write(&self.sessions).remove(&conn) else {
            return;
        };
        session.mark_closed();
        let discarded = session.link().discard_control_packets();
        if discarded > 0 {
            tracing::debug!(%conn, discarded, "dropped unsent control packets");
        }
        self.registry.remove_connection(&session);
        tracing::debug!(%conn, role = %session.role(), "s2s connection closed");
    }

    /// Sends application traffic for `pair` over an authenticated link.
    ///
    /// # Errors
    ///
    /// - `NotAuthenticated` if the pair has no authenticated open link.
    /// - `Transport` if the write failed.
    pub fn send_packet(&self, pair: &DomainPairId, stanza: Element) -> Result<(), DialbackError> {
        let link = self
            .registry
            .get(pair)
            .filter(|e| e.is_authenticated())
            .and_then(|e| e.authenticated_link())
            .ok_or_else(|| DialbackError::NotAuthenticated(pair.clone()))?;
        link.link().send_packet(stanza)?;
        Ok(())
    }

    /// Asks the authoritative server of `pair.remote()` to check `key`,
    /// presented on our stream `stream_id`.
    ///
    /// Uses an open outgoing link of the pair if there is one, otherwise a
    /// new connection that only relays verify requests.
    ///
    /// # Errors
    ///
    /// - `Domain` if the pair is invalid.
    /// - `Transport` if no connection could be opened or written.
    pub fn send_verify_request(
        &self,
        pair: &DomainPairId,
        stream_id: &str,
        key: &str,
    ) -> Result<(), DialbackError> {
        let entry = self.registry.entry(pair)?;
        let pair = entry.pair();
        let relay = match entry.usable_outgoing() {
            Some(session) => session,
            None => self.open_connection(pair, Some(pair.remote().to_string()))?,
        };
        relay.add_requested_verify(pair.remote(), stream_id);
        relay
            .link()
            .add_control_packet(stanzas::verify_request(pair.local(), pair.remote(), stream_id, key));
        tracing::debug!(conn = %relay.id(), %pair, stream_id, "verify request queued");
        if relay.remote_stream_id().is_some() {
            relay.link().send_all_control_packets()?;
        }
        Ok(())
    }

    /// Sends a stream error and closes the connection.
    pub fn fail_stream(&self, session: &S2SSession, condition: &str, force: bool) {
        tracing::debug!(conn = %session.id(), condition, "sending stream error");
        if let Err(e) = session.link().send_packet(stanzas::stream_error(condition)) {
            tracing::debug!(conn = %session.id(), "stream error not delivered: {}", e);
        }
        if force {
            session.force_stop();
        } else {
            session.stop();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("registry", &self.registry)
            .finish()
    }
}
