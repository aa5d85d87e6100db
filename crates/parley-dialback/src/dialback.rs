//! Server dialback.
//!
//! One processor drives both sides of the exchange. As originator it sends a
//! key derived from its secret and the peer's stream id. As receiver it asks
//! the originator's authoritative server to check that key over a second
//! connection. As authoritative server it recomputes the key and answers.
//!
//! ```text
//!  originating A          receiving B           authoritative A
//!      | db:result(key) -->   |                       |
//!      |                      | db:verify(id,key) --> |
//!      |                      | <-- db:verify(type)   |
//!      | <-- db:result(type)  |                       |
//! ```

use crate::error::DialbackError;
use crate::key::{generate_dialback_key, keys_match};
use crate::manager::ConnectionManager;
use crate::processor::{ProcessorOrder, S2SProcessor, StreamAttributes};
use crate::registry::TrustEntry;
use crate::session::{DialbackPhase, S2SSession};
use crate::stanzas::{self, DialbackKind};
use crate::watchdog::AuthenticationWatchdog;
use parley_types::{
    CertTrust, ConnectionRole, DomainPairId, Element, StanzaType, NS_DIALBACK_FEATURE, NS_STARTTLS,
};
use std::sync::Arc;

/// Value recorded as the session's auth method once dialback starts.
pub const METHOD: &str = "dialback";

/// Auth method recorded when a trusted certificate alone authenticated.
pub const METHOD_TLS: &str = "tls";

/// The dialback processor.
#[derive(Debug, Clone)]
pub struct Dialback {
    watchdog: AuthenticationWatchdog,
    workaround: bool,
}

impl Dialback {
    /// `workaround` makes the initiator run dialback even when a trusted
    /// certificate was presented and the peer did not advertise dialback.
    pub fn new(watchdog: AuthenticationWatchdog, workaround: bool) -> Self {
        Self {
            watchdog,
            workaround,
        }
    }

    fn process_features(&self, manager: &ConnectionManager, session: &Arc<S2SSession>, features: &Element) -> bool {
        if session
            .auth_method()
            .is_some_and(|m| m != METHOD)
        {
            tracing::debug!(conn = %session.id(), "connection authenticating by other means");
            return true;
        }
        let Some(cid) = session.cid() else {
            tracing::warn!(conn = %session.id(), "stream features on connection without domain pair");
            return false;
        };
        let skip_tls = manager.skip_tls_for(cid.remote());

        if features.has_child("starttls", NS_STARTTLS) && !session.tls_active() && !skip_tls {
            tracing::debug!(conn = %session.id(), pair = %cid, "peer offers STARTTLS, waiting for TLS");
            session.set_phase(DialbackPhase::TlsDecision);
            return true;
        }

        if session.cert_trust() == CertTrust::Trusted
            && !features.has_child("dialback", NS_DIALBACK_FEATURE)
        {
            if self.workaround {
                tracing::debug!(conn = %session.id(), pair = %cid, "peer did not offer dialback, trying it anyway");
            } else {
                match manager.registry().entry(&cid) {
                    Ok(entry) => {
                        tracing::debug!(conn = %session.id(), pair = %cid, "authenticated by trusted certificate");
                        session.set_auth_method(METHOD_TLS);
                        entry.connection_authenticated(session);
                    }
                    Err(e) => manager.fail_stream(session, DialbackError::from(e).stream_condition(), true),
                }
                return true;
            }
        }

        if !skip_tls && !session.tls_active() && manager.is_tls_required(cid.local()) {
            tracing::warn!(conn = %session.id(), pair = %cid, "TLS required but not negotiated");
            manager.fail_stream(session, "policy-violation", true);
            return true;
        }

        self.init_dialback(manager, session);
        true
    }

    /// Queues our key (unless the connection only relays verify requests)
    /// and flushes the control queue.
    fn init_dialback(&self, manager: &ConnectionManager, session: &Arc<S2SSession>) {
        let Some(remote_id) = session.remote_stream_id() else {
            tracing::warn!(conn = %session.id(), "peer stream header carried no id");
            manager.fail_stream(session, DialbackError::MissingStreamId.stream_condition(), false);
            return;
        };
        let Some(cid) = session.cid() else {
            manager.fail_stream(session, "improper-addressing", false);
            return;
        };
        let secret = match manager.secret_for(cid.local()) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(conn = %session.id(), pair = %cid, "cannot start dialback: {}", e);
                manager.fail_stream(session, DialbackError::from(e).stream_condition(), false);
                return;
            }
        };

        session.set_auth_method(METHOD);
        if session.is_handshaking_only() {
            session.set_phase(DialbackPhase::AwaitingVerify);
        } else {
            let key = generate_dialback_key(cid.local(), cid.remote(), &secret, &remote_id);
            session.add_requested_result(cid.remote());
            session
                .link()
                .add_control_packet(stanzas::dialback_key(cid.local(), cid.remote(), &key));
            session.set_phase(DialbackPhase::DialbackKeySent);
            tracing::debug!(conn = %session.id(), pair = %cid, "dialback key queued");
        }
        if let Err(e) = session.link().send_all_control_packets() {
            tracing::warn!(conn = %session.id(), pair = %cid, "failed to send control packets: {}", e);
        }
    }

    fn process_dialback(
        &self,
        manager: &ConnectionManager,
        session: &Arc<S2SSession>,
        kind: DialbackKind,
        stanza: &Element,
    ) {
        let (Some(to), Some(from)) = (stanza.attr("to"), stanza.attr("from")) else {
            tracing::debug!(conn = %session.id(), %stanza, "dialback stanza without addressing");
            manager.fail_stream(session, "improper-addressing", false);
            return;
        };
        let packet_cid = DomainPairId::from_stanza(to, from);
        let cid = session.adopt_cid(&packet_cid);

        let entry = match manager.registry().entry(&packet_cid) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(conn = %session.id(), pair = %packet_cid, "rejecting dialback stanza: {}", e);
                manager.fail_stream(session, DialbackError::from(e).stream_condition(), false);
                return;
            }
        };
        if session.role() == ConnectionRole::Inbound {
            entry.add_incoming(session);
        }

        match (kind, stanza.attr("type").map(StanzaType::parse)) {
            (DialbackKind::Result, None) => self.receive_key(manager, session, &cid, &packet_cid, stanza),
            (DialbackKind::Result, Some(outcome)) => receive_result(session, &entry, outcome),
            (DialbackKind::Verify, None) => answer_verify(manager, session, &packet_cid, stanza),
            (DialbackKind::Verify, Some(outcome)) => {
                receive_verify_reply(session, &entry, stanza, outcome)
            }
        }
    }

    /// Receiving server: a peer presented its key.
    fn receive_key(
        &self,
        manager: &ConnectionManager,
        session: &Arc<S2SSession>,
        cid: &DomainPairId,
        packet_cid: &DomainPairId,
        stanza: &Element,
    ) {
        if !manager.skip_tls_for(cid.remote()) && !session.tls_active() && manager.is_tls_required(cid.local()) {
            tracing::warn!(conn = %session.id(), pair = %packet_cid, "dialback key offered without required TLS");
            let reply = stanzas::result_reply(
                packet_cid.local(),
                packet_cid.remote(),
                StanzaType::Error,
                Some(stanzas::stanza_error("cancel", "policy-violation")),
            );
            send_reply(session, reply);
            return;
        }

        let Some(key) = stanza.cdata().map(str::trim).filter(|k| !k.is_empty()) else {
            tracing::debug!(conn = %session.id(), pair = %packet_cid, "dialback key missing");
            manager.fail_stream(session, "bad-request", false);
            return;
        };

        session.set_phase(DialbackPhase::AwaitingVerify);
        if let Err(e) = manager.send_verify_request(packet_cid, session.session_id(), key) {
            tracing::warn!(conn = %session.id(), pair = %packet_cid, "cannot reach authoritative server: {}", e);
            let reply = stanzas::result_reply(
                packet_cid.local(),
                packet_cid.remote(),
                StanzaType::Error,
                Some(stanzas::stanza_error("cancel", "remote-server-not-found")),
            );
            send_reply(session, reply);
        }
    }
}

impl Default for Dialback {
    fn default() -> Self {
        Self::new(AuthenticationWatchdog::default(), true)
    }
}

impl S2SProcessor for Dialback {
    fn name(&self) -> &'static str {
        "dialback"
    }

    fn order(&self) -> ProcessorOrder {
        ProcessorOrder::Dialback
    }

    fn process(&self, manager: &ConnectionManager, session: &Arc<S2SSession>, stanza: &Element) -> bool {
        if let Some(kind) = DialbackKind::of(stanza) {
            self.process_dialback(manager, session, kind, stanza);
            return true;
        }
        if session.role() == ConnectionRole::Outbound && stanzas::is_stream_features(stanza) {
            return self.process_features(manager, session, stanza);
        }
        false
    }

    fn stream_opened(
        &self,
        manager: &ConnectionManager,
        session: &Arc<S2SSession>,
        attrs: &StreamAttributes,
    ) -> Option<String> {
        match session.role() {
            ConnectionRole::Inbound => session.set_phase(DialbackPhase::AwaitingKey),
            ConnectionRole::Outbound if attrs.contains_key("version") => {
                session.set_phase(DialbackPhase::AwaitingFeatures)
            }
            ConnectionRole::Outbound => self.init_dialback(manager, session),
        }
        None
    }

    fn stream_features(&self, _manager: &ConnectionManager, session: &Arc<S2SSession>) -> Vec<Element> {
        if session.role() == ConnectionRole::Inbound && !session.is_authenticated() {
            vec![stanzas::dialback_feature()]
        } else {
            Vec::new()
        }
    }

    fn service_started(&self, manager: &ConnectionManager, session: &Arc<S2SSession>) {
        self.watchdog.arm(manager.timer(), session);
    }
}

/// Originating server: the receiver's verdict on our key.
fn receive_result(session: &Arc<S2SSession>, entry: &TrustEntry, outcome: StanzaType) {
    let pair = entry.pair();
    match outcome {
        StanzaType::Valid => {
            if session.take_requested_result(pair.remote()) {
                entry.connection_authenticated(session);
            } else {
                tracing::warn!(conn = %session.id(), %pair, "ignoring valid result for a key we did not send");
            }
        }
        StanzaType::Invalid | StanzaType::Error => {
            tracing::info!(conn = %session.id(), %pair, outcome = outcome.as_str(), "dialback key rejected by peer");
            session.stop();
        }
    }
}

/// Authoritative server: recompute the key and answer on the same connection.
fn answer_verify(manager: &ConnectionManager, session: &Arc<S2SSession>, pair: &DomainPairId, stanza: &Element) {
    let Some(stream_id) = stanza.attr("id") else {
        manager.fail_stream(session, "bad-request", false);
        return;
    };
    let presented = stanza.cdata().unwrap_or_default();
    let valid = match manager.secret_for(pair.local()) {
        Ok(secret) => keys_match(
            &generate_dialback_key(pair.local(), pair.remote(), &secret, stream_id),
            presented,
        ),
        Err(e) => {
            tracing::debug!(conn = %session.id(), %pair, "no secret for verify request: {}", e);
            false
        }
    };
    tracing::debug!(conn = %session.id(), %pair, stream_id, valid, "answering verify request");
    send_reply(
        session,
        stanzas::verify_reply(pair.local(), pair.remote(), stream_id, valid),
    );
}

/// Receiving server: the authoritative server's answer. Relays the verdict
/// to the inbound connection that presented the key. A handshake-only relay
/// is closed after its reply whatever the reply said.
fn receive_verify_reply(session: &Arc<S2SSession>, entry: &TrustEntry, stanza: &Element, outcome: StanzaType) {
    relay_verdict(session, entry, stanza, outcome);
    if session.is_handshaking_only() {
        tracing::debug!(conn = %session.id(), pair = %entry.pair(), "verify relay finished");
        session.stop();
    }
}

fn relay_verdict(session: &S2SSession, entry: &TrustEntry, stanza: &Element, outcome: StanzaType) {
    let pair = entry.pair();
    let Some(stream_id) = stanza.attr("id") else {
        tracing::warn!(conn = %session.id(), %pair, "verify reply without id ignored");
        return;
    };
    if !session.take_requested_verify(pair.remote(), stream_id) {
        tracing::warn!(conn = %session.id(), %pair, stream_id, "ignoring unsolicited verify reply");
        return;
    }

    let valid = outcome == StanzaType::Valid;
    let target = if valid {
        entry.connection_authenticated_by_session(stream_id)
    } else {
        entry.incoming_by_session(stream_id)
    };
    let Some(target) = target else {
        tracing::warn!(%pair, stream_id, "connection awaiting verification is gone");
        return;
    };
    if !valid {
        tracing::info!(conn = %target.id(), %pair, "peer key failed verification");
    }
    send_reply(
        &target,
        stanzas::result_reply(pair.local(), pair.remote(), StanzaType::from_outcome(valid), None),
    );
}

fn send_reply(session: &S2SSession, reply: Element) {
    if let Err(e) = session.link().send_packet(reply) {
        tracing::warn!(conn = %session.id(), "failed to send dialback reply: {}", e);
    }
}
