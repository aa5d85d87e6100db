//! Shared types, error definitions, and constants for the Parley S2S layer.
//!
//! This crate provides the leaf value types used across all Parley crates:
//! the domain-pair identifier that keys all trust state, the minimal stanza
//! element model the protocol core reads and writes, and the small enums that
//! describe a connection (its role, its TLS verdict, the `type` attribute of a
//! dialback stanza).
//!
//! No crate in the workspace depends on anything *except* `parley-types` for
//! cross-cutting type definitions.

mod domain;
mod element;

pub use domain::{domain_of, normalize_domain, DomainError, DomainPairId};
pub use element::{escape_xml, Element};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace of the server-to-server dialback protocol (`db:` prefix).
pub const NS_DIALBACK: &str = "jabber:server:dialback";

/// Namespace of the dialback stream feature.
pub const NS_DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";

/// Namespace of the stream envelope (`stream:` prefix).
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// Namespace of STARTTLS negotiation.
pub const NS_STARTTLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// Namespace of stream-level error conditions.
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Namespace of stanza-level error conditions.
pub const NS_STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Default namespace of server-to-server streams.
pub const NS_SERVER: &str = "jabber:server";

/// Which side of a physical connection this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    /// We opened the connection (we are the initiator / originating server).
    Outbound,
    /// The remote opened the connection (we are the acceptor).
    Inbound,
}

impl ConnectionRole {
    /// Returns the string label for this role.
    pub fn label(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of the TLS certificate check on a connection.
///
/// `Unknown` means no TLS handshake result has been recorded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CertTrust {
    /// No TLS result is available for the connection.
    #[default]
    Unknown,
    /// TLS is active but the peer certificate could not be fully trusted.
    Untrusted,
    /// TLS is active and the peer certificate chains to a trusted root and
    /// matches the remote domain.
    Trusted,
}

/// Value of the `type` attribute on a dialback reply stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaType {
    /// The key was verified.
    Valid,
    /// The key did not verify.
    Invalid,
    /// The request was refused with an embedded error.
    Error,
}

impl StanzaType {
    /// Parses the `type` attribute value. Unknown values map to `Error`, so a
    /// malformed reply is never mistaken for a positive one.
    pub fn parse(value: &str) -> Self {
        match value {
            "valid" => Self::Valid,
            "invalid" => Self::Invalid,
            _ => Self::Error,
        }
    }

    /// Returns the wire form of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Error => "error",
        }
    }

    /// Maps a verification outcome to `valid`/`invalid`.
    pub fn from_outcome(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}
