//! Server-to-server trust for Parley.
//!
//! Establishes and tracks which remote domains may exchange traffic with
//! which local domains. Trust is negotiated per domain pair with server
//! dialback: the receiving server checks a key presented by the originating
//! server by asking the originator's authoritative server over a separate
//! connection. Until a pair is trusted, only protocol control stanzas flow;
//! once trusted, every queued control stanza on every link of the pair is
//! flushed and application traffic may be routed.
//!
//! Socket I/O, XML parsing, TLS and secret storage are provided by the
//! embedding server through the traits in [`ports`].

pub mod dialback;
pub mod error;
pub mod key;
pub mod manager;
pub mod peer_link;
pub mod ports;
pub mod processor;
pub mod registry;
pub mod session;
pub mod stanzas;
pub mod stream_error;
mod sync;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use dialback::Dialback;
pub use error::{DialbackError, TransportError};
pub use key::{generate_dialback_key, keys_match};
pub use manager::{ConnectionManager, S2SConfig};
pub use peer_link::PeerLink;
pub use ports::{DomainDirectory, TimerService, TimerTask, TokioTimer, Transport};
pub use processor::{ProcessorOrder, S2SProcessor, StreamAttributes};
pub use registry::{TrustEntry, TrustRegistry};
pub use session::{ConnectionId, DialbackPhase, S2SSession};
pub use stream_error::StreamErrorProcessor;
pub use watchdog::{AuthenticationWatchdog, DEFAULT_AUTH_TIMEOUT};
