//! Pluggable stanza processors.
//!
//! The manager offers every inbound element to its processors in ascending
//! [`ProcessorOrder`]; the first one returning `true` consumes it.

use crate::manager::ConnectionManager;
use crate::session::S2SSession;
use parley_types::Element;
use std::collections::HashMap;
use std::sync::Arc;

/// Attributes of a received stream header.
pub type StreamAttributes = HashMap<String, String>;

/// Position of a processor in the chain. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessorOrder {
    /// Stream-level errors must be seen before anything else.
    StreamError = 0,
    /// Server dialback.
    Dialback = 10,
}

/// A step in the S2S element pipeline.
///
/// Processors hold no per-connection state; they read and update the
/// [`S2SSession`] they are handed.
pub trait S2SProcessor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn order(&self) -> ProcessorOrder;

    /// Handles `stanza`. Returns `true` if it was consumed.
    fn process(&self, manager: &ConnectionManager, session: &Arc<S2SSession>, stanza: &Element) -> bool;

    /// Called once the peer's stream header was parsed. Returned text is
    /// written to the connection after our own stream header.
    fn stream_opened(
        &self,
        _manager: &ConnectionManager,
        _session: &Arc<S2SSession>,
        _attrs: &StreamAttributes,
    ) -> Option<String> {
        None
    }

    /// Elements contributed to the `<stream:features>` we advertise.
    fn stream_features(&self, _manager: &ConnectionManager, _session: &Arc<S2SSession>) -> Vec<Element> {
        Vec::new()
    }

    /// Called when the transport started servicing the connection.
    fn service_started(&self, _manager: &ConnectionManager, _session: &Arc<S2SSession>) {}
}
