use crate::manager::ConnectionManager;
use crate::processor::{ProcessorOrder, S2SProcessor};
use crate::session::S2SSession;
use crate::stanzas;
use parley_types::Element;
use std::sync::Arc;

/// Terminates a connection on receipt of a stream-level error.
#[derive(Debug, Default)]
pub struct StreamErrorProcessor;

impl S2SProcessor for StreamErrorProcessor {
    fn name(&self) -> &'static str {
        "stream-error"
    }

    fn order(&self) -> ProcessorOrder {
        ProcessorOrder::StreamError
    }

    fn process(&self, _manager: &ConnectionManager, session: &Arc<S2SSession>, stanza: &Element) -> bool {
        if !stanzas::is_stream_error(stanza) {
            return false;
        }
        let condition = stanza
            .children()
            .first()
            .map(|c| c.local_name().to_string())
            .unwrap_or_default();
        tracing::info!(conn = %session.id(), condition, "peer sent stream error, closing");
        session.stop();
        true
    }
}
