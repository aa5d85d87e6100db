//! Background tasks for the Parley server.
//!
//! Includes:
//! - Draining transport commands issued by the trust core.

use crate::transport::{ChannelTransport, TransportCommand};
use parley_dialback::{ConnectionManager, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Starts the transport command loop.
///
/// Runs until every sender is dropped. Closes are reported back to the
/// manager so trust state follows connection lifetime. No socket dialer is
/// attached to this process, so outbound connection requests are failed
/// immediately.
pub async fn start_transport_task(
    manager: Arc<ConnectionManager>,
    transport: Arc<ChannelTransport>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
) {
    tracing::info!("starting transport command task");

    while let Some(command) = commands.recv().await {
        match command {
            TransportCommand::Write { conn, packets } => {
                for packet in &packets {
                    tracing::trace!(%conn, %packet, "outgoing s2s element");
                }
            }
            TransportCommand::Connect { conn, pair } => {
                tracing::warn!(%conn, %pair, "no outbound dialer attached, failing connection");
                transport.force_stop(conn);
            }
            TransportCommand::Close { conn, force } => {
                tracing::debug!(%conn, force, "connection closed");
                manager.connection_closed(conn);
            }
        }
    }

    tracing::info!("transport command task stopped");
}
