//! Per-connection control event loop
//!
//! Each accepted control connection gets one task running
//! [`serve_control_connection`]: it processes `createTunnel` claims in
//! arrival order and releases the claim when the connection ends.

use std::sync::Arc;

use tracing::{debug, info, warn};

use burrow_mux::ControlConnection;
use burrow_proto::ControlEvent;

use crate::registry::{ClaimError, ClientName, ClientRegistry};

/// Drive one control connection until it disconnects.
pub async fn serve_control_connection(
    connection: Arc<ControlConnection>,
    registry: Arc<ClientRegistry>,
) {
    let peer = connection.remote_address();
    debug!("tunnel client connected from {}", peer);

    let mut claimed: Option<ClientName> = None;

    while let Some(event) = connection.next_event().await {
        match event {
            ControlEvent::CreateTunnel(requested) => {
                if claimed.is_some() {
                    // A connection keeps its first claim for life
                    continue;
                }
                match registry.claim(&requested, connection.clone()) {
                    Ok(name) => {
                        info!("{} registered successfully", name);
                        claimed = Some(name);
                    }
                    Err(ClaimError::BadName(_)) => {
                        info!("{} -- bad subdomain. disconnecting client.", requested);
                        connection.close();
                        break;
                    }
                    Err(ClaimError::Taken) => {
                        info!(
                            "{} requested but already claimed. disconnecting client.",
                            requested
                        );
                        connection.close();
                        break;
                    }
                }
            }
            ControlEvent::IncomingClient(_) => {
                warn!("client sent a server-only event, ignoring");
            }
        }
    }

    if let Some(name) = claimed {
        registry.release(&name, connection.connection_id());
        info!("{} unregistered", name);
    }
    debug!("control connection from {} ended", peer);
}
