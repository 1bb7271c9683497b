//! Control channel client.
//!
//! Decodes the stream of control messages and spawns the matching data
//! forwarder for each `start_transport` command. Unknown commands and
//! unknown transport tags are ignored; forwarders keep running even after
//! the control connection drops.

use passage_core::error::RelayResult;
use passage_core::protocol::{JsonStreamDecoder, Transport, CMD_START_TRANSPORT};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::forwarder;

pub async fn run(conn: TcpStream, config: Arc<ClientConfig>) -> RelayResult<()> {
    let mut decoder = JsonStreamDecoder::new(conn);

    loop {
        let message = match decoder.next_message().await? {
            Some(message) => message,
            None => return Ok(()),
        };
        info!("Received command '{}'", message.command);

        if message.command != CMD_START_TRANSPORT {
            debug!("Ignoring unknown command '{}'", message.command);
            continue;
        }

        let transport_config = match message.transport_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring undecodable transport payload: {}", e);
                continue;
            }
        };

        match Transport::parse(&transport_config.protocol) {
            Some(transport) => {
                info!(
                    "Starting {} forwarder for remote port {}",
                    transport, transport_config.port
                );
                forwarder::spawn(transport, transport_config.port, config.clone());
            }
            None => debug!(
                "Ignoring unknown transport '{}'",
                transport_config.protocol
            ),
        }
    }
}
