//! Control channel and operator transport selection.
//!
//! The server accepts exactly one control client, asks the operator to pick
//! a transport on stdin, starts the matching data listener and sends a
//! single `start_transport` command. The control connection then stays open
//! as a liveness signal; no further commands are defined.

use anyhow::{Context, Result};
use passage_core::protocol::{Message, Transport, TransportConfig};
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::registry::ListenerRegistry;
use crate::transport;

pub async fn run(config: Arc<ServerConfig>, registry: Arc<ListenerRegistry>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.control_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind control port {}", addr))?;
    info!(
        "Waiting for control client to connect on {}",
        config.control_port
    );

    let (mut conn, peer) = listener
        .accept()
        .await
        .context("accept control client")?;
    info!("Control client connected from {}", peer);

    let selected = prompt_transport().await?;
    let port = config.data_port(selected);
    info!("Operator selected {}, sending command to client", selected);

    transport::spawn(selected, config.clone(), &registry);

    let message = Message::start_transport(&TransportConfig {
        protocol: selected.as_str().to_string(),
        port,
    })?;
    conn.write_all(&serde_json::to_vec(&message)?).await?;
    info!("{} command sent, data listener is running", selected);

    // park; the open control connection is the liveness signal
    std::future::pending::<()>().await;
    Ok(())
}

/// Print the transport menu and read the operator's choice from stdin.
async fn prompt_transport() -> Result<Transport> {
    println!("\n--- Transport Protocol Selection ---");
    for (i, transport) in Transport::ALL.iter().enumerate() {
        println!("{}. {}", i + 1, transport.menu_label());
    }
    print!("Enter your choice: ");
    std::io::stdout().flush()?;

    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .context("stdin reader failed")??;

    Transport::from_menu_choice(&line).context("invalid transport selection")
}
