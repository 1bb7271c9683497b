//! Client-side data forwarders.
//!
//! Each forwarder binds the local listen address and carries accepted
//! traffic to the server's data listener over the chosen transport. Mux
//! transports dial a single carrier up front and open one logical stream
//! per local connection.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use passage_core::buffer::{BufferPool, UDP_BUFFER_SIZE, WS_BUFFER_SIZE};
use passage_core::protocol::Transport;
use passage_core::relay::relay_bidirectional;
use passage_core::udp::SessionTable;
use passage_core::ws::WsByteStream;
use passage_core::MuxSession;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio_kcp::KcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{
    connect_async_tls_with_config, connect_async_with_config, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::tls;

type WsCarrier = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawn the client role for `transport` with the announced data port.
pub fn spawn(transport: Transport, port: String, config: Arc<ClientConfig>) {
    tokio::spawn(async move {
        let result = match transport {
            Transport::Tcp => run_tcp(port, config).await,
            Transport::Udp => run_udp(port, config).await,
            Transport::Ws | Transport::Wss => run_ws(transport, port, config).await,
            Transport::TcpMux | Transport::WsMux | Transport::WssMux | Transport::UtcpMux => {
                run_mux(transport, port, config).await
            }
        };
        if let Err(e) = result {
            error!("{} forwarder failed: {:#}", transport, e);
        }
    });
}

async fn run_tcp(port: String, config: Arc<ClientConfig>) -> Result<()> {
    let listener = bind_local(&config).await?;
    let remote = config.remote_addr(&port);
    info!("tcp forwarder listening on {}", config.local_listen_port);

    loop {
        let (local, _) = listener.accept().await?;
        let remote = remote.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&remote).await {
                Ok(carrier) => relay_bidirectional(local, carrier).await,
                Err(_) => {} // dropping the local connection closes it
            }
        });
    }
}

async fn run_udp(port: String, config: Arc<ClientConfig>) -> Result<()> {
    let socket = UdpSocket::bind(&config.local_listen_port)
        .await
        .with_context(|| format!("bind {}", config.local_listen_port))?;
    let remote = resolve(&config.remote_addr(&port)).await?;
    info!("udp forwarder listening on {}", config.local_listen_port);

    let socket = Arc::new(socket);
    let sessions: Arc<SessionTable<Arc<UdpSocket>>> = Arc::new(SessionTable::new());
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let key = peer.to_string();

        let upstream = match sessions.get(&key) {
            Some(upstream) => upstream,
            None => {
                let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let upstream = match UdpSocket::bind(bind_addr).await {
                    Ok(socket) => socket,
                    Err(_) => continue,
                };
                if upstream.connect(remote).await.is_err() {
                    continue;
                }
                let upstream = Arc::new(upstream);
                sessions.insert(key.clone(), upstream.clone());
                tokio::spawn(pump_remote_to_peer(
                    upstream.clone(),
                    socket.clone(),
                    peer,
                    sessions.clone(),
                    key.clone(),
                ));
                upstream
            }
        };

        // best-effort; the reader task tears the session down on error
        let _ = upstream.send(&buf[..n]).await;
    }
}

async fn pump_remote_to_peer(
    remote: Arc<UdpSocket>,
    local: Arc<UdpSocket>,
    peer: SocketAddr,
    sessions: Arc<SessionTable<Arc<UdpSocket>>>,
    key: String,
) {
    let mut buf = BufferPool::global().acquire();
    loop {
        match remote.recv(&mut buf[..]).await {
            Ok(n) => {
                let _ = local.send_to(&buf[..n], peer).await;
            }
            Err(_) => break,
        }
    }
    sessions.remove(&key);
}

async fn run_ws(transport: Transport, port: String, config: Arc<ClientConfig>) -> Result<()> {
    let listener = bind_local(&config).await?;
    let url = ws_url(transport, &config.remote_server_ip, &port)?;
    info!("{} forwarder listening on {}", transport, config.local_listen_port);

    loop {
        let (local, _) = listener.accept().await?;
        let url = url.clone();
        tokio::spawn(async move {
            match dial_ws(transport, &url).await {
                Ok(carrier) => relay_ws_direct(local, carrier).await,
                Err(_) => {} // dropping the local connection closes it
            }
        });
    }
}

async fn run_mux(transport: Transport, port: String, config: Arc<ClientConfig>) -> Result<()> {
    let session = dial_mux_carrier(transport, &port, &config).await?;
    let session = Arc::new(session);

    let listener = bind_local(&config).await?;
    info!(
        "{} forwarder listening on {} (single carrier)",
        transport, config.local_listen_port
    );

    loop {
        let (local, _) = listener.accept().await?;
        let session = session.clone();
        tokio::spawn(async move {
            match session.open_stream().await {
                Ok(stream) => relay_bidirectional(local, stream).await,
                // the shared session stays usable; only this connection dies
                Err(e) => debug!("mux stream open failed: {}", e),
            }
        });
    }
}

/// Dial the carrier for a mux transport and build the client session.
async fn dial_mux_carrier(
    transport: Transport,
    port: &str,
    config: &ClientConfig,
) -> Result<MuxSession> {
    use tokio_util::compat::TokioAsyncReadCompatExt;

    match transport {
        Transport::TcpMux => {
            let carrier = TcpStream::connect(&config.remote_addr(port))
                .await
                .context("dial tcpmux carrier")?;
            Ok(MuxSession::client(carrier.compat()))
        }
        Transport::WsMux | Transport::WssMux => {
            let url = ws_url(transport, &config.remote_server_ip, port)?;
            let carrier = dial_ws(transport, &url).await?;
            Ok(MuxSession::client(WsByteStream::new(carrier).compat()))
        }
        Transport::UtcpMux => {
            let remote = resolve(&config.remote_addr(port)).await?;
            let kcp_config = config.kcp_config.to_kcp_config();
            let carrier = KcpStream::connect(&kcp_config, remote)
                .await
                .context("dial kcp carrier")?;
            Ok(MuxSession::client(carrier.compat()))
        }
        _ => bail!("{} is not a mux transport", transport),
    }
}

/// Direct frame relay between a local TCP connection and a WebSocket carrier.
async fn relay_ws_direct(local: TcpStream, carrier: WsCarrier) {
    let (mut local_read, mut local_write) = local.into_split();
    let (mut ws_tx, mut ws_rx) = carrier.split();

    let outbound = async {
        let mut buf = BufferPool::global().acquire();
        loop {
            match local_read.read(&mut buf[..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(WsMsg::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let WsMsg::Binary(data) = msg {
                if local_write.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
}

fn ws_url(transport: Transport, host: &str, port: &str) -> Result<String> {
    let path = transport.ws_path().context("not a websocket transport")?;
    let scheme = if transport.uses_tls() { "wss" } else { "ws" };
    Ok(format!("{}://{}:{}{}", scheme, host, port, path))
}

async fn dial_ws(transport: Transport, url: &str) -> Result<WsCarrier> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.write_buffer_size = WS_BUFFER_SIZE;

    let carrier = if transport.uses_tls() {
        let connector = Connector::Rustls(tls::insecure_client_config());
        let (carrier, _) =
            connect_async_tls_with_config(url, Some(ws_config), false, Some(connector))
                .await
                .with_context(|| format!("dial {}", url))?;
        carrier
    } else {
        let (carrier, _) = connect_async_with_config(url, Some(ws_config), false)
            .await
            .with_context(|| format!("dial {}", url))?;
        carrier
    };
    Ok(carrier)
}

async fn bind_local(config: &ClientConfig) -> Result<TcpListener> {
    TcpListener::bind(&config.local_listen_port)
        .await
        .with_context(|| format!("bind {}", config.local_listen_port))
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .with_context(|| format!("resolve {}", addr))?
        .next()
        .with_context(|| format!("no address for {}", addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_urls() {
        assert_eq!(
            ws_url(Transport::Ws, "203.0.113.5", "7003").unwrap(),
            "ws://203.0.113.5:7003/ws"
        );
        assert_eq!(
            ws_url(Transport::WsMux, "203.0.113.5", "7005").unwrap(),
            "ws://203.0.113.5:7005/wsmux"
        );
        assert_eq!(
            ws_url(Transport::Wss, "example.com", "7006").unwrap(),
            "wss://example.com:7006/wss"
        );
        assert_eq!(
            ws_url(Transport::WssMux, "example.com", "7007").unwrap(),
            "wss://example.com:7007/wssmux"
        );
        assert!(ws_url(Transport::Tcp, "example.com", "7001").is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }
}
