//! Server-side data transports.
//!
//! Each transport listens on its configured data port and funnels traffic
//! into the upstream inbound address. Mux transports host many logical
//! streams per carrier; `udp` bridges datagrams onto a TCP upstream.

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMsg, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
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
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_kcp::KcpListener;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::registry::ListenerRegistry;
use crate::tls;

/// Spawn the server role for `transport` and register it for shutdown.
pub fn spawn(transport: Transport, config: Arc<ServerConfig>, registry: &ListenerRegistry) {
    let handle = tokio::spawn(async move {
        let result = match transport {
            Transport::Tcp => run_tcp(config).await,
            Transport::Udp => run_udp(config).await,
            Transport::TcpMux => run_tcpmux(config).await,
            Transport::UtcpMux => run_kcpmux(config).await,
            Transport::Ws | Transport::WsMux | Transport::Wss | Transport::WssMux => {
                run_ws(transport, config).await
            }
        };
        // a failing listener is logged and skipped; siblings keep running
        if let Err(e) = result {
            error!("{} listener failed: {}", transport, e);
        }
    });
    registry.register(transport.as_str(), handle.abort_handle());
}

async fn run_tcp(config: Arc<ServerConfig>) -> Result<()> {
    let addr = config.data_addr(Transport::Tcp);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("tcp data listener on {}", addr);
    serve_tcp(listener, config.xray_inbound_address.clone()).await
}

pub(crate) async fn serve_tcp(listener: TcpListener, upstream: String) -> Result<()> {
    loop {
        let (conn, _) = listener.accept().await?;
        let upstream = upstream.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&upstream).await {
                Ok(up) => relay_bidirectional(conn, up).await,
                Err(_) => {} // dropping the accepted connection closes it
            }
        });
    }
}

type UdpUpstream = Arc<Mutex<OwnedWriteHalf>>;

async fn run_udp(config: Arc<ServerConfig>) -> Result<()> {
    let addr = config.data_addr(Transport::Udp);
    let socket = UdpSocket::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("udp data listener on {}", addr);
    serve_udp(socket, config.xray_inbound_address.clone()).await
}

/// Demultiplex datagrams onto per-source TCP connections to the upstream.
///
/// Message boundaries are lost on the TCP leg; the upstream consumes the
/// bytes as an opaque stream.
pub(crate) async fn serve_udp(socket: UdpSocket, upstream: String) -> Result<()> {
    let socket = Arc::new(socket);
    let sessions: Arc<SessionTable<UdpUpstream>> = Arc::new(SessionTable::new());
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let key = peer.to_string();

        let writer = match sessions.get(&key) {
            Some(writer) => writer,
            None => {
                let up = match TcpStream::connect(&upstream).await {
                    Ok(conn) => conn,
                    Err(_) => continue,
                };
                let (read_half, write_half) = up.into_split();
                let writer = Arc::new(Mutex::new(write_half));
                sessions.insert(key.clone(), writer.clone());
                tokio::spawn(pump_upstream_to_peer(
                    read_half,
                    socket.clone(),
                    peer,
                    sessions.clone(),
                    key.clone(),
                ));
                writer
            }
        };

        // best-effort; the reader task tears the session down on upstream EOF
        let _ = writer.lock().await.write_all(&buf[..n]).await;
    }
}

async fn pump_upstream_to_peer(
    mut upstream: OwnedReadHalf,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    sessions: Arc<SessionTable<UdpUpstream>>,
    key: String,
) {
    let mut buf = BufferPool::global().acquire();
    loop {
        match upstream.read(&mut buf[..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        }
    }
    sessions.remove(&key);
}

async fn run_tcpmux(config: Arc<ServerConfig>) -> Result<()> {
    let addr = config.data_addr(Transport::TcpMux);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("tcpmux data listener on {}", addr);
    serve_tcpmux(listener, config.xray_inbound_address.clone()).await
}

pub(crate) async fn serve_tcpmux(listener: TcpListener, upstream: String) -> Result<()> {
    loop {
        let (conn, _) = listener.accept().await?;
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let session = MuxSession::server(conn.compat());
            accept_mux_streams(session, upstream).await;
        });
    }
}

/// Accept logical streams for as long as the session lives, relaying each
/// against a freshly dialed upstream connection.
async fn accept_mux_streams(session: MuxSession, upstream: String) {
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&upstream).await {
                        Ok(up) => relay_bidirectional(stream, up).await,
                        Err(_) => {} // dropping the stream closes it
                    }
                });
            }
            Err(e) => {
                debug!("mux session ended: {}", e);
                return;
            }
        }
    }
}

async fn run_kcpmux(config: Arc<ServerConfig>) -> Result<()> {
    let addr: SocketAddr = config
        .data_addr(Transport::UtcpMux)
        .parse()
        .context("invalid utcpmux listen address")?;
    let kcp_config = config.kcp_config.to_kcp_config();
    let mut listener = KcpListener::bind(kcp_config, addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("utcpmux data listener on {}", addr);

    let upstream = config.xray_inbound_address.clone();
    loop {
        let (conn, _peer) = listener.accept().await?;
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let session = MuxSession::server(conn.compat());
            accept_mux_streams(session, upstream).await;
        });
    }
}

struct WsState {
    upstream: String,
    mux: bool,
}

async fn run_ws(transport: Transport, config: Arc<ServerConfig>) -> Result<()> {
    let path = transport.ws_path().context("not a websocket transport")?;
    let state = Arc::new(WsState {
        upstream: config.xray_inbound_address.clone(),
        mux: transport.uses_mux(),
    });
    let app = Router::new().route(path, get(ws_handler)).with_state(state);

    let addr = config.data_addr(transport);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;

    if transport.uses_tls() {
        info!("{} data listener on {} (TLS)", transport, addr);
        tls::serve_with_tls(listener, app, &config.tls_cert_path, &config.tls_key_path).await
    } else {
        info!("{} data listener on {}", transport, addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn ws_handler(
    State(state): State<Arc<WsState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.write_buffer_size(WS_BUFFER_SIZE)
        .on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<WsState>) {
    if state.mux {
        let session = MuxSession::server(WsByteStream::new(socket).compat());
        accept_mux_streams(session, state.upstream.clone()).await;
    } else {
        relay_ws_direct(socket, &state.upstream).await;
    }
}

/// Direct frame relay between a WebSocket and a fresh upstream connection.
///
/// One direction unwraps binary frames onto the upstream stream; the other
/// sends each upstream read as a single binary frame.
async fn relay_ws_direct(socket: WebSocket, upstream: &str) {
    let up = match TcpStream::connect(upstream).await {
        Ok(conn) => conn,
        Err(_) => return,
    };
    let (mut up_read, mut up_write) = up.into_split();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let WsMsg::Binary(data) = msg {
                if up_write.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    };

    let outbound = async {
        let mut buf = BufferPool::global().acquire();
        loop {
            match up_read.read(&mut buf[..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(WsMsg::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::relay::copy_half;

    async fn spawn_echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (conn, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (read, write) = tokio::io::split(conn);
                    let _ = copy_half(read, write).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_listener_relays_to_upstream() {
        let upstream = spawn_echo_upstream().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(listener, upstream));

        let mut client = TcpStream::connect(data_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn test_udp_sessions_route_replies_to_their_source() {
        let upstream = spawn_echo_upstream().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data_addr = socket.local_addr().unwrap();
        tokio::spawn(serve_udp(socket, upstream));

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        first.send_to(b"A", data_addr).await.unwrap();
        second.send_to(b"B", data_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = first.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"A");
        assert_eq!(from, data_addr);

        let (n, _) = second.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"B");
    }

    #[tokio::test]
    async fn test_tcpmux_carries_parallel_streams() {
        let upstream = spawn_echo_upstream().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcpmux(listener, upstream));

        // one carrier connection, many logical streams
        let carrier = TcpStream::connect(data_addr).await.unwrap();
        let session = Arc::new(MuxSession::client(carrier.compat()));

        let mut workers = Vec::new();
        for i in 0..10u8 {
            let session = session.clone();
            workers.push(tokio::spawn(async move {
                let mut stream = session.open_stream().await.unwrap();
                let payload = [i; 32];
                stream.write_all(&payload).await.unwrap();
                stream.flush().await.unwrap();
                let mut got = [0u8; 32];
                stream.read_exact(&mut got).await.unwrap();
                assert_eq!(got, payload);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
