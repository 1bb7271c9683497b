//! Mux session layer.
//!
//! Hosts many logical streams over a single carrier byte stream via yamux.
//! The server side accepts streams, the client side opens one per local
//! connection. A background task owns the yamux connection and drives its
//! I/O; dropping the session aborts the driver, which terminates the carrier
//! and every stream on it.

use std::task::Poll;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::{debug, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode, Stream as YamuxStream};

use crate::error::{RelayError, RelayResult};

/// A logical stream, viewed through tokio's I/O traits for the relay.
pub type MuxStream = Compat<YamuxStream>;

struct OutboundRequest {
    response_tx: oneshot::Sender<RelayResult<YamuxStream>>,
}

/// One carrier connection hosting multiplexed logical streams.
pub struct MuxSession {
    inbound_rx: Mutex<mpsc::Receiver<YamuxStream>>,
    outbound_tx: mpsc::Sender<OutboundRequest>,
    driver: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    /// Build the client side of a session: local connections open streams.
    pub fn client<I>(io: I) -> Self
    where
        I: futures_util::io::AsyncRead + futures_util::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Mode::Client)
    }

    /// Build the server side of a session: streams are accepted as the peer
    /// opens them.
    pub fn server<I>(io: I) -> Self
    where
        I: futures_util::io::AsyncRead + futures_util::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Mode::Server)
    }

    fn new<I>(io: I, mode: Mode) -> Self
    where
        I: futures_util::io::AsyncRead + futures_util::io::AsyncWrite + Unpin + Send + 'static,
    {
        let connection = YamuxConnection::new(io, YamuxConfig::default(), mode);
        let (inbound_tx, inbound_rx) = mpsc::channel::<YamuxStream>(32);
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundRequest>(32);
        let driver = tokio::spawn(drive(connection, inbound_tx, outbound_rx));

        Self {
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            driver,
        }
    }

    /// Open a new logical stream toward the peer.
    pub async fn open_stream(&self) -> RelayResult<MuxStream> {
        let (response_tx, response_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundRequest { response_tx })
            .await
            .map_err(|_| RelayError::mux("session driver gone"))?;

        let stream = response_rx
            .await
            .map_err(|_| RelayError::mux("session driver gone"))??;
        Ok(stream.compat())
    }

    /// Wait for the peer to open the next logical stream.
    pub async fn accept_stream(&self) -> RelayResult<MuxStream> {
        let stream = {
            let mut rx = self.inbound_rx.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| RelayError::mux("session closed"))?
        };
        Ok(stream.compat())
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Background driver owning the yamux connection.
///
/// `poll_next_inbound` must be polled continuously to drive all connection
/// I/O; outbound opens are funneled through the same task to avoid the
/// open/accept deadlock.
async fn drive<I>(
    mut connection: YamuxConnection<I>,
    inbound_tx: mpsc::Sender<YamuxStream>,
    mut outbound_rx: mpsc::Receiver<OutboundRequest>,
) where
    I: futures_util::io::AsyncRead + futures_util::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut pending_outbound: Vec<OutboundRequest> = Vec::new();

    let reason = std::future::poll_fn(|cx| {
        loop {
            let mut progress = false;

            loop {
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(stream))) => {
                        if inbound_tx.try_send(stream).is_err() {
                            warn!("mux driver: inbound channel full or closed");
                        }
                        progress = true;
                        continue;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        return Poll::Ready(format!("session error: {}", e));
                    }
                    Poll::Ready(None) => {
                        return Poll::Ready("carrier closed by peer".to_string());
                    }
                    Poll::Pending => break,
                }
            }

            while let Poll::Ready(Some(req)) = outbound_rx.poll_recv(cx) {
                pending_outbound.push(req);
                progress = true;
            }

            while !pending_outbound.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        let req = pending_outbound.swap_remove(0);
                        let _ = req.response_tx.send(Ok(stream));
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => {
                        let req = pending_outbound.swap_remove(0);
                        let _ = req
                            .response_tx
                            .send(Err(RelayError::mux(format!("open failed: {}", e))));
                        progress = true;
                    }
                    Poll::Pending => break,
                }
            }

            if !progress {
                break;
            }
        }

        if outbound_rx.is_closed() && pending_outbound.is_empty() && inbound_tx.is_closed() {
            return Poll::Ready("all handles dropped".to_string());
        }

        Poll::Pending
    })
    .await;

    debug!("mux driver ended: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay_bidirectional;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    #[tokio::test]
    async fn test_parallel_streams_over_one_carrier() {
        let (client_io, server_io) = duplex(64 * 1024);
        let client = std::sync::Arc::new(MuxSession::client(client_io.compat()));
        let server = MuxSession::server(server_io.compat());

        // server side: echo every accepted stream
        let acceptor = tokio::spawn(async move {
            while let Ok(stream) = server.accept_stream().await {
                tokio::spawn(async move {
                    let (read, write) = tokio::io::split(stream);
                    let _ = crate::relay::copy_half(read, write).await;
                });
            }
        });

        let mut workers = Vec::new();
        for i in 0..8u8 {
            let client = client.clone();
            workers.push(tokio::spawn(async move {
                let mut stream = client.open_stream().await.unwrap();
                let payload = vec![i; 1024];
                stream.write_all(&payload).await.unwrap();
                stream.flush().await.unwrap();

                let mut got = vec![0u8; 1024];
                stream.read_exact(&mut got).await.unwrap();
                assert_eq!(got, payload);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        drop(client);
        acceptor.abort();
    }

    #[tokio::test]
    async fn test_open_fails_after_carrier_drops() {
        let (client_io, server_io) = duplex(4096);
        let client = MuxSession::client(client_io.compat());
        let server = MuxSession::server(server_io.compat());

        drop(server);
        // give the client driver a chance to observe the closed carrier
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match client.open_stream().await {
                Err(_) => break,
                Ok(_) if attempts > 10 => panic!("carrier loss never surfaced"),
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
    }

    #[tokio::test]
    async fn test_stream_relays_to_byte_stream() {
        let (client_io, server_io) = duplex(4096);
        let client = MuxSession::client(client_io.compat());
        let server = MuxSession::server(server_io.compat());

        // server: relay the first accepted stream against an in-memory upstream
        let (upstream, upstream_peer) = duplex(4096);
        let acceptor = tokio::spawn(async move {
            let stream = server.accept_stream().await.unwrap();
            relay_bidirectional(stream, upstream_peer).await;
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let mut got = [0u8; 4];
        up_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        up_write.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(stream);
        drop(up_write);
        drop(up_read);
        let _ = acceptor.await;
    }
}
