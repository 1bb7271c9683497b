//! TLS termination for the secure WebSocket transports.

use anyhow::Result;
use axum::body::Body;
use axum::Router;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// WebSocket upgrades ride HTTP/1.1.
static ALPN_H1: &[&[u8]] = &[b"http/1.1"];

/// Load TLS configuration from certificate and key files.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_H1.iter().map(|p| p.to_vec()).collect();

    info!("TLS configuration loaded from {}", cert_path);
    Ok(Arc::new(config))
}

/// Load certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(Path::new(path))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> =
        certs(&mut reader).filter_map(|cert| cert.ok()).collect();

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))?;
    let mut reader = BufReader::new(file);

    let key = private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))?;
    Ok(key)
}

/// Serve an axum router over TLS, supporting WebSocket upgrades.
pub async fn serve_with_tls(
    listener: TcpListener,
    app: Router,
    cert_path: &str,
    key_path: &str,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(load_tls_config(cert_path, key_path)?);

    loop {
        let (tcp_stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake failed from {}: {}", remote_addr, e);
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let (parts, body) = req.into_parts();
                let req = Request::from_parts(parts, Body::new(body));

                let app = app.clone();
                async move {
                    let resp = app.oneshot(req).await?;
                    Ok::<_, Infallible>(resp)
                }
            });

            let builder = AutoBuilder::new(TokioExecutor::new());
            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                debug!("Connection error from {}: {}", remote_addr, e);
            }
        });
    }
}
