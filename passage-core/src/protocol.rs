//! Control-channel wire protocol.
//!
//! The server drives the client over a single long-lived TCP connection
//! carrying concatenated JSON objects with no framing delimiter. The only
//! recognized command is `start_transport`; its payload is a nested JSON
//! string naming the transport and data port.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, RelayResult};

/// The command instructing the client to spawn a data forwarder.
pub const CMD_START_TRANSPORT: &str = "start_transport";

/// A control-channel message.
///
/// `payload` is an opaque string; for `start_transport` it contains a nested
/// JSON [`TransportConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub command: String,
    pub payload: String,
}

impl Message {
    /// Build a `start_transport` message carrying the given transport config.
    pub fn start_transport(config: &TransportConfig) -> serde_json::Result<Self> {
        Ok(Self {
            command: CMD_START_TRANSPORT.to_string(),
            payload: serde_json::to_string(config)?,
        })
    }

    /// Decode the payload as a transport config.
    pub fn transport_config(&self) -> serde_json::Result<TransportConfig> {
        serde_json::from_str(&self.payload)
    }
}

/// The payload of a `start_transport` command.
///
/// `protocol` stays a plain string on the wire so that unrecognized transport
/// tags can be ignored instead of failing the whole control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub protocol: String,
    pub port: String,
}

/// The eight named transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Ws,
    TcpMux,
    WsMux,
    Wss,
    WssMux,
    UtcpMux,
}

impl Transport {
    /// All transports, in operator menu order.
    pub const ALL: [Transport; 8] = [
        Transport::Tcp,
        Transport::Udp,
        Transport::Ws,
        Transport::TcpMux,
        Transport::WsMux,
        Transport::Wss,
        Transport::WssMux,
        Transport::UtcpMux,
    ];

    /// The wire tag used in control payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Ws => "ws",
            Transport::TcpMux => "tcpmux",
            Transport::WsMux => "wsmux",
            Transport::Wss => "wss",
            Transport::WssMux => "wssmux",
            Transport::UtcpMux => "utcpmux",
        }
    }

    /// Parse a wire tag.
    pub fn parse(s: &str) -> Option<Transport> {
        match s {
            "tcp" => Some(Transport::Tcp),
            "udp" => Some(Transport::Udp),
            "ws" => Some(Transport::Ws),
            "tcpmux" => Some(Transport::TcpMux),
            "wsmux" => Some(Transport::WsMux),
            "wss" => Some(Transport::Wss),
            "wssmux" => Some(Transport::WssMux),
            "utcpmux" => Some(Transport::UtcpMux),
            _ => None,
        }
    }

    /// The key under which the server config maps this transport to a port.
    pub fn data_port_key(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Ws => "WS",
            Transport::TcpMux => "TCPMux",
            Transport::WsMux => "WSMux",
            Transport::Wss => "WSS",
            Transport::WssMux => "WSSMux",
            Transport::UtcpMux => "UTCPMux",
        }
    }

    /// The HTTP upgrade path for WebSocket-carried transports.
    pub fn ws_path(&self) -> Option<&'static str> {
        match self {
            Transport::Ws => Some("/ws"),
            Transport::WsMux => Some("/wsmux"),
            Transport::Wss => Some("/wss"),
            Transport::WssMux => Some("/wssmux"),
            _ => None,
        }
    }

    /// Whether the carrier hosts multiplexed logical streams.
    pub fn uses_mux(&self) -> bool {
        matches!(
            self,
            Transport::TcpMux | Transport::WsMux | Transport::WssMux | Transport::UtcpMux
        )
    }

    /// Whether the carrier is wrapped in TLS.
    pub fn uses_tls(&self) -> bool {
        matches!(self, Transport::Wss | Transport::WssMux)
    }

    /// The label shown in the operator menu.
    pub fn menu_label(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Ws => "WebSocket (WS)",
            Transport::TcpMux => "TCPMux",
            Transport::WsMux => "WSMux",
            Transport::Wss => "WebSocket Secure (WSS)",
            Transport::WssMux => "WSSMux",
            Transport::UtcpMux => "UTCPMux (KCP)",
        }
    }

    /// Map an operator menu choice (`"1"`..`"8"`) to a transport.
    pub fn from_menu_choice(choice: &str) -> Option<Transport> {
        let n: usize = choice.trim().parse().ok()?;
        Transport::ALL.get(n.checked_sub(1)?).copied()
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incremental decoder for a stream of concatenated JSON messages.
///
/// Objects are self-delimiting; there is no length prefix and no newline
/// requirement. Partial objects are kept buffered until the rest arrives.
pub struct JsonStreamDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> JsonStreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next message, or `None` on clean end of stream.
    pub async fn next_message(&mut self) -> RelayResult<Option<Message>> {
        loop {
            if !self.buf.is_empty() {
                let mut iter =
                    serde_json::Deserializer::from_slice(&self.buf).into_iter::<Message>();
                match iter.next() {
                    Some(Ok(msg)) => {
                        let consumed = iter.byte_offset();
                        self.buf.advance(consumed);
                        return Ok(Some(msg));
                    }
                    Some(Err(e)) if e.is_eof() => {}
                    Some(Err(e)) => {
                        return Err(
                            RelayError::protocol("malformed control message").with_source(e)
                        );
                    }
                    None => {}
                }
            }

            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(RelayError::from)?;
            if n == 0 {
                return if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    Ok(None)
                } else {
                    Err(RelayError::protocol("control stream ended mid-message"))
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::start_transport(&TransportConfig {
            protocol: "tcp".to_string(),
            port: "9001".to_string(),
        })
        .unwrap();
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);

        let config = decoded.transport_config().unwrap();
        assert_eq!(config.protocol, "tcp");
        assert_eq!(config.port, "9001");
    }

    #[test]
    fn test_payload_is_nested_json() {
        let msg = Message::start_transport(&TransportConfig {
            protocol: "wsmux".to_string(),
            port: "8443".to_string(),
        })
        .unwrap();
        assert!(msg.payload.contains("\"protocol\":\"wsmux\""));
        assert!(msg.payload.contains("\"port\":\"8443\""));
    }

    #[test]
    fn test_transport_tags() {
        for transport in Transport::ALL {
            assert_eq!(Transport::parse(transport.as_str()), Some(transport));
        }
        assert_eq!(Transport::parse("quic"), None);
    }

    #[test]
    fn test_menu_choices() {
        assert_eq!(Transport::from_menu_choice("1"), Some(Transport::Tcp));
        assert_eq!(Transport::from_menu_choice(" 8 "), Some(Transport::UtcpMux));
        assert_eq!(Transport::from_menu_choice("0"), None);
        assert_eq!(Transport::from_menu_choice("9"), None);
        assert_eq!(Transport::from_menu_choice("x"), None);
    }

    #[test]
    fn test_ws_paths() {
        assert_eq!(Transport::Ws.ws_path(), Some("/ws"));
        assert_eq!(Transport::WssMux.ws_path(), Some("/wssmux"));
        assert_eq!(Transport::Tcp.ws_path(), None);
        assert!(Transport::UtcpMux.uses_mux());
        assert!(!Transport::Wss.uses_mux());
        assert!(Transport::Wss.uses_tls());
    }

    #[tokio::test]
    async fn test_decoder_concatenated_objects() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let a = Message {
            command: "start_transport".to_string(),
            payload: "{\"protocol\":\"tcp\",\"port\":\"9001\"}".to_string(),
        };
        let b = Message {
            command: "noop".to_string(),
            payload: String::new(),
        };
        let mut wire = serde_json::to_vec(&a).unwrap();
        wire.extend(serde_json::to_vec(&b).unwrap());
        tx.write_all(&wire).await.unwrap();
        drop(tx);

        let mut decoder = JsonStreamDecoder::new(rx);
        assert_eq!(decoder.next_message().await.unwrap(), Some(a));
        assert_eq!(decoder.next_message().await.unwrap(), Some(b));
        assert_eq!(decoder.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decoder_partial_reads() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let msg = Message {
            command: "start_transport".to_string(),
            payload: "{\"protocol\":\"udp\",\"port\":\"9002\"}".to_string(),
        };
        let wire = serde_json::to_vec(&msg).unwrap();
        let (head, tail) = wire.split_at(wire.len() / 2);

        let mut decoder = JsonStreamDecoder::new(rx);
        tx.write_all(head).await.unwrap();
        tx.flush().await.unwrap();

        let tail_owned = tail.to_vec();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.write_all(&tail_owned).await.unwrap();
            drop(tx);
        });

        assert_eq!(decoder.next_message().await.unwrap(), Some(msg));
        assert_eq!(decoder.next_message().await.unwrap(), None);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_decoder_truncated_stream_is_error() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"{\"command\":\"start").await.unwrap();
        drop(tx);

        let mut decoder = JsonStreamDecoder::new(rx);
        assert!(decoder.next_message().await.is_err());
    }
}
