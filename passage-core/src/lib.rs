//! Core engine for the passage tunneling relay.
//!
//! This crate provides everything shared between the relay server and client:
//! the control-channel wire protocol, the transport descriptor, the pooled
//! byte-relay primitive, the UDP session table, the WebSocket byte-stream
//! adapter, the mux session layer and the KCP tuning block.

pub mod buffer;
pub mod error;
pub mod kcp;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod udp;
pub mod ws;

pub use buffer::{BufferPool, PoolStats, RELAY_BUFFER_SIZE, UDP_BUFFER_SIZE, WS_BUFFER_SIZE};
pub use error::{ErrorKind, RelayError, RelayResult};
pub use kcp::KcpTuning;
pub use mux::{MuxSession, MuxStream};
pub use protocol::{JsonStreamDecoder, Message, Transport, TransportConfig, CMD_START_TRANSPORT};
pub use relay::{copy_half, relay_bidirectional};
pub use udp::SessionTable;
pub use ws::{Frame, WsByteStream, WsMessage};
