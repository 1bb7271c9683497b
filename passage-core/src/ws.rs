//! WebSocket byte-stream adapter.
//!
//! Presents a message-framed WebSocket as an ordered byte stream so that
//! stream-oriented consumers (the mux layer, the relay primitive) can read
//! from it. Reads drain the current binary frame and then advance to the
//! next one; frame end is not surfaced as an error. Each write is sent as a
//! single binary frame. Non-binary frames are skipped; a close frame reads
//! as end-of-stream.
//!
//! The adapter is generic over the concrete message type, since the server
//! and client sides of this workspace use different WebSocket stacks.

use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What a received WebSocket frame means to the byte stream.
pub enum Frame {
    /// Binary payload to surface to the reader.
    Data(Vec<u8>),
    /// Frame with no byte-stream meaning (text, ping, pong).
    Ignore,
    /// Close frame; the byte stream is at end-of-stream.
    Close,
}

/// Implemented for the message types of the WebSocket stacks in use.
pub trait WsMessage: Sized + Send + 'static {
    /// Build a binary frame carrying `data`.
    fn binary(data: Vec<u8>) -> Self;

    /// Classify a received frame.
    fn into_frame(self) -> Frame;
}

/// A WebSocket connection viewed as a byte stream.
pub struct WsByteStream<S, M> {
    inner: S,
    chunk: Vec<u8>,
    pos: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<S, M, E> WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            chunk: Vec::new(),
            pos: 0,
            _marker: PhantomData,
        }
    }
}

fn to_io<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<S, M, E> AsyncRead for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.chunk.len() {
                let n = buf.remaining().min(this.chunk.len() - this.pos);
                buf.put_slice(&this.chunk[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg.into_frame() {
                    Frame::Data(data) => {
                        this.chunk = data;
                        this.pos = 0;
                    }
                    Frame::Ignore => {}
                    Frame::Close => return Poll::Ready(Ok(())),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut this.inner)
                    .start_send(M::binary(buf.to_vec()))
                    .map_err(to_io)?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(to_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(to_io)
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        axum::extract::ws::Message::Binary(data)
    }

    fn into_frame(self) -> Frame {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(data) => Frame::Data(data),
            Message::Close(_) => Frame::Close,
            Message::Text(_) | Message::Ping(_) | Message::Pong(_) => Frame::Ignore,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        tokio_tungstenite::tungstenite::Message::Binary(data)
    }

    fn into_frame(self) -> Frame {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(data) => Frame::Data(data),
            Message::Close(_) => Frame::Close,
            Message::Text(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                Frame::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug, PartialEq)]
    enum TestMsg {
        Binary(Vec<u8>),
        Text(String),
        Close,
    }

    impl WsMessage for TestMsg {
        fn binary(data: Vec<u8>) -> Self {
            TestMsg::Binary(data)
        }

        fn into_frame(self) -> Frame {
            match self {
                TestMsg::Binary(data) => Frame::Data(data),
                TestMsg::Text(_) => Frame::Ignore,
                TestMsg::Close => Frame::Close,
            }
        }
    }

    /// In-memory carrier: pops inbound frames from a queue, collects sends.
    struct TestCarrier {
        inbound: VecDeque<TestMsg>,
        sent: Vec<TestMsg>,
    }

    impl Stream for TestCarrier {
        type Item = Result<TestMsg, std::io::Error>;

        fn poll_next(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.get_mut().inbound.pop_front().map(Ok))
        }
    }

    impl Sink<TestMsg> for TestCarrier {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: TestMsg) -> Result<(), Self::Error> {
            self.get_mut().sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_spans_frames() {
        let carrier = TestCarrier {
            inbound: VecDeque::from([
                TestMsg::Binary(b"hel".to_vec()),
                TestMsg::Binary(b"lo".to_vec()),
            ]),
            sent: Vec::new(),
        };
        let mut stream = WsByteStream::new(carrier);

        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn test_non_binary_frames_are_skipped() {
        let carrier = TestCarrier {
            inbound: VecDeque::from([
                TestMsg::Text("keepalive".to_string()),
                TestMsg::Binary(b"data".to_vec()),
            ]),
            sent: Vec::new(),
        };
        let mut stream = WsByteStream::new(carrier);

        let mut got = [0u8; 4];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"data");
    }

    #[tokio::test]
    async fn test_close_frame_is_eof() {
        let carrier = TestCarrier {
            inbound: VecDeque::from([TestMsg::Binary(b"x".to_vec()), TestMsg::Close]),
            sent: Vec::new(),
        };
        let mut stream = WsByteStream::new(carrier);

        let mut sink = Vec::new();
        let n = stream.read_to_end(&mut sink).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(sink, b"x");
    }

    #[tokio::test]
    async fn test_write_sends_one_binary_frame() {
        let carrier = TestCarrier {
            inbound: VecDeque::new(),
            sent: Vec::new(),
        };
        let mut stream = WsByteStream::new(carrier);

        stream.write_all(b"payload").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(stream.inner.sent, vec![TestMsg::Binary(b"payload".to_vec())]);
    }
}
