//! QUIC stream implementation

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tunproxy_transport::{TransportError, TransportResult, TransportStream};

/// QUIC bidirectional stream
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
        }
    }

    /// Split the stream into separate send and receive halves
    ///
    /// The halves can be moved into different tasks without locking.
    pub fn split(self) -> (QuicSendHalf, QuicRecvHalf) {
        (
            QuicSendHalf {
                send: self.send,
                stream_id: self.stream_id,
            },
            QuicRecvHalf {
                recv: self.recv,
                stream_id: self.stream_id,
            },
        )
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().map_err(|_| TransportError::StreamClosed)
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Send half of a split QUIC stream
#[derive(Debug)]
pub struct QuicSendHalf {
    send: SendStream,
    stream_id: u64,
}

impl QuicSendHalf {
    /// Close the sending side
    pub fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().map_err(|_| TransportError::StreamClosed)
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl AsyncWrite for QuicSendHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Receive half of a split QUIC stream
#[derive(Debug)]
pub struct QuicRecvHalf {
    recv: RecvStream,
    stream_id: u64,
}

impl QuicRecvHalf {
    /// Abandon the receiving side, telling the peer to stop sending
    pub fn stop(&mut self) {
        let _ = self.recv.stop(0u32.into());
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl AsyncRead for QuicRecvHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}
