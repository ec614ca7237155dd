use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::trace;

/// This is an abstraction for writing packed messages to a connection, introduced to decouple
///  endpoints from the kind of socket and to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireSink: Send + Sync + 'static {
    /// `peer` is the destination of messages on connectionless transports, `None` meaning 'the
    ///  default / connected peer'
    async fn write_frame(&self, peer: Option<SocketAddr>, frame: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    /// Whether a failed write breaks the connection. Connectionless sinks return `false`: a
    ///  datagram that can not be sent is lost, but later datagrams may well go through.
    fn write_errors_are_fatal(&self) -> bool {
        true
    }
}

/// A sink writing to a byte stream, typically the write half of a TCP connection
pub struct StreamSink<W> {
    writer: Mutex<W>,
}

impl <W: AsyncWrite + Send + Unpin + 'static> StreamSink<W> {
    pub fn new(writer: W) -> StreamSink<W> {
        StreamSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl <W: AsyncWrite + Send + Unpin + 'static> WireSink for StreamSink<W> {
    async fn write_frame(&self, _peer: Option<SocketAddr>, frame: &[u8]) -> io::Result<()> {
        self.writer.lock().await
            .write_all(frame).await
    }

    async fn flush(&self) -> io::Result<()> {
        self.writer.lock().await
            .flush().await
    }
}

/// A sink sending each message as a UDP datagram
pub struct DatagramSink {
    socket: Arc<UdpSocket>,
    default_peer: Option<SocketAddr>,
}

impl DatagramSink {
    pub fn new(socket: Arc<UdpSocket>, default_peer: Option<SocketAddr>) -> DatagramSink {
        DatagramSink {
            socket,
            default_peer,
        }
    }
}

#[async_trait]
impl WireSink for DatagramSink {
    async fn write_frame(&self, peer: Option<SocketAddr>, frame: &[u8]) -> io::Result<()> {
        let Some(to) = peer.or(self.default_peer) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram without destination and no default peer"));
        };

        trace!("UDP socket: sending {} bytes to {:?}", frame.len(), to);
        let sent = self.socket.send_to(frame, to).await?;
        if sent != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, format!("datagram truncated: {} of {} bytes sent", sent, frame.len())));
        }
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn write_errors_are_fatal(&self) -> bool {
        false
    }
}
