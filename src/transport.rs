//! TCP transport: listening, dialing and framed connections.
//!
//! An [`Endpoint`] carries the connection settings shared by every socket a node opens. Listening yields an
//! [`Incoming`] stream of accepted [`Connection`]s; dialing yields a single one. Either way a connection speaks
//! length-prefixed [`WireMessage`] frames.

use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time,
};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::debug;

use crate::{
    address::Address,
    error::{MembershipError, Result},
    wire::{self, WireMessage, DEFAULT_MAX_FRAME_LEN},
};

/// Default time allowed to establish a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for opening and accepting connections.
#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl Endpoint {
    /// Creates an endpoint with the given dial timeout and frame size limit.
    pub fn new(connect_timeout: Duration, max_frame_len: usize) -> Self {
        Endpoint {
            connect_timeout,
            max_frame_len,
        }
    }

    /// Time allowed for a dial to complete.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Binds a listener on `address`.
    ///
    /// Binding port 0 picks a free port; [`Incoming::local_address`] reports the one actually bound, with the
    /// host as requested.
    pub async fn listen(&self, address: &Address) -> Result<Incoming> {
        let listener = TcpListener::bind((address.host(), address.port())).await?;
        let bound = listener.local_addr()?;
        let local = address.with_port(bound.port());
        debug!(%local, "listening");

        Ok(Incoming {
            inner: TcpListenerStream::new(listener),
            local,
            max_frame_len: self.max_frame_len,
        })
    }

    /// Opens a connection to `address`, failing with [`MembershipError::Timeout`] after the connect timeout.
    pub async fn dial(&self, address: &Address) -> Result<Connection> {
        let stream = time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host(), address.port())),
        )
        .await
        .map_err(|_| {
            debug!(peer = %address, timeout = ?self.connect_timeout, "dial timed out");
            MembershipError::Timeout
        })??;

        Connection::new(stream, self.max_frame_len)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_LEN)
    }
}

/// A stream of accepted connections.
#[derive(Debug)]
pub struct Incoming {
    inner: TcpListenerStream,
    local: Address,
    max_frame_len: usize,
}

impl Incoming {
    /// The address this listener is reachable at.
    pub fn local_address(&self) -> &Address {
        &self.local
    }
}

impl Stream for Incoming {
    type Item = Result<Connection>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let max_frame_len = self.max_frame_len;
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                Poll::Ready(Some(Connection::new(stream, max_frame_len)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A framed TCP connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    remote: SocketAddr,
    max_frame_len: usize,
}

impl Connection {
    fn new(stream: TcpStream, max_frame_len: usize) -> Result<Self> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        Ok(Connection {
            stream,
            remote,
            max_frame_len,
        })
    }

    /// The socket address of the other end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Sends one message.
    pub async fn send(&mut self, msg: &WireMessage) -> Result<()> {
        wire::write_frame(&mut self.stream, msg).await
    }

    /// Receives one message, or `None` if the remote closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        wire::read_frame(&mut self.stream, self.max_frame_len).await
    }

    /// Receives one message within `timeout`. A closed connection is an error here.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<WireMessage> {
        time::timeout(timeout, self.recv())
            .await
            .map_err(|_| MembershipError::Timeout)??
            .ok_or(MembershipError::ConnectionClosed)
    }

    /// Sends `msg` and waits up to `timeout` for the reply.
    pub async fn request(&mut self, msg: &WireMessage, timeout: Duration) -> Result<WireMessage> {
        self.send(msg).await?;
        self.recv_timeout(timeout).await
    }

    /// Splits the connection so that reading and writing can happen in separate tasks.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (reader, writer) = self.stream.into_split();
        (
            FrameReader {
                inner: reader,
                max_frame_len: self.max_frame_len,
            },
            FrameWriter { inner: writer },
        )
    }
}

/// Read half of a split [`Connection`].
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
    max_frame_len: usize,
}

impl FrameReader {
    /// Receives one message, or `None` if the remote closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        wire::read_frame(&mut self.inner, self.max_frame_len).await
    }
}

/// Write half of a split [`Connection`].
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    /// Sends one message.
    pub async fn send(&mut self, msg: &WireMessage) -> Result<()> {
        wire::write_frame(&mut self.inner, msg).await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn localhost() -> Address {
        Address::new("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn listen_reports_bound_port() {
        let endpoint = Endpoint::default();
        let incoming = endpoint.listen(&localhost()).await.unwrap();
        assert_eq!(incoming.local_address().host(), "127.0.0.1");
        assert_ne!(incoming.local_address().port(), 0);
    }

    #[tokio::test]
    async fn request_and_reply_over_loopback() {
        let endpoint = Endpoint::default();
        let mut incoming = endpoint.listen(&localhost()).await.unwrap();
        let address = incoming.local_address().clone();

        tokio::spawn(async move {
            let mut conn = incoming.next().await.unwrap().unwrap();
            while let Some(WireMessage::Ping { nonce }) = conn.recv().await.unwrap() {
                conn.send(&WireMessage::Pong { nonce }).await.unwrap();
            }
        });

        let mut conn = endpoint.dial(&address).await.unwrap();
        let reply = conn
            .request(&WireMessage::Ping { nonce: 3 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, WireMessage::Pong { nonce: 3 });
    }

    #[tokio::test]
    async fn dialing_a_closed_port_fails() {
        let endpoint = Endpoint::default();
        let port = {
            let incoming = endpoint.listen(&localhost()).await.unwrap();
            incoming.local_address().port()
        };

        let err = endpoint
            .dial(&Address::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Network(_)), "{err}");
    }

    #[tokio::test]
    async fn silent_remote_times_out() {
        let endpoint = Endpoint::default();
        let mut incoming = endpoint.listen(&localhost()).await.unwrap();
        let address = incoming.local_address().clone();
        let server = tokio::spawn(async move {
            let conn = incoming.next().await;
            time::sleep(Duration::from_secs(1)).await;
            drop(conn);
        });

        let mut conn = endpoint.dial(&address).await.unwrap();
        let err = conn
            .request(&WireMessage::Ping { nonce: 1 }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Timeout));
        server.abort();
    }

    #[tokio::test]
    async fn split_halves_carry_frames_independently() {
        let endpoint = Endpoint::default();
        let mut incoming = endpoint.listen(&localhost()).await.unwrap();
        let address = incoming.local_address().clone();

        let dialed = endpoint.dial(&address).await.unwrap();
        let accepted = incoming.next().await.unwrap().unwrap();

        let (_, mut writer) = dialed.into_split();
        let (mut reader, _) = accepted.into_split();
        writer.send(&WireMessage::ConnectAccepted).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(WireMessage::ConnectAccepted));

        drop(writer);
        assert_eq!(reader.recv().await.unwrap(), None);
    }
}
